//! Probe and control-channel packet formats.
//!
//! Probe packets are fixed-length UDP datagrams exchanged solely to
//! measure timing; timestamp reports are fixed-length records carried over
//! the TCP control channel. Both use explicit big-endian serialization;
//! bit-exactness is only required between cooperating agents of the same
//! build.

use thiserror::Error;

use crate::time::{Timestamp, TimestampSource};

/// Fixed length of every probe datagram.
pub const DATALEN: usize = 48;

/// Fixed length of every control-channel record.
pub const CONTROL_MSG_LEN: usize = 40;

/// Wire protocol version carried in every packet.
pub const PROTOCOL_VERSION: u8 = 1;

const KIND_PING: u8 = 0;
const KIND_PONG: u8 = 1;
const KIND_TIMESTAMP_REPORT: u8 = 2;

// Serialized header fields must fit the fixed datagram size.
const _: () = assert!(DATALEN >= 20);

/// Deserialization failure for probe or control packets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// The buffer is shorter than the fixed packet length.
    #[error("packet too short: {0} bytes")]
    Truncated(usize),
    /// The packet carries an unsupported protocol version.
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    /// The packet kind byte is not known.
    #[error("unknown packet kind {0}")]
    BadKind(u8),
    /// The timestamp source byte is not known.
    #[error("invalid timestamp source {0}")]
    BadSource(u8),
}

/// Direction of a probe packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Outgoing measurement request.
    Ping,
    /// Reflected answer to a ping.
    Pong,
}

/// A probe payload.
///
/// Wire format (48 octets):
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Version    |     Kind      |              MBZ              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                        Sequence Number                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     Origin Timestamp (s)                      |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     Origin Timestamp (ns)                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         MBZ (28 octets)                       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The origin timestamp is informational: a pong echoes the ping's value
/// unchanged, so a sender can sanity-check which round a late pong belongs
/// to. Measurement instants come from the transceiver, never from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePayload {
    pub kind: ProbeKind,
    pub seq: u32,
    pub origin_seconds: i64,
    pub origin_nanoseconds: u32,
}

impl ProbePayload {
    /// Builds a ping payload for `seq` with its originating timestamp.
    pub fn ping(seq: u32, origin: &Timestamp) -> ProbePayload {
        ProbePayload {
            kind: ProbeKind::Ping,
            seq,
            origin_seconds: origin.seconds,
            origin_nanoseconds: origin.nanoseconds,
        }
    }

    /// Builds the pong answering a ping, echoing its origin timestamp.
    pub fn pong(ping: &ProbePayload) -> ProbePayload {
        ProbePayload {
            kind: ProbeKind::Pong,
            seq: ping.seq,
            origin_seconds: ping.origin_seconds,
            origin_nanoseconds: ping.origin_nanoseconds,
        }
    }

    /// Serializes the payload to a fixed-size buffer in big-endian wire
    /// format.
    pub fn to_bytes(&self) -> [u8; DATALEN] {
        let mut buf = [0u8; DATALEN];
        buf[0] = PROTOCOL_VERSION;
        buf[1] = match self.kind {
            ProbeKind::Ping => KIND_PING,
            ProbeKind::Pong => KIND_PONG,
        };
        buf[4..8].copy_from_slice(&self.seq.to_be_bytes());
        buf[8..16].copy_from_slice(&self.origin_seconds.to_be_bytes());
        buf[16..20].copy_from_slice(&self.origin_nanoseconds.to_be_bytes());
        buf
    }

    /// Deserializes a payload from big-endian wire format.
    ///
    /// # Errors
    /// Returns an error if the buffer is shorter than [`DATALEN`] or the
    /// version or kind byte is not recognized.
    pub fn from_bytes(buf: &[u8]) -> Result<ProbePayload, PacketError> {
        if buf.len() < DATALEN {
            return Err(PacketError::Truncated(buf.len()));
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(PacketError::BadVersion(buf[0]));
        }
        let kind = match buf[1] {
            KIND_PING => ProbeKind::Ping,
            KIND_PONG => ProbeKind::Pong,
            other => return Err(PacketError::BadKind(other)),
        };
        Ok(ProbePayload {
            kind,
            seq: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            origin_seconds: i64::from_be_bytes(buf[8..16].try_into().unwrap()),
            origin_nanoseconds: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

/// The reflector's half of a measurement, exchanged over the TCP control
/// channel: when the reflector saw the ping arrive and when its pong left.
///
/// Wire format (40 octets): version, kind, MBZ, sequence number, then two
/// timestamp blocks of `seconds (8) | nanoseconds (4) | source (1) | MBZ (3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampReport {
    pub seq: u32,
    /// When the ping arrived at the reflector.
    pub rx: Timestamp,
    /// When the reflector's pong left.
    pub tx: Timestamp,
}

impl TimestampReport {
    /// Serializes the report to a fixed-size record in big-endian wire
    /// format.
    pub fn to_bytes(&self) -> [u8; CONTROL_MSG_LEN] {
        let mut buf = [0u8; CONTROL_MSG_LEN];
        buf[0] = PROTOCOL_VERSION;
        buf[1] = KIND_TIMESTAMP_REPORT;
        buf[4..8].copy_from_slice(&self.seq.to_be_bytes());
        write_timestamp(&mut buf[8..24], &self.rx);
        write_timestamp(&mut buf[24..40], &self.tx);
        buf
    }

    /// Deserializes a report from big-endian wire format.
    ///
    /// # Errors
    /// Returns an error if the record is short or any of the version,
    /// kind, or timestamp-source bytes is not recognized. Callers treat
    /// this as a protocol fault and reset the control connection.
    pub fn from_bytes(buf: &[u8]) -> Result<TimestampReport, PacketError> {
        if buf.len() < CONTROL_MSG_LEN {
            return Err(PacketError::Truncated(buf.len()));
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(PacketError::BadVersion(buf[0]));
        }
        if buf[1] != KIND_TIMESTAMP_REPORT {
            return Err(PacketError::BadKind(buf[1]));
        }
        Ok(TimestampReport {
            seq: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            rx: read_timestamp(&buf[8..24])?,
            tx: read_timestamp(&buf[24..40])?,
        })
    }
}

fn write_timestamp(buf: &mut [u8], ts: &Timestamp) {
    buf[0..8].copy_from_slice(&ts.seconds.to_be_bytes());
    buf[8..12].copy_from_slice(&ts.nanoseconds.to_be_bytes());
    buf[12] = match ts.source {
        TimestampSource::Software => 0,
        TimestampSource::Hardware => 1,
        TimestampSource::Unavailable => 2,
    };
}

fn read_timestamp(buf: &[u8]) -> Result<Timestamp, PacketError> {
    let source = match buf[12] {
        0 => TimestampSource::Software,
        1 => TimestampSource::Hardware,
        2 => TimestampSource::Unavailable,
        other => return Err(PacketError::BadSource(other)),
    };
    Ok(Timestamp {
        seconds: i64::from_be_bytes(buf[0..8].try_into().unwrap()),
        nanoseconds: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
        source,
    })
}
