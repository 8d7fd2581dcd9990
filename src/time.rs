//! Timestamp representation and kernel timestamp extraction.
//!
//! A [`Timestamp`] either comes from a userland clock read (software), from
//! the kernel timestamping facility attached to a received message
//! (software or hardware), or is unavailable. Callers must branch on
//! [`TimestampSource`] before using the value; all arithmetic helpers
//! refuse unavailable operands.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use nix::sys::socket::{ControlMessageOwned, RecvMsg, SockaddrStorage};
use nix::sys::time::TimeSpec;
use serde::Serialize;
use thiserror::Error;

/// Failure to obtain a kernel timestamp from ancillary control data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    /// No timestamping control message was attached to the receive.
    #[error("no timestamp control message present")]
    Missing,
    /// A timestamping control message was attached but carried no value.
    #[error("timestamp control message present but empty")]
    Malformed,
}

/// Where a timestamp value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    /// System clock, read in userland or stamped by the kernel.
    Software,
    /// Network interface clock.
    Hardware,
    /// No timestamp was obtained; the value must not be used.
    Unavailable,
}

impl fmt::Display for TimestampSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TimestampSource::Software => write!(f, "software"),
            TimestampSource::Hardware => write!(f, "hardware"),
            TimestampSource::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// A single measurement instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    /// Nanoseconds within the second.
    pub nanoseconds: u32,
    /// Provenance of the value.
    pub source: TimestampSource,
}

impl Timestamp {
    /// Reads the system real-time clock. Always succeeds.
    pub fn now() -> Timestamp {
        let now = Utc::now();
        Timestamp {
            seconds: now.timestamp(),
            nanoseconds: now.timestamp_subsec_nanos(),
            source: TimestampSource::Software,
        }
    }

    /// A placeholder that must never be used as a measurement instant.
    pub fn unavailable() -> Timestamp {
        Timestamp {
            seconds: 0,
            nanoseconds: 0,
            source: TimestampSource::Unavailable,
        }
    }

    /// Returns true when the value may be used as a measurement instant.
    pub fn is_valid(&self) -> bool {
        self.source != TimestampSource::Unavailable
    }

    /// Elapsed time since `earlier`, or `None` when either operand is
    /// unavailable or `earlier` is not actually earlier.
    pub fn duration_since(&self, earlier: &Timestamp) -> Option<Duration> {
        if !self.is_valid() || !earlier.is_valid() {
            return None;
        }
        let secs = self.seconds.checked_sub(earlier.seconds)?;
        let nanos = i64::from(self.nanoseconds) - i64::from(earlier.nanoseconds);
        let total = secs.checked_mul(1_000_000_000)?.checked_add(nanos)?;
        if total < 0 {
            return None;
        }
        Some(Duration::from_nanos(total as u64))
    }

    /// Extracts the kernel-attached timestamp from a just-completed
    /// receive or error-queue operation.
    pub fn extract(msg: &RecvMsg<SockaddrStorage>) -> Result<Timestamp, TimestampError> {
        let cmsgs = msg.cmsgs().map_err(|_| TimestampError::Missing)?;

        for cmsg in cmsgs {
            if let ControlMessageOwned::ScmTimestampsns(stamps) = cmsg {
                return classify(stamps.system, stamps.hw_raw);
            }
        }

        Err(TimestampError::Missing)
    }

    fn from_timespec(ts: TimeSpec, source: TimestampSource) -> Timestamp {
        Timestamp {
            seconds: ts.tv_sec(),
            nanoseconds: ts.tv_nsec() as u32,
            source,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.source {
            TimestampSource::Unavailable => write!(f, "unavailable"),
            _ => write!(f, "{}.{:09} ({})", self.seconds, self.nanoseconds, self.source),
        }
    }
}

/// Classifies a timestamping control entry. The raw-hardware slot is only
/// populated when the interface stamped the packet, and wins over the
/// software slot when both are present.
fn classify(system: TimeSpec, hw_raw: TimeSpec) -> Result<Timestamp, TimestampError> {
    if hw_raw.tv_sec() != 0 || hw_raw.tv_nsec() != 0 {
        return Ok(Timestamp::from_timespec(hw_raw, TimestampSource::Hardware));
    }
    if system.tv_sec() != 0 || system.tv_nsec() != 0 {
        return Ok(Timestamp::from_timespec(system, TimestampSource::Software));
    }
    Err(TimestampError::Malformed)
}
