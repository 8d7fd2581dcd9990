//! Completed-sample reporting toward the manager boundary.
//!
//! The event loop hands finished measurements to a [`Reporter`] and moves
//! on; buffering and forwarding are the reporter's problem. The bundled
//! implementation pushes samples onto an unbounded channel so `submit`
//! can never block the loop.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::time::Timestamp;

/// One timestamp-annotated measurement round for a given sequence number.
/// Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    /// Peer the round was measured against.
    pub peer: SocketAddr,
    /// Sequence number of the round.
    pub seq: u32,
    /// When the ping left this agent.
    pub local_tx: Timestamp,
    /// When the pong arrived back, if it did.
    pub local_rx: Option<Timestamp>,
    /// When the ping arrived at the peer, per its timestamp report.
    pub remote_rx: Option<Timestamp>,
    /// When the peer's pong left, per its timestamp report.
    pub remote_tx: Option<Timestamp>,
    /// True when both local and remote timestamp sets were recorded
    /// before the deadline; false for evicted (lost/incomplete) rounds.
    pub complete: bool,
}

impl Sample {
    /// Round-trip time as seen by this agent, when both local instants
    /// are usable.
    pub fn rtt(&self) -> Option<Duration> {
        self.local_rx.as_ref()?.duration_since(&self.local_tx)
    }

    /// Time the peer spent holding the packet between receiving the ping
    /// and sending the pong.
    pub fn turnaround(&self) -> Option<Duration> {
        self.remote_tx.as_ref()?.duration_since(self.remote_rx.as_ref()?)
    }

    /// Round-trip time with the peer's turnaround subtracted, i.e. the
    /// portion actually spent on the network.
    pub fn network_delay(&self) -> Option<Duration> {
        self.rtt()?.checked_sub(self.turnaround()?)
    }
}

/// Sink for completed samples. `submit` is fire-and-forget and must not
/// block the event loop.
pub trait Reporter: Send + Sync {
    fn submit(&self, sample: Sample);
}

/// Reporter backed by an unbounded channel; the receiving half is drained
/// outside the event loop.
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<Sample>,
}

impl ChannelReporter {
    pub fn new() -> (ChannelReporter, mpsc::UnboundedReceiver<Sample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelReporter { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn submit(&self, sample: Sample) {
        if self.tx.send(sample).is_err() {
            log::debug!("sample receiver gone, dropping sample");
        }
    }
}
