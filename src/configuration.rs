//! Command-line configuration and validation.
//!
//! The configuration is parsed once at startup, validated, and then passed
//! by reference into each component as an immutable snapshot. Nothing here
//! changes during a run.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

pub use clap::Parser;
use clap::ValueEnum;
use thiserror::Error;

/// Rejected configuration input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("probe interval must be greater than zero")]
    ZeroInterval,
    #[error("completion timeout must be at least the probe interval")]
    TimeoutTooShort,
    #[error("in-flight sample limit must be greater than zero")]
    ZeroInFlightLimit,
    #[error("duplicate peer address {0}")]
    DuplicatePeer(SocketAddr),
}

/// How probe packets obtain their transmit timestamp.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, ValueEnum)]
pub enum TimestampMode {
    /// Read the system clock immediately before each send syscall.
    /// Understates latency by the time spent in the kernel send path.
    #[value(name = "userland")]
    Userland,
    /// Use the kernel timestamping facility; the transmit timestamp
    /// arrives asynchronously on the socket error queue. Falls back to
    /// userland mode when the facility is unavailable.
    #[default]
    #[value(name = "kernel")]
    Kernel,
}

impl fmt::Display for TimestampMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TimestampMode::Userland => write!(f, "userland"),
            TimestampMode::Kernel => write!(f, "kernel"),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "sla-probed", version, about, long_about = None)]
pub struct Configuration {
    /// UDP and TCP port to bind, dual-stack, on the wildcard address
    #[arg(short, long, default_value_t = 60666)]
    pub port: u16,

    /// Timestamping mode for probe packets
    #[arg(short, long, value_enum, default_value_t = TimestampMode::Kernel)]
    pub timestamp_mode: TimestampMode,

    /// Interval between probe rounds, in milliseconds
    #[arg(short = 'i', long, default_value_t = 100)]
    pub probe_interval: u64,

    /// Deadline for a measurement round to complete, in milliseconds
    #[arg(short = 'c', long, default_value_t = 500)]
    pub completion_timeout: u64,

    /// Bounded wait for a kernel transmit timestamp, in milliseconds
    #[arg(long, default_value_t = 200)]
    pub tx_timestamp_timeout: u64,

    /// Maximum number of in-flight samples per peer
    #[arg(long, default_value_t = 256)]
    pub max_in_flight: usize,

    /// Peer probe endpoint (host:port); may be given multiple times.
    /// With no peers the agent only answers probes.
    #[arg(short = 'P', long = "peer")]
    pub peers: Vec<SocketAddr>,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.probe_interval == 0 {
            return Err(ConfigurationError::ZeroInterval);
        }
        if self.completion_timeout < self.probe_interval {
            return Err(ConfigurationError::TimeoutTooShort);
        }
        if self.max_in_flight == 0 {
            return Err(ConfigurationError::ZeroInFlightLimit);
        }
        for (i, peer) in self.peers.iter().enumerate() {
            if self.peers[..i].contains(peer) {
                return Err(ConfigurationError::DuplicatePeer(*peer));
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout)
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timestamp_timeout)
    }
}
