//! SLA Probe - active network performance measurement agent.
//!
//! Cooperating probe agents exchange periodic ping/pong packets over UDP,
//! each tagged with precise send and receive timestamps taken either from
//! the kernel timestamping facility or from a userland clock read just
//! before transmission. The remote half of every measurement travels
//! out-of-band over a per-peer TCP control channel, keeping the
//! latency-sensitive probe traffic free of retransmissions and
//! head-of-line blocking.
//!
//! Kernel timestamping relies on `SO_TIMESTAMPING` and `MSG_ERRQUEUE`;
//! where the facility is unavailable the agent degrades to userland
//! timestamps.
//!
//! # Usage
//!
//! ```bash
//! sla-probed --port 60666 --peer 192.0.2.1:60666 --timestamp-mode kernel
//! ```

/// Probe scheduling and the single-threaded agent event loop.
pub mod agent;
/// Command-line configuration and validation.
pub mod configuration;
/// Dual-stack socket binding and timestamped send/receive primitives.
pub mod net;
/// Probe and control-channel packet formats.
pub mod packets;
/// Completed-sample reporting toward the manager boundary.
pub mod report;
/// Per-peer probe session state machines.
pub mod session;
/// Timestamp representation and kernel timestamp extraction.
pub mod time;
