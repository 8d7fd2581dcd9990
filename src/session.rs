//! Per-peer probe session state machines.
//!
//! [`ProbeSession`] tracks the rounds this agent originated: every sent
//! ping gets an in-flight entry that collects its four timestamps and
//! either completes or is evicted at its deadline. The kernel delivers
//! transmit timestamps asynchronously on the error queue, so "timestamp
//! pending" is an explicit phase polled by the event loop rather than a
//! blocking wait.
//!
//! [`Responder`] is the mirror image for rounds the peer originated:
//! after a pong goes out, its transmit timestamp may still be pending;
//! once settled (or given up on) the pair of reflector timestamps is
//! shipped back over the control channel as a [`TimestampReport`].
//!
//! Both tables are bounded; reaching the bound drops the oldest entry.
//! Everything here is pure state driven by explicit instants, so the
//! transitions are testable without sockets.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::net::TxTimestamp;
use crate::packets::TimestampReport;
use crate::report::Sample;
use crate::time::Timestamp;

/// Session tuning, copied once from the process configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Bound on in-flight entries per table.
    pub max_in_flight: usize,
    /// Deadline for a round to complete.
    pub completion_timeout: Duration,
    /// Bounded wait for a kernel transmit timestamp.
    pub tx_timestamp_timeout: Duration,
}

/// Progress of an in-flight round. Completed and evicted rounds leave the
/// table, so only the waiting phases are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplePhase {
    /// Sent in kernel mode; the transmit timestamp has not yet arrived on
    /// the error queue.
    TxPending,
    /// Transmit timestamp settled; waiting for the pong and/or the peer's
    /// timestamp report.
    AwaitingRemote,
}

/// Per-session event counters, reported periodically.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionCounters {
    pub sent: u64,
    pub send_errors: u64,
    pub completed: u64,
    pub evicted: u64,
    pub tx_timestamp_timeouts: u64,
    pub rx_timestamp_missing: u64,
    pub unmatched: u64,
}

struct InFlight {
    phase: SamplePhase,
    local_tx: Timestamp,
    local_rx: Option<Timestamp>,
    remote_rx: Option<Timestamp>,
    remote_tx: Option<Timestamp>,
    sent_at: Instant,
    deadline: Instant,
}

/// Sender-side state for one peer.
pub struct ProbeSession {
    peer: SocketAddr,
    next_seq: u32,
    in_flight: HashMap<u32, InFlight>,
    order: VecDeque<u32>,
    config: SessionConfig,
    pub counters: SessionCounters,
}

impl ProbeSession {
    pub fn new(peer: SocketAddr, config: SessionConfig) -> ProbeSession {
        ProbeSession {
            peer,
            next_seq: 0,
            in_flight: HashMap::new(),
            order: VecDeque::new(),
            config,
            counters: SessionCounters::default(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Allocates the next sequence number.
    pub fn next_sequence(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Records a sent ping. Userland sends settle their transmit
    /// timestamp immediately; kernel sends park in the pending phase
    /// until the error queue delivers. If the table is full the oldest
    /// round is evicted first and returned as an incomplete sample.
    pub fn record_sent(&mut self, seq: u32, tx: TxTimestamp, now: Instant) -> Option<Sample> {
        let evicted = if self.in_flight.len() >= self.config.max_in_flight {
            self.evict_oldest()
        } else {
            None
        };

        let (phase, local_tx) = match tx {
            TxTimestamp::Immediate(ts) => (SamplePhase::AwaitingRemote, ts),
            TxTimestamp::Pending => (SamplePhase::TxPending, Timestamp::unavailable()),
        };
        self.in_flight.insert(
            seq,
            InFlight {
                phase,
                local_tx,
                local_rx: None,
                remote_rx: None,
                remote_tx: None,
                sent_at: now,
                deadline: now + self.config.completion_timeout,
            },
        );
        self.order.push_back(seq);
        self.counters.sent += 1;
        evicted
    }

    /// Resolves a pending transmit timestamp from an error-queue
    /// completion. The first completion wins; anything later is ignored.
    pub fn record_tx_timestamp(&mut self, seq: u32, ts: Timestamp) -> Option<Sample> {
        match self.in_flight.get_mut(&seq) {
            Some(entry) if entry.phase == SamplePhase::TxPending => {
                entry.local_tx = ts;
                entry.phase = SamplePhase::AwaitingRemote;
                self.try_complete(seq)
            }
            Some(_) => None,
            None => {
                self.counters.unmatched += 1;
                None
            }
        }
    }

    /// Records the pong for a round, with its local receive timestamp.
    pub fn record_pong(&mut self, seq: u32, rx: Timestamp) -> Option<Sample> {
        match self.in_flight.get_mut(&seq) {
            Some(entry) => {
                entry.local_rx = Some(rx);
                self.try_complete(seq)
            }
            None => {
                self.counters.unmatched += 1;
                None
            }
        }
    }

    /// Records the peer's timestamp report for a round.
    pub fn record_remote(&mut self, seq: u32, rx: Timestamp, tx: Timestamp) -> Option<Sample> {
        match self.in_flight.get_mut(&seq) {
            Some(entry) => {
                entry.remote_rx = Some(rx);
                entry.remote_tx = Some(tx);
                self.try_complete(seq)
            }
            None => {
                self.counters.unmatched += 1;
                None
            }
        }
    }

    /// Settles overdue transmit timestamps and evicts rounds past their
    /// completion deadline. Returns every sample produced, complete or
    /// not.
    pub fn sweep(&mut self, now: Instant) -> Vec<Sample> {
        let mut out = Vec::new();

        let stale_tx: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, e)| {
                e.phase == SamplePhase::TxPending
                    && now.saturating_duration_since(e.sent_at) >= self.config.tx_timestamp_timeout
            })
            .map(|(&seq, _)| seq)
            .collect();
        for seq in stale_tx {
            self.counters.tx_timestamp_timeouts += 1;
            if let Some(entry) = self.in_flight.get_mut(&seq) {
                // Local transmit timestamp stays unavailable; the round
                // proceeds rather than blocking on the error queue.
                entry.phase = SamplePhase::AwaitingRemote;
            }
            if let Some(sample) = self.try_complete(seq) {
                out.push(sample);
            }
        }

        let expired: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, e)| now >= e.deadline)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in expired {
            if let Some(entry) = self.in_flight.remove(&seq) {
                self.counters.evicted += 1;
                out.push(self.make_sample(seq, entry, false));
            }
        }

        self.drop_stale_order();
        out
    }

    /// True when `seq` is still waiting for its error-queue completion.
    pub fn has_pending_tx(&self, seq: u32) -> bool {
        matches!(self.in_flight.get(&seq), Some(e) if e.phase == SamplePhase::TxPending)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    fn phase(&self, seq: u32) -> Option<SamplePhase> {
        self.in_flight.get(&seq).map(|e| e.phase)
    }

    fn try_complete(&mut self, seq: u32) -> Option<Sample> {
        let ready = matches!(
            self.in_flight.get(&seq),
            Some(e) if e.phase == SamplePhase::AwaitingRemote
                && e.local_rx.is_some()
                && e.remote_rx.is_some()
        );
        if !ready {
            return None;
        }
        let entry = self.in_flight.remove(&seq)?;
        self.counters.completed += 1;
        Some(self.make_sample(seq, entry, true))
    }

    fn evict_oldest(&mut self) -> Option<Sample> {
        while let Some(seq) = self.order.pop_front() {
            if let Some(entry) = self.in_flight.remove(&seq) {
                self.counters.evicted += 1;
                return Some(self.make_sample(seq, entry, false));
            }
        }
        None
    }

    fn drop_stale_order(&mut self) {
        while let Some(&seq) = self.order.front() {
            if self.in_flight.contains_key(&seq) {
                break;
            }
            self.order.pop_front();
        }
    }

    fn make_sample(&self, seq: u32, entry: InFlight, complete: bool) -> Sample {
        Sample {
            peer: self.peer,
            seq,
            local_tx: entry.local_tx,
            local_rx: entry.local_rx,
            remote_rx: entry.remote_rx,
            remote_tx: entry.remote_tx,
            complete,
        }
    }
}

struct PendingReport {
    rx: Timestamp,
    created_at: Instant,
}

/// Reflector-side state for one peer: pongs whose transmit timestamp is
/// still pending on the error queue.
pub struct Responder {
    pending: HashMap<u32, PendingReport>,
    order: VecDeque<u32>,
    config: SessionConfig,
}

impl Responder {
    pub fn new(config: SessionConfig) -> Responder {
        Responder {
            pending: HashMap::new(),
            order: VecDeque::new(),
            config,
        }
    }

    /// Records an answered ping. An immediate (userland) pong timestamp
    /// yields its report right away; a pending one parks until the error
    /// queue delivers. May additionally yield the report of an entry
    /// pushed out by the table bound.
    pub fn record_reflected(
        &mut self,
        seq: u32,
        rx: Timestamp,
        tx: TxTimestamp,
        now: Instant,
    ) -> Vec<TimestampReport> {
        let mut out = Vec::new();
        match tx {
            TxTimestamp::Immediate(tx) => out.push(TimestampReport { seq, rx, tx }),
            TxTimestamp::Pending => {
                if self.pending.len() >= self.config.max_in_flight {
                    if let Some(report) = self.expire_oldest() {
                        out.push(report);
                    }
                }
                self.pending.insert(seq, PendingReport { rx, created_at: now });
                self.order.push_back(seq);
            }
        }
        out
    }

    /// Resolves a pending pong transmit timestamp from an error-queue
    /// completion.
    pub fn record_tx_timestamp(&mut self, seq: u32, tx: Timestamp) -> Option<TimestampReport> {
        let entry = self.pending.remove(&seq)?;
        Some(TimestampReport {
            seq,
            rx: entry.rx,
            tx,
        })
    }

    /// Gives up on pending entries whose error-queue completion never
    /// arrived; their reports go out with an unavailable transmit
    /// timestamp.
    pub fn sweep(&mut self, now: Instant) -> Vec<TimestampReport> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, e)| {
                now.saturating_duration_since(e.created_at) >= self.config.tx_timestamp_timeout
            })
            .map(|(&seq, _)| seq)
            .collect();

        let mut out = Vec::new();
        for seq in expired {
            if let Some(entry) = self.pending.remove(&seq) {
                out.push(TimestampReport {
                    seq,
                    rx: entry.rx,
                    tx: Timestamp::unavailable(),
                });
            }
        }

        while let Some(&seq) = self.order.front() {
            if self.pending.contains_key(&seq) {
                break;
            }
            self.order.pop_front();
        }
        out
    }

    /// True when `seq` is still waiting for its error-queue completion.
    pub fn has_pending_tx(&self, seq: u32) -> bool {
        self.pending.contains_key(&seq)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn expire_oldest(&mut self) -> Option<TimestampReport> {
        while let Some(seq) = self.order.pop_front() {
            if let Some(entry) = self.pending.remove(&seq) {
                return Some(TimestampReport {
                    seq,
                    rx: entry.rx,
                    tx: Timestamp::unavailable(),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimestampSource;

    const CONFIG: SessionConfig = SessionConfig {
        max_in_flight: 4,
        completion_timeout: Duration::from_millis(500),
        tx_timestamp_timeout: Duration::from_millis(200),
    };

    fn peer() -> SocketAddr {
        "192.0.2.1:60666".parse().unwrap()
    }

    fn ts(nanoseconds: u32) -> Timestamp {
        Timestamp {
            seconds: 1_700_000_000,
            nanoseconds,
            source: TimestampSource::Software,
        }
    }

    #[test]
    fn sequence_numbers_increase_and_wrap() {
        let mut session = ProbeSession::new(peer(), CONFIG);
        assert_eq!(session.next_sequence(), 0);
        assert_eq!(session.next_sequence(), 1);
        session.next_seq = u32::MAX;
        assert_eq!(session.next_sequence(), u32::MAX);
        assert_eq!(session.next_sequence(), 0);
    }

    #[test]
    fn userland_round_completes_with_all_timestamps() {
        let mut session = ProbeSession::new(peer(), CONFIG);
        let now = Instant::now();

        assert!(session.record_sent(0, TxTimestamp::Immediate(ts(100)), now).is_none());
        assert_eq!(session.phase(0), Some(SamplePhase::AwaitingRemote));

        assert!(session.record_pong(0, ts(300)).is_none());
        let sample = session.record_remote(0, ts(150), ts(200)).expect("round must complete");

        assert!(sample.complete);
        assert_eq!(sample.seq, 0);
        assert_eq!(sample.local_tx, ts(100));
        assert_eq!(sample.local_rx, Some(ts(300)));
        assert_eq!(sample.remote_rx, Some(ts(150)));
        assert_eq!(sample.remote_tx, Some(ts(200)));
        assert_eq!(session.in_flight_len(), 0);
        assert_eq!(session.counters.completed, 1);
    }

    #[test]
    fn kernel_round_waits_for_error_queue_completion() {
        let mut session = ProbeSession::new(peer(), CONFIG);
        let now = Instant::now();

        session.record_sent(0, TxTimestamp::Pending, now);
        assert_eq!(session.phase(0), Some(SamplePhase::TxPending));
        assert!(session.has_pending_tx(0));

        assert!(session.record_tx_timestamp(0, ts(110)).is_none());
        assert_eq!(session.phase(0), Some(SamplePhase::AwaitingRemote));

        session.record_pong(0, ts(300));
        let sample = session.record_remote(0, ts(150), ts(200)).unwrap();
        assert!(sample.complete);
        assert_eq!(sample.local_tx, ts(110));
    }

    #[test]
    fn remote_report_may_arrive_before_tx_resolution() {
        let mut session = ProbeSession::new(peer(), CONFIG);
        let now = Instant::now();

        session.record_sent(0, TxTimestamp::Pending, now);
        assert!(session.record_remote(0, ts(150), ts(200)).is_none());
        assert!(session.record_pong(0, ts(300)).is_none());

        // Everything else is in; the error-queue completion finishes it.
        let sample = session.record_tx_timestamp(0, ts(110)).unwrap();
        assert!(sample.complete);
        assert_eq!(sample.local_tx, ts(110));
        assert_eq!(sample.local_rx, Some(ts(300)));
    }

    #[test]
    fn overdue_tx_timestamp_settles_as_unavailable() {
        let mut session = ProbeSession::new(peer(), CONFIG);
        let now = Instant::now();

        session.record_sent(0, TxTimestamp::Pending, now);
        session.record_pong(0, ts(300));
        session.record_remote(0, ts(150), ts(200));

        // Nothing due before the bounded wait elapses.
        assert!(session.sweep(now + Duration::from_millis(100)).is_empty());

        let samples = session.sweep(now + CONFIG.tx_timestamp_timeout);
        assert_eq!(samples.len(), 1);
        assert!(samples[0].complete);
        assert!(!samples[0].local_tx.is_valid());
        assert_eq!(session.counters.tx_timestamp_timeouts, 1);
    }

    #[test]
    fn unanswered_round_is_evicted_as_incomplete() {
        let mut session = ProbeSession::new(peer(), CONFIG);
        let now = Instant::now();

        session.record_sent(0, TxTimestamp::Immediate(ts(100)), now);
        let samples = session.sweep(now + CONFIG.completion_timeout);
        assert_eq!(samples.len(), 1);
        assert!(!samples[0].complete);
        assert_eq!(samples[0].local_rx, None);
        assert_eq!(session.in_flight_len(), 0);
        assert_eq!(session.counters.evicted, 1);
    }

    #[test]
    fn in_flight_table_never_exceeds_bound() {
        let mut session = ProbeSession::new(peer(), CONFIG);
        let now = Instant::now();

        let mut evicted = Vec::new();
        for seq in 0..10 {
            if let Some(sample) = session.record_sent(seq, TxTimestamp::Immediate(ts(100)), now) {
                evicted.push(sample);
            }
            assert!(session.in_flight_len() <= CONFIG.max_in_flight);
        }

        // Oldest rounds were pushed out, newest survive.
        assert_eq!(evicted.len(), 6);
        assert_eq!(evicted[0].seq, 0);
        assert!(evicted.iter().all(|s| !s.complete));
        assert!((6..10).all(|seq| session.in_flight.contains_key(&seq)));
    }

    #[test]
    fn rounds_complete_out_of_order() {
        let mut session = ProbeSession::new(peer(), CONFIG);
        let now = Instant::now();

        session.record_sent(0, TxTimestamp::Immediate(ts(100)), now);
        session.record_sent(1, TxTimestamp::Immediate(ts(100)), now);

        session.record_pong(1, ts(300));
        let second = session.record_remote(1, ts(150), ts(200)).unwrap();
        assert_eq!(second.seq, 1);

        session.record_pong(0, ts(300));
        let first = session.record_remote(0, ts(150), ts(200)).unwrap();
        assert_eq!(first.seq, 0);
    }

    #[test]
    fn unknown_sequence_numbers_are_counted_not_completed() {
        let mut session = ProbeSession::new(peer(), CONFIG);
        assert!(session.record_pong(99, ts(300)).is_none());
        assert!(session.record_remote(99, ts(150), ts(200)).is_none());
        assert!(session.record_tx_timestamp(99, ts(110)).is_none());
        assert_eq!(session.counters.unmatched, 3);
    }

    #[test]
    fn responder_immediate_timestamp_reports_at_once() {
        let mut responder = Responder::new(CONFIG);
        let reports =
            responder.record_reflected(5, ts(150), TxTimestamp::Immediate(ts(200)), Instant::now());
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].seq, 5);
        assert_eq!(reports[0].rx, ts(150));
        assert_eq!(reports[0].tx, ts(200));
        assert_eq!(responder.pending_len(), 0);
    }

    #[test]
    fn responder_pending_timestamp_resolves_later() {
        let mut responder = Responder::new(CONFIG);
        let now = Instant::now();

        assert!(responder.record_reflected(5, ts(150), TxTimestamp::Pending, now).is_empty());
        assert!(responder.has_pending_tx(5));

        let report = responder.record_tx_timestamp(5, ts(210)).unwrap();
        assert_eq!(report.tx, ts(210));
        assert_eq!(responder.pending_len(), 0);
    }

    #[test]
    fn responder_gives_up_on_overdue_completions() {
        let mut responder = Responder::new(CONFIG);
        let now = Instant::now();

        responder.record_reflected(5, ts(150), TxTimestamp::Pending, now);
        assert!(responder.sweep(now + Duration::from_millis(100)).is_empty());

        let reports = responder.sweep(now + CONFIG.tx_timestamp_timeout);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].rx, ts(150));
        assert!(!reports[0].tx.is_valid());
    }

    #[test]
    fn responder_table_never_exceeds_bound() {
        let mut responder = Responder::new(CONFIG);
        let now = Instant::now();

        let mut flushed = 0;
        for seq in 0..10 {
            flushed += responder
                .record_reflected(seq, ts(150), TxTimestamp::Pending, now)
                .len();
            assert!(responder.pending_len() <= CONFIG.max_in_flight);
        }
        assert_eq!(flushed, 6);
    }
}
