//! Probe scheduling and the single-threaded agent event loop.
//!
//! One `tokio::select!` loop multiplexes everything: the UDP probe socket
//! (ordinary receives and error-queue completion polls), the TCP control
//! listener, at most one in-progress outbound control connect, the probe
//! interval timer, and a sweep timer that drives deadline eviction,
//! control-channel pumping, and reconnection. No handler spawns further
//! tasks; the in-flight tables are touched only within the loop's turn.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{interval, MissedTickBehavior};

use crate::configuration::{Configuration, TimestampMode};
use crate::net::{self, canonical_addr, recv_packet, send_probe, Packet};
use crate::packets::{ProbeKind, ProbePayload, TimestampReport, CONTROL_MSG_LEN};
use crate::report::Reporter;
use crate::session::{ProbeSession, Responder, SessionConfig};
use crate::time::Timestamp;

/// Cadence of the housekeeping pass (eviction, control pump, reconnects).
const SWEEP_INTERVAL: Duration = Duration::from_millis(20);

/// Minimum pause between outbound connect attempts to the same peer.
const RECONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// Bound on one outbound control connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Cadence of the per-peer counter log line.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

type ConnectFuture = Pin<Box<dyn Future<Output = (SocketAddr, io::Result<TcpStream>)> + Send>>;

/// Startup failure. Steady-state errors never surface here; the loop
/// handles them and keeps running.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Bind(#[from] net::BindError),
    #[error("socket setup failed: {0}")]
    Setup(#[from] io::Error),
}

struct ControlConn {
    stream: TcpStream,
    rxbuf: Vec<u8>,
}

impl ControlConn {
    fn new(stream: TcpStream) -> ControlConn {
        ControlConn {
            stream,
            rxbuf: Vec::new(),
        }
    }
}

struct Peer {
    addr: SocketAddr,
    session: ProbeSession,
    responder: Responder,
    /// Control connection this agent dialed.
    conn_out: Option<ControlConn>,
    /// Control connection the peer dialed. Both may exist at once when
    /// the peers dialed each other simultaneously; reads drain both,
    /// writes go through one.
    conn_in: Option<ControlConn>,
    outbuf: Vec<u8>,
    last_connect: Option<Instant>,
    reports_dropped: u64,
}

impl Peer {
    fn new(addr: SocketAddr, config: SessionConfig) -> Peer {
        Peer {
            addr,
            session: ProbeSession::new(addr, config),
            responder: Responder::new(config),
            conn_out: None,
            conn_in: None,
            outbuf: Vec::new(),
            last_connect: None,
            reports_dropped: 0,
        }
    }

    /// Queues a report for the control channel. While disconnected the
    /// buffer is bounded; the oldest whole frames give way.
    fn queue_report(&mut self, report: TimestampReport, max_outbuf: usize) {
        self.outbuf.extend_from_slice(&report.to_bytes());
        if self.outbuf.len() > max_outbuf {
            let excess = self.outbuf.len() - max_outbuf;
            let frames = excess.div_ceil(CONTROL_MSG_LEN);
            let cut = (frames * CONTROL_MSG_LEN).min(self.outbuf.len());
            self.outbuf.drain(..cut);
            self.reports_dropped += frames as u64;
            debug!("control backlog to {} full, dropped {} report(s)", self.addr, frames);
        }
    }
}

/// Runs the probe agent until the surrounding task is cancelled.
///
/// Binds the dual-stack sockets (fatal on failure), resolves the
/// effective timestamp mode, then enters the event loop. Completed and
/// evicted samples go to `reporter`.
pub async fn run_agent(conf: &Configuration, reporter: &dyn Reporter) -> Result<(), AgentError> {
    let (udp_std, tcp_std) = net::bind_sockets(conf.port)?;

    let mode = match conf.timestamp_mode {
        TimestampMode::Kernel => match net::enable_kernel_timestamping(&udp_std) {
            Ok(()) => TimestampMode::Kernel,
            Err(e) => {
                warn!(
                    "kernel timestamping unavailable ({}), falling back to userland mode",
                    e
                );
                TimestampMode::Userland
            }
        },
        TimestampMode::Userland => TimestampMode::Userland,
    };

    udp_std.set_nonblocking(true)?;
    tcp_std.set_nonblocking(true)?;
    let udp = UdpSocket::from_std(udp_std)?;
    let listener = TcpListener::from_std(tcp_std)?;

    info!(
        "probe agent on port {} with {} timestamps, {} peer(s)",
        conf.port,
        mode,
        conf.peers.len()
    );

    let session_config = SessionConfig {
        max_in_flight: conf.max_in_flight,
        completion_timeout: conf.sample_timeout(),
        tx_timestamp_timeout: conf.tx_timeout(),
    };
    let peers: HashMap<SocketAddr, Peer> = conf
        .peers
        .iter()
        .map(|&addr| {
            let addr = canonical_addr(addr);
            (addr, Peer::new(addr, session_config))
        })
        .collect();

    let mut agent = Agent {
        mode,
        udp,
        listener,
        peers,
        reporter,
        max_outbuf: conf.max_in_flight * CONTROL_MSG_LEN,
    };

    let mut probe_timer = interval(conf.interval());
    probe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick
    probe_timer.tick().await;

    let mut sweep_timer = interval(SWEEP_INTERVAL);
    sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stats_timer = interval(STATS_INTERVAL);
    stats_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    stats_timer.tick().await;

    let mut pending_connect: Option<ConnectFuture> = None;

    loop {
        tokio::select! {
            _ = probe_timer.tick() => {
                agent.send_probes();
                if agent.mode == TimestampMode::Kernel {
                    agent.poll_error_queue();
                }
            }

            _ = sweep_timer.tick() => {
                if agent.mode == TimestampMode::Kernel {
                    agent.poll_error_queue();
                }
                agent.pump_control();
                agent.sweep();
                if pending_connect.is_none() {
                    pending_connect = agent.next_connect();
                }
            }

            _ = stats_timer.tick() => {
                agent.log_counters();
            }

            res = agent.udp.readable() => {
                if let Err(e) = res {
                    warn!("probe socket wait failed: {}", e);
                    continue;
                }
                // Error-queue completions assert readiness too; drain
                // them first so data packets do not starve them.
                if agent.mode == TimestampMode::Kernel {
                    agent.poll_error_queue();
                }
                agent.drain_data();
            }

            res = agent.listener.accept() => {
                match res {
                    Ok((stream, addr)) => agent.register_inbound(stream, addr),
                    Err(e) => warn!("control accept failed: {}", e),
                }
            }

            (addr, res) = async { pending_connect.as_mut().unwrap().await }, if pending_connect.is_some() => {
                pending_connect = None;
                agent.register_outbound(addr, res);
            }
        }
    }
}

struct Agent<'a> {
    mode: TimestampMode,
    udp: UdpSocket,
    listener: TcpListener,
    peers: HashMap<SocketAddr, Peer>,
    reporter: &'a dyn Reporter,
    max_outbuf: usize,
}

impl Agent<'_> {
    /// Sends one ping to every configured peer.
    fn send_probes(&mut self) {
        let now = Instant::now();
        for peer in self.peers.values_mut() {
            let seq = peer.session.next_sequence();
            let payload = ProbePayload::ping(seq, &Timestamp::now()).to_bytes();
            match send_probe(&self.udp, peer.addr, &payload, self.mode) {
                Ok(tx) => {
                    if let Some(evicted) = peer.session.record_sent(seq, tx, now) {
                        self.reporter.submit(evicted);
                    }
                }
                Err(e) => {
                    debug!("probe send to {} failed: {}", peer.addr, e);
                    peer.session.counters.send_errors += 1;
                }
            }
        }
    }

    /// Drains pending TX-completion messages off the error queue.
    fn poll_error_queue(&mut self) {
        loop {
            match recv_packet(&self.udp, true, self.mode) {
                Ok(Some(pkt)) => self.dispatch_tx_timestamp(pkt),
                Ok(None) => break,
                Err(e) => {
                    // Expected in some transport states; the bounded wait
                    // settles the completion instead.
                    debug!("error-queue receive: {}", e);
                    break;
                }
            }
        }
    }

    /// Routes one error-queue completion to the round that sent the
    /// original datagram. The kernel hands back the datagram itself, so
    /// its kind and sequence number identify the round; the attached
    /// address (the original destination) picks the peer, with a scan
    /// fallback when the kernel omits it.
    fn dispatch_tx_timestamp(&mut self, pkt: Packet) {
        let payload = match ProbePayload::from_bytes(&pkt.payload[..pkt.len]) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("unparseable error-queue packet: {}", e);
                return;
            }
        };

        let addr = pkt.addr.map(canonical_addr);
        let key = match addr {
            Some(addr) if self.peers.contains_key(&addr) => addr,
            _ => match self.find_pending_tx(payload.kind, payload.seq) {
                Some(addr) => addr,
                None => {
                    debug!("error-queue completion with no matching round (seq {})", payload.seq);
                    return;
                }
            },
        };
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };

        match payload.kind {
            ProbeKind::Ping => {
                if let Some(sample) = peer.session.record_tx_timestamp(payload.seq, pkt.timestamp) {
                    self.reporter.submit(sample);
                }
            }
            ProbeKind::Pong => {
                if let Some(report) = peer.responder.record_tx_timestamp(payload.seq, pkt.timestamp)
                {
                    peer.queue_report(report, self.max_outbuf);
                }
            }
        }
    }

    fn find_pending_tx(&self, kind: ProbeKind, seq: u32) -> Option<SocketAddr> {
        self.peers
            .values()
            .find(|p| match kind {
                ProbeKind::Ping => p.session.has_pending_tx(seq),
                ProbeKind::Pong => p.responder.has_pending_tx(seq),
            })
            .map(|p| p.addr)
    }

    /// Drains ready probe datagrams off the data path.
    fn drain_data(&mut self) {
        loop {
            match recv_packet(&self.udp, false, self.mode) {
                Ok(Some(pkt)) => self.handle_probe(pkt),
                Ok(None) => break,
                Err(e) => {
                    warn!("probe receive failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_probe(&mut self, pkt: Packet) {
        let Some(src) = pkt.addr else {
            warn!("probe packet without source address");
            return;
        };
        let src = canonical_addr(src);
        let payload = match ProbePayload::from_bytes(&pkt.payload[..pkt.len]) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("malformed probe from {}: {}", src, e);
                return;
            }
        };
        let mode = self.mode;
        let Some(peer) = self.peers.get_mut(&src) else {
            debug!("probe from unconfigured peer {}", src);
            return;
        };

        if mode == TimestampMode::Kernel && !pkt.timestamp.is_valid() {
            peer.session.counters.rx_timestamp_missing += 1;
        }

        match payload.kind {
            ProbeKind::Ping => {
                let pong = ProbePayload::pong(&payload).to_bytes();
                match send_probe(&self.udp, src, &pong, mode) {
                    Ok(tx) => {
                        let reports = peer.responder.record_reflected(
                            payload.seq,
                            pkt.timestamp,
                            tx,
                            Instant::now(),
                        );
                        for report in reports {
                            peer.queue_report(report, self.max_outbuf);
                        }
                    }
                    Err(e) => debug!("pong to {} failed: {}", src, e),
                }
            }
            ProbeKind::Pong => {
                if let Some(sample) = peer.session.record_pong(payload.seq, pkt.timestamp) {
                    self.reporter.submit(sample);
                }
            }
        }
    }

    /// Reads timestamp reports off every control connection and flushes
    /// queued outbound frames.
    fn pump_control(&mut self) {
        for peer in self.peers.values_mut() {
            let mut reports = read_reports(&mut peer.conn_in, peer.addr);
            reports.extend(read_reports(&mut peer.conn_out, peer.addr));
            for report in reports {
                if let Some(sample) = peer.session.record_remote(report.seq, report.rx, report.tx)
                {
                    self.reporter.submit(sample);
                }
            }

            // Write through the dialed connection when there is one.
            if peer.conn_out.is_some() {
                write_frames(&mut peer.conn_out, &mut peer.outbuf, peer.addr);
            } else {
                write_frames(&mut peer.conn_in, &mut peer.outbuf, peer.addr);
            }
        }
    }

    /// Deadline pass over every session and responder.
    fn sweep(&mut self) {
        let now = Instant::now();
        for peer in self.peers.values_mut() {
            for sample in peer.session.sweep(now) {
                self.reporter.submit(sample);
            }
            for report in peer.responder.sweep(now) {
                peer.queue_report(report, self.max_outbuf);
            }
        }
    }

    fn register_inbound(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ip = canonical_addr(addr).ip();
        let Some(peer) = self.peers.values_mut().find(|p| p.addr.ip() == ip) else {
            debug!("control connection from unconfigured address {}", addr);
            return;
        };
        info!("control connection accepted from {}", addr);
        peer.conn_in = Some(ControlConn::new(stream));
    }

    fn register_outbound(&mut self, addr: SocketAddr, res: io::Result<TcpStream>) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        match res {
            Ok(stream) => {
                info!("control channel to {} established", addr);
                peer.conn_out = Some(ControlConn::new(stream));
            }
            Err(e) => debug!("control connect to {} failed: {}", addr, e),
        }
    }

    /// Picks the next peer without any control connection and returns a
    /// connect attempt for it. One attempt is in flight at a time.
    fn next_connect(&mut self) -> Option<ConnectFuture> {
        let now = Instant::now();
        for peer in self.peers.values_mut() {
            let due = peer
                .last_connect
                .map_or(true, |t| now.saturating_duration_since(t) >= RECONNECT_INTERVAL);
            if peer.conn_out.is_none() && peer.conn_in.is_none() && due {
                peer.last_connect = Some(now);
                let addr = peer.addr;
                return Some(Box::pin(async move {
                    let res = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
                        .await
                    {
                        Ok(res) => res,
                        Err(_) => Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "control connect timed out",
                        )),
                    };
                    (addr, res)
                }));
            }
        }
        None
    }

    fn log_counters(&self) {
        for peer in self.peers.values() {
            let c = &peer.session.counters;
            info!(
                "peer {}: sent {} completed {} evicted {} send-errors {} tx-timeouts {} rx-ts-missing {} unmatched {} reports-dropped {}",
                peer.addr,
                c.sent,
                c.completed,
                c.evicted,
                c.send_errors,
                c.tx_timestamp_timeouts,
                c.rx_timestamp_missing,
                c.unmatched,
                peer.reports_dropped,
            );
        }
    }
}

/// Drains whole timestamp-report frames from a control connection. A
/// closed stream or a protocol fault clears the slot; reconnection is
/// handled by the sweep and does not affect other peers.
fn read_reports(slot: &mut Option<ControlConn>, peer: SocketAddr) -> Vec<TimestampReport> {
    let mut reports = Vec::new();
    let Some(conn) = slot.as_mut() else {
        return reports;
    };
    let mut reset = false;
    let mut buf = [0u8; 1024];

    loop {
        match conn.stream.try_read(&mut buf) {
            Ok(0) => {
                debug!("control connection from {} closed", peer);
                reset = true;
                break;
            }
            Ok(n) => conn.rxbuf.extend_from_slice(&buf[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!("control read from {} failed: {}", peer, e);
                reset = true;
                break;
            }
        }
    }

    while conn.rxbuf.len() >= CONTROL_MSG_LEN {
        match TimestampReport::from_bytes(&conn.rxbuf[..CONTROL_MSG_LEN]) {
            Ok(report) => {
                conn.rxbuf.drain(..CONTROL_MSG_LEN);
                reports.push(report);
            }
            Err(e) => {
                warn!(
                    "protocol error on control channel from {}: {}; resetting connection",
                    peer, e
                );
                reset = true;
                break;
            }
        }
    }

    if reset {
        *slot = None;
    }
    reports
}

/// Flushes queued frames into a control connection until it would block.
fn write_frames(slot: &mut Option<ControlConn>, outbuf: &mut Vec<u8>, peer: SocketAddr) {
    let Some(conn) = slot.as_mut() else {
        return;
    };
    while !outbuf.is_empty() {
        match conn.stream.try_write(outbuf) {
            Ok(0) => {
                *slot = None;
                return;
            }
            Ok(n) => {
                outbuf.drain(..n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                debug!("control write to {} failed: {}", peer, e);
                *slot = None;
                return;
            }
        }
    }
}
