//! Wrapped network functions: dual-stack binding and timestamped
//! send/receive primitives.
//!
//! The probe socket is a single IPv6 socket with `IPV6_V6ONLY` cleared, so
//! one port serves both native IPv6 and v4-mapped traffic. Transmit
//! timestamps come either from a userland clock read just before the send
//! syscall or, in kernel mode, asynchronously from the socket error queue;
//! receive timestamps ride in the ancillary control data of `recvmsg`.

use std::io::{self, IoSliceMut};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

use nix::sys::socket::{
    bind, listen, recvmsg, setsockopt, socket, sockopt, AddressFamily, Backlog, MsgFlags,
    SockFlag, SockProtocol, SockType, SockaddrIn6, SockaddrStorage,
};
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::UdpSocket;

use crate::configuration::TimestampMode;
use crate::packets::DATALEN;
use crate::time::Timestamp;

/// Listen backlog for the control socket.
const TCP_BACKLOG: i32 = 10;

// SO_TIMESTAMPING flags from <linux/net_tstamp.h>.
const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
const SOF_TIMESTAMPING_TX_SOFTWARE: u32 = 1 << 1;
const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;

const SO_TIMESTAMPING: libc::c_int = 37;

/// Startup-time socket acquisition failure. Nothing to recover; the
/// process cannot serve without its sockets.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("cannot create {0} socket: {1}")]
    Create(&'static str, io::Error),
    #[error("cannot bind {0} socket to port {1}: {2}")]
    Bind(&'static str, u16, io::Error),
    #[error("cannot listen on control socket: {0}")]
    Listen(io::Error),
}

/// Steady-state send failure. The attempt is abandoned; retry policy
/// belongs to the session layer.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("transport: {0}")]
    Transport(#[from] io::Error),
}

/// Steady-state receive failure of the underlying syscall itself, as
/// opposed to timestamp extraction, which never fails a receive.
#[derive(Debug, Error)]
pub enum RecvError {
    #[error("transport: {0}")]
    Transport(#[from] io::Error),
}

/// Result of a probe send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxTimestamp {
    /// Userland mode: the clock read taken just before the send syscall.
    Immediate(Timestamp),
    /// Kernel mode: the true transmit timestamp arrives later on the
    /// socket error queue.
    Pending,
}

/// A received probe datagram. Created fresh for every receive operation
/// and owned by it until handed to the session layer.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Source address (data path) or the original destination (error
    /// queue). Some kernels omit the address on the error-queue path.
    pub addr: Option<SocketAddr>,
    /// Payload bytes, zero-filled past `len`.
    pub payload: [u8; DATALEN],
    /// Number of bytes actually received.
    pub len: usize,
    /// RX timestamp (data path) or TX timestamp (error-queue path).
    pub timestamp: Timestamp,
}

/// Binds the two listening sockets, one UDP (ping/pong) and one TCP
/// (timestamp reports), dual-stack on the same port.
///
/// Must be run only once per process; a second call on the same port
/// fails on the bind step. Failure to clear `IPV6_V6ONLY` or to set
/// address reuse is logged and tolerated, since the agent can still
/// serve with degraded reach; every other step is fatal.
pub fn bind_sockets(port: u16) -> Result<(std::net::UdpSocket, std::net::TcpListener), BindError> {
    log::info!("binding port {}", port);
    let wildcard = SockaddrIn6::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));

    let udp = socket(
        AddressFamily::Inet6,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Udp,
    )
    .map_err(|e| BindError::Create("probe", os_err(e)))?;
    if let Err(e) = setsockopt(&udp, sockopt::Ipv6V6Only, &false) {
        log::warn!("setsockopt IPV6_V6ONLY on probe socket: {}", e);
    }
    bind(udp.as_raw_fd(), &wildcard).map_err(|e| BindError::Bind("probe", port, os_err(e)))?;

    let tcp = socket(
        AddressFamily::Inet6,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )
    .map_err(|e| BindError::Create("control", os_err(e)))?;
    if let Err(e) = setsockopt(&tcp, sockopt::Ipv6V6Only, &false) {
        log::warn!("setsockopt IPV6_V6ONLY on control socket: {}", e);
    }
    if let Err(e) = setsockopt(&tcp, sockopt::ReuseAddr, &true) {
        log::warn!("setsockopt SO_REUSEADDR on control socket: {}", e);
    }
    bind(tcp.as_raw_fd(), &wildcard).map_err(|e| BindError::Bind("control", port, os_err(e)))?;
    let backlog = Backlog::new(TCP_BACKLOG).map_err(|e| BindError::Listen(os_err(e)))?;
    listen(&tcp, backlog).map_err(|e| BindError::Listen(os_err(e)))?;

    let udp = unsafe { std::net::UdpSocket::from_raw_fd(udp.into_raw_fd()) };
    let tcp = unsafe { std::net::TcpListener::from_raw_fd(tcp.into_raw_fd()) };
    Ok((udp, tcp))
}

/// Enables kernel transmit and receive timestamping on the probe socket.
///
/// Requests both software and hardware stamps; which ones actually arrive
/// depends on the interface. nix does not expose `SO_TIMESTAMPING`, so
/// this goes through libc directly.
pub fn enable_kernel_timestamping(socket: &std::net::UdpSocket) -> io::Result<()> {
    let flags: u32 = SOF_TIMESTAMPING_TX_HARDWARE
        | SOF_TIMESTAMPING_TX_SOFTWARE
        | SOF_TIMESTAMPING_RX_HARDWARE
        | SOF_TIMESTAMPING_RX_SOFTWARE
        | SOF_TIMESTAMPING_SOFTWARE
        | SOF_TIMESTAMPING_RAW_HARDWARE;

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            SO_TIMESTAMPING,
            &flags as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Sends one probe payload to `dest`.
///
/// In userland mode the returned timestamp is read before the send
/// syscall; it does not reflect true wire departure and understates
/// latency by the kernel send path. In kernel mode the true transmit
/// timestamp is not yet known and the caller must poll the error queue.
pub fn send_probe(
    socket: &UdpSocket,
    dest: SocketAddr,
    payload: &[u8; DATALEN],
    mode: TimestampMode,
) -> Result<TxTimestamp, SendError> {
    let ts = match mode {
        TimestampMode::Userland => Some(Timestamp::now()),
        TimestampMode::Kernel => None,
    };

    match socket.try_send_to(payload, mapped_addr(dest)) {
        Ok(n) if n == DATALEN => {}
        Ok(n) => {
            return Err(SendError::Transport(io::Error::other(format!(
                "short send: {} of {} bytes",
                n, DATALEN
            ))))
        }
        Err(e) => return Err(SendError::Transport(e)),
    }

    Ok(match ts {
        Some(ts) => TxTimestamp::Immediate(ts),
        None => TxTimestamp::Pending,
    })
}

/// Performs one non-blocking receive on the probe socket.
///
/// With `error_queue` set this is a TX-completion poll: the kernel hands
/// back the original datagram with its transmit timestamp attached.
/// `Ok(None)` means nothing is pending, which is expected in most
/// transport states and is never logged here.
///
/// On the ordinary data path, a timestamp-extraction failure still
/// returns the packet with its payload and address intact and the
/// timestamp marked unavailable; only a failure of the receive syscall
/// itself is an error, and policy for it belongs to the caller.
pub fn recv_packet(
    socket: &UdpSocket,
    error_queue: bool,
    mode: TimestampMode,
) -> Result<Option<Packet>, RecvError> {
    if error_queue {
        return match recv_raw(
            socket.as_raw_fd(),
            MsgFlags::MSG_ERRQUEUE | MsgFlags::MSG_DONTWAIT,
            mode,
            true,
        ) {
            Ok(pkt) => Ok(Some(pkt)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(RecvError::Transport(e)),
        };
    }

    let res = socket.try_io(Interest::READABLE, || {
        recv_raw(socket.as_raw_fd(), MsgFlags::MSG_DONTWAIT, mode, false)
    });
    match res {
        Ok(pkt) => Ok(Some(pkt)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(RecvError::Transport(e)),
    }
}

fn recv_raw(
    fd: i32,
    flags: MsgFlags,
    mode: TimestampMode,
    error_queue: bool,
) -> io::Result<Packet> {
    let mut payload = [0u8; DATALEN];
    let mut cmsg_buf = vec![0u8; 256];

    let (len, addr, extracted) = {
        let mut iov = [IoSliceMut::new(&mut payload)];
        let msg = recvmsg::<SockaddrStorage>(fd, &mut iov, Some(&mut cmsg_buf), flags)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let extracted = Timestamp::extract(&msg);
        let addr = msg.address.as_ref().and_then(sockaddr_to_std);
        (msg.bytes, addr, extracted)
    };

    let timestamp = if error_queue {
        // Extraction failure on a completion poll is settled by the
        // session layer, which treats the timestamp as unresolved.
        extracted.unwrap_or_else(|_| Timestamp::unavailable())
    } else {
        match mode {
            TimestampMode::Userland => Timestamp::now(),
            TimestampMode::Kernel => match extracted {
                Ok(ts) => ts,
                Err(e) => {
                    log::warn!("RX timestamp error: {}", e);
                    Timestamp::unavailable()
                }
            },
        }
    };

    Ok(Packet {
        addr,
        payload,
        len,
        timestamp,
    })
}

/// Normalizes v4-mapped IPv6 addresses to plain IPv4 so dual-stack
/// traffic matches configured peer addresses.
pub fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// The probe socket is IPv6; IPv4 destinations must be v4-mapped before
/// sendto.
fn mapped_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) => {
            SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
        }
        SocketAddr::V6(_) => addr,
    }
}

fn sockaddr_to_std(sa: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(v4) = sa.as_sockaddr_in() {
        Some(SocketAddrV4::new(v4.ip(), v4.port()).into())
    } else if let Some(v6) = sa.as_sockaddr_in6() {
        Some(SocketAddrV6::new(v6.ip(), v6.port(), 0, 0).into())
    } else {
        None
    }
}

fn os_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::ProbePayload;
    use crate::time::TimestampSource;
    use std::net::IpAddr;

    /// Finds a port where both the UDP and TCP binds succeed.
    fn bind_free_pair() -> (std::net::UdpSocket, std::net::TcpListener, u16) {
        for _ in 0..16 {
            let probe = std::net::TcpListener::bind(("::", 0)).unwrap();
            let port = probe.local_addr().unwrap().port();
            drop(probe);
            if let Ok((udp, tcp)) = bind_sockets(port) {
                return (udp, tcp, port);
            }
        }
        panic!("no free port found for test sockets");
    }

    async fn udp_pair() -> (UdpSocket, UdpSocket, SocketAddr) {
        let (a_std, _a_tcp, _a_port) = bind_free_pair();
        let (b_std, _b_tcp, b_port) = bind_free_pair();
        a_std.set_nonblocking(true).unwrap();
        b_std.set_nonblocking(true).unwrap();
        let a = UdpSocket::from_std(a_std).unwrap();
        let b = UdpSocket::from_std(b_std).unwrap();
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b_port).parse().unwrap();
        (a, b, b_addr)
    }

    async fn recv_until_packet(socket: &UdpSocket, mode: TimestampMode) -> Packet {
        loop {
            socket.readable().await.unwrap();
            if let Some(pkt) = recv_packet(socket, false, mode).unwrap() {
                return pkt;
            }
        }
    }

    #[test]
    fn binding_same_port_twice_fails() {
        let (_udp, _tcp, port) = bind_free_pair();
        assert!(bind_sockets(port).is_err());
    }

    #[test]
    fn kernel_timestamping_enables_on_plain_socket() {
        let (udp, _tcp, _port) = bind_free_pair();
        assert!(enable_kernel_timestamping(&udp).is_ok());
    }

    #[tokio::test]
    async fn send_and_receive_preserves_payload() {
        let (a, b, b_addr) = udp_pair().await;
        let payload = ProbePayload::ping(42, &Timestamp::now()).to_bytes();

        let before = Timestamp::now();
        let tx = send_probe(&a, b_addr, &payload, TimestampMode::Userland).unwrap();
        let after = Timestamp::now();

        let TxTimestamp::Immediate(ts) = tx else {
            panic!("userland send must carry an immediate timestamp");
        };
        assert_eq!(ts.source, TimestampSource::Software);
        assert!(ts.duration_since(&before).is_some());
        assert!(after.duration_since(&ts).is_some());

        let pkt = recv_until_packet(&b, TimestampMode::Userland).await;
        assert_eq!(pkt.len, DATALEN);
        assert_eq!(pkt.payload, payload);
        assert!(pkt.timestamp.is_valid());

        // The dual-stack socket reports v4 senders as v4-mapped.
        let src = canonical_addr(pkt.addr.unwrap());
        assert_eq!(src.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn kernel_mode_send_reports_timestamp_pending() {
        let (a, _b, b_addr) = udp_pair().await;
        let payload = ProbePayload::ping(1, &Timestamp::now()).to_bytes();
        let tx = send_probe(&a, b_addr, &payload, TimestampMode::Kernel).unwrap();
        assert_eq!(tx, TxTimestamp::Pending);
    }

    #[tokio::test]
    async fn missing_rx_timestamp_does_not_discard_packet() {
        let (a, b, b_addr) = udp_pair().await;
        let payload = ProbePayload::ping(7, &Timestamp::now()).to_bytes();
        send_probe(&a, b_addr, &payload, TimestampMode::Userland).unwrap();

        // Kernel-mode receive on a socket that never had timestamping
        // enabled: no ancillary timestamp arrives, the payload must
        // survive anyway.
        let pkt = recv_until_packet(&b, TimestampMode::Kernel).await;
        assert_eq!(pkt.payload, payload);
        assert!(pkt.addr.is_some());
        assert_eq!(pkt.timestamp.source, TimestampSource::Unavailable);
    }

    #[tokio::test]
    async fn error_queue_poll_with_nothing_pending() {
        let (a, _b, _b_addr) = udp_pair().await;
        assert!(matches!(
            recv_packet(&a, true, TimestampMode::Kernel),
            Ok(None)
        ));
    }

    #[test]
    fn canonical_addr_unmaps_v4_mapped() {
        let mapped: SocketAddr = "[::ffff:192.0.2.7]:60666".parse().unwrap();
        let canonical = canonical_addr(mapped);
        assert_eq!(canonical, "192.0.2.7:60666".parse().unwrap());

        let native: SocketAddr = "[2001:db8::1]:60666".parse().unwrap();
        assert_eq!(canonical_addr(native), native);
    }
}
