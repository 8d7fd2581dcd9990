//! Integration tests for agent-to-agent probing over loopback.
//!
//! These run real agents against the localhost interface in userland
//! timestamp mode, which behaves the same everywhere; the kernel
//! timestamping paths are covered by unit tests against the session
//! state machine.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::UnboundedReceiver;

use sla_probe::agent::run_agent;
use sla_probe::configuration::{Configuration, TimestampMode};
use sla_probe::report::{ChannelReporter, Sample};

/// Find an available port for testing.
async fn find_available_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

fn test_configuration(port: u16, peers: Vec<SocketAddr>) -> Configuration {
    Configuration {
        port,
        timestamp_mode: TimestampMode::Userland,
        probe_interval: 100,
        completion_timeout: 500,
        tx_timestamp_timeout: 200,
        max_in_flight: 256,
        peers,
    }
}

fn drain_complete(rx: &mut UnboundedReceiver<Sample>) -> Vec<Sample> {
    let mut out = Vec::new();
    while let Ok(sample) = rx.try_recv() {
        if sample.complete {
            out.push(sample);
        }
    }
    out
}

#[tokio::test]
async fn two_peered_agents_complete_samples() {
    let port_a = find_available_port().await;
    let mut port_b = find_available_port().await;
    while port_b == port_a {
        port_b = find_available_port().await;
    }

    let conf_a = test_configuration(
        port_a,
        vec![format!("127.0.0.1:{}", port_b).parse().unwrap()],
    );
    let conf_b = test_configuration(
        port_b,
        vec![format!("127.0.0.1:{}", port_a).parse().unwrap()],
    );

    let (reporter_a, mut samples_a) = ChannelReporter::new();
    let (reporter_b, mut samples_b) = ChannelReporter::new();

    let agent_a = tokio::spawn(async move { run_agent(&conf_a, &reporter_a).await });
    let agent_b = tokio::spawn(async move { run_agent(&conf_b, &reporter_b).await });

    tokio::time::sleep(Duration::from_millis(1050)).await;
    agent_a.abort();
    agent_b.abort();

    let complete_a = drain_complete(&mut samples_a);
    let complete_b = drain_complete(&mut samples_b);

    assert!(
        (8..=10).contains(&complete_a.len()),
        "agent A completed {} samples",
        complete_a.len()
    );
    assert!(
        (8..=10).contains(&complete_b.len()),
        "agent B completed {} samples",
        complete_b.len()
    );

    for sample in complete_a.iter().chain(complete_b.iter()) {
        assert!(sample.local_tx.is_valid(), "local TX missing on {}", sample.seq);
        assert!(sample.local_rx.unwrap().is_valid());
        assert!(sample.remote_rx.unwrap().is_valid());
        assert!(sample.remote_tx.unwrap().is_valid());
        assert!(sample.rtt().is_some());
        assert!(sample.network_delay().is_some());
    }
}

#[tokio::test]
async fn unanswered_peer_yields_incomplete_samples() {
    let port = find_available_port().await;

    // A socket that swallows probes without ever answering.
    let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let conf = test_configuration(port, vec![sink.local_addr().unwrap()]);

    let (reporter, mut samples) = ChannelReporter::new();
    let agent = tokio::spawn(async move { run_agent(&conf, &reporter).await });

    tokio::time::sleep(Duration::from_millis(1200)).await;
    agent.abort();

    let mut evicted = 0;
    while let Ok(sample) = samples.try_recv() {
        assert!(!sample.complete);
        assert!(sample.local_tx.is_valid());
        assert_eq!(sample.local_rx, None);
        assert_eq!(sample.remote_rx, None);
        evicted += 1;
    }
    assert!(evicted >= 1, "expected evicted samples for a silent peer");
}

#[tokio::test]
async fn malformed_control_frame_resets_connection_only() {
    let port = find_available_port().await;

    let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let conf = test_configuration(port, vec![sink.local_addr().unwrap()]);

    let (reporter, mut samples) = ChannelReporter::new();
    let agent = tokio::spawn(async move { run_agent(&conf, &reporter).await });

    // Let the agent bind before dialing in.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    conn.write_all(&[0xffu8; 40]).await.unwrap();

    // The agent must reset the connection on the protocol error.
    let mut buf = [0u8; 16];
    match tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf)).await {
        Ok(Ok(0)) => {}
        Ok(Ok(n)) => panic!("unexpected {} bytes on control connection", n),
        Ok(Err(_)) => {}
        Err(_) => panic!("agent did not reset the control connection"),
    }

    // Steady-state errors never terminate the loop: probes keep flowing
    // and unanswered rounds still get evicted afterwards.
    tokio::time::sleep(Duration::from_millis(800)).await;
    agent.abort();

    let mut evicted = 0;
    while let Ok(sample) = samples.try_recv() {
        if !sample.complete {
            evicted += 1;
        }
    }
    assert!(evicted >= 1, "agent stopped measuring after protocol error");
}
