//! Integration tests for the 3-way handshake.
//!
//! Each test binds real UDP sockets on loopback, runs the server half in a
//! background task, and checks what both sides agreed on.

use std::net::SocketAddr;
use std::time::Duration;

use rudp::{
    connection::{ConnError, Connection},
    packet::{flags, Packet},
    socket::{Recv, Socket},
    state::ConnectionState,
    TransportConfig,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn fast() -> TransportConfig {
    TransportConfig::default()
        .with_initial_rto(Duration::from_millis(20))
        .with_disconnect_timeout(Duration::from_millis(500))
}

/// Server connection on an ephemeral port, accepting in the background.
async fn spawn_accept(
    config: TransportConfig,
) -> (
    SocketAddr,
    tokio::task::JoinHandle<Result<(Connection, SocketAddr), ConnError>>,
) {
    let mut server = Connection::bind(loopback(), config).await.expect("bind server");
    let addr = server.local_addr();
    let task = tokio::spawn(async move {
        let peer = server.accept().await?;
        Ok((server, peer))
    });
    (addr, task)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Both sides should reach `Established` after a clean handshake on loopback.
#[tokio::test]
async fn handshake_both_sides_reach_established() {
    let (server_addr, server_task) = spawn_accept(TransportConfig::default()).await;

    let mut client = Connection::bind(loopback(), TransportConfig::default())
        .await
        .expect("bind client");
    tokio::time::timeout(Duration::from_secs(5), client.connect(server_addr))
        .await
        .expect("client connect timed out")
        .expect("client connect failed");

    let (server, peer) = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server accept timed out")
        .expect("server task panicked")
        .expect("server accept failed");

    assert_eq!(client.state, ConnectionState::Established);
    assert_eq!(server.state, ConnectionState::Established);
    assert_eq!(peer, client.local_addr());
    assert_eq!(client.peer_addr(), Some(server_addr));
}

/// Each side's next sequence number is what the other side acknowledged.
#[tokio::test]
async fn handshake_sequence_numbers_agree() {
    let (server_addr, server_task) = spawn_accept(TransportConfig::default()).await;

    let mut client = Connection::bind(loopback(), TransportConfig::default())
        .await
        .unwrap();
    client.connect(server_addr).await.unwrap();
    let (server, _) = server_task.await.unwrap().unwrap();

    assert_eq!(server.peer_seq(), client.local_seq());
    assert_eq!(client.peer_seq(), server.local_seq());
}

/// A peer that never answers fails the handshake within the disconnect timeout.
#[tokio::test]
async fn connect_to_silent_peer_fails() {
    let silent = Socket::bind(loopback()).await.unwrap();
    let mut client = Connection::bind(loopback(), fast()).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = client.connect(silent.local_addr).await.unwrap_err();

    assert!(matches!(err, ConnError::HandshakeFailed { peer, .. } if peer == silent.local_addr));
    assert_eq!(client.state, ConnectionState::Closed);
    assert!(started.elapsed() < Duration::from_secs(2));
}

/// The client retransmits its SYN until a SYN-ACK arrives.
#[tokio::test]
async fn connect_retransmits_syn() {
    let raw = Socket::bind(loopback()).await.unwrap();
    let raw_addr = raw.local_addr;
    let mut client = Connection::bind(loopback(), fast()).await.unwrap();
    let client_task = tokio::spawn(async move {
        client.connect(raw_addr).await?;
        Ok::<_, ConnError>(client)
    });

    // Ignore the first SYN, answer the retransmission.
    let (first, from) = raw.recv_from().await.unwrap();
    assert!(first.syn());
    let (second, _) = raw.recv_from().await.unwrap();
    assert_eq!(second, first);

    let server_id = 4_000u16;
    let syn_ack = Packet::segment(
        u32::from(server_id),
        u32::from(first.seq_num()) + 1,
        flags::SYN | flags::ACK,
    );
    raw.send_to(&syn_ack, from).await.unwrap();

    let client = client_task.await.unwrap().unwrap();
    assert_eq!(client.peer_seq(), server_id + 1);
    assert_eq!(client.local_seq(), first.seq_num().wrapping_add(1));
}

/// If the final ACK is lost, the client's first data segment completes the
/// handshake and is delivered by the next `recv`.
#[tokio::test]
async fn lost_final_ack_is_recovered_by_data() {
    let (server_addr, server_task) = spawn_accept(fast()).await;
    let raw = Socket::bind(loopback()).await.unwrap();

    let client_id = 100u16;
    raw.send_to(&Packet::segment(u32::from(client_id), 0, flags::SYN), server_addr)
        .await
        .unwrap();
    let (syn_ack, _) = raw.recv_from().await.unwrap();
    assert!(syn_ack.syn() && syn_ack.ack());
    assert_eq!(syn_ack.ack_num(), client_id + 1);

    // Skip the ACK and go straight to a one-chunk message.
    let data_base = 7_000u16;
    let data = Packet::segment(u32::from(data_base), 0, flags::SYN | flags::FIN).with_payload(b"x".to_vec());
    raw.send_to(&data, server_addr).await.unwrap();

    let (mut server, _) = server_task.await.unwrap().unwrap();
    assert_eq!(server.state, ConnectionState::Established);
    let recv_task = tokio::spawn(async move { server.recv().await });

    // Acknowledge the server's closing FIN so `recv` finishes promptly.
    loop {
        match raw.recv_timeout(Duration::from_secs(2)).await.unwrap() {
            Recv::Datagram(p, from) if p.fin() => {
                assert_eq!(p.ack_num(), data_base + 1);
                let ack = Packet::segment(0, u32::from(p.seq_num()) + 1, flags::ACK);
                raw.send_to(&ack, from).await.unwrap();
                break;
            }
            // Late SYN-ACK retransmissions may still be queued.
            Recv::Datagram(p, _) if p.syn() => continue,
            Recv::Datagram(p, _) => assert!(p.ack() && p.ack_num() == data_base + 1),
            Recv::TimedOut => panic!("server never sent its FIN"),
        }
    }

    let got = recv_task.await.unwrap().unwrap();
    assert_eq!(got.as_deref(), Some(&b"x"[..]));
}
