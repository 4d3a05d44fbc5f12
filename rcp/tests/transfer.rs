//! Integration tests for reliable data transfer.
//!
//! Clean loopback runs check ordering and segmentation; runs over
//! [`LossyTransport`] check that loss, duplication, and reordering are
//! repaired end to end.  Fault seeds are fixed so failures reproduce.

use std::net::SocketAddr;
use std::time::Duration;

use rcp::simulator::{LossyTransport, SimulatorConfig};
use rcp::{
    Config, CongestionStrategy, ConnError, Connection, ConnectionState, Listener, Socket, Transport,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(congestion: CongestionStrategy) -> Config {
    Config {
        initial_rto: Duration::from_millis(30),
        max_rto: Duration::from_millis(500),
        congestion,
        ..Config::default()
    }
}

/// Deterministic, non-repeating-per-packet test data.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Read until `len` bytes arrived or the peer closed.
async fn read_exact<T: Transport>(conn: &mut Connection<T>, len: usize) -> Vec<u8> {
    let mut got = Vec::with_capacity(len);
    while got.len() < len {
        match conn.recv().await.expect("recv failed") {
            Some(chunk) => got.extend_from_slice(&chunk),
            None => break,
        }
    }
    got
}

/// Read until the peer closes.
async fn read_to_end<T: Transport>(conn: &mut Connection<T>) -> Vec<u8> {
    let mut got = Vec::new();
    while let Some(chunk) = conn.recv().await.expect("recv failed") {
        got.extend_from_slice(&chunk);
    }
    got
}

/// Accept one connection and echo everything on it until the peer closes.
fn spawn_echo<T: Transport>(mut listener: Listener<T>) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut conn = listener.accept().await.expect("accept failed");
        let mut total = 0;
        while let Some(chunk) = conn.recv().await.expect("server recv failed") {
            total += chunk.len();
            conn.send(&chunk).await.expect("server send failed");
        }
        // The peer may be gone before our FIN is acknowledged.
        let _ = conn.close().await;
        total
    })
}

async fn lossy_socket(config: Config, seed: u64) -> Socket<LossyTransport<UdpSocket>> {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let lossy = LossyTransport::new(
        udp,
        SimulatorConfig {
            loss_rate: 0.1,
            duplicate_rate: 0.05,
            reorder_rate: 0.05,
            seed,
        },
    );
    Socket::with_transport(lossy, config).unwrap()
}

// ---------------------------------------------------------------------------
// Clean network
// ---------------------------------------------------------------------------

#[tokio::test]
async fn echo_round_trip() {
    let listener = Listener::bind("127.0.0.1:0", config(CongestionStrategy::Fixed(1)))
        .await
        .unwrap();
    let addr = listener.local_addr();
    let server = spawn_echo(listener);

    let socket = Socket::bind("127.0.0.1:0", config(CongestionStrategy::Fixed(1)))
        .await
        .unwrap();
    let mut conn = socket.connect(addr).await.unwrap();

    assert_eq!(conn.send(b"Ping!").await.unwrap(), 5);
    let reply = timeout(Duration::from_secs(5), read_exact(&mut conn, 5))
        .await
        .expect("echo timed out");
    assert_eq!(reply, b"Ping!");

    conn.close().await.unwrap();
    let total = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(total, 5);
}

#[tokio::test]
async fn large_transfer_is_segmented_and_ordered() {
    for congestion in [CongestionStrategy::Fixed(8), CongestionStrategy::Aimd] {
        let mut listener = Listener::bind("127.0.0.1:0", config(congestion))
            .await
            .unwrap();
        let addr = listener.local_addr();
        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let got = read_to_end(&mut conn).await;
            conn.close().await.unwrap();
            got
        });

        // Spans many packets and wraps the sequence space.
        let data = pattern(100_000);
        let socket = Socket::bind("127.0.0.1:0", config(congestion)).await.unwrap();
        let mut conn = socket.connect(addr).await.unwrap();
        let sent = timeout(Duration::from_secs(10), conn.send(&data))
            .await
            .expect("send timed out")
            .unwrap();
        assert_eq!(sent, data.len());
        timeout(Duration::from_secs(10), conn.close())
            .await
            .expect("close timed out")
            .unwrap();

        let got = timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
        assert_eq!(got.len(), data.len());
        assert!(got == data, "payload corrupted or reordered");
    }
}

#[tokio::test]
async fn flush_waits_for_acknowledgement() {
    let mut listener = Listener::bind("127.0.0.1:0", config(CongestionStrategy::Aimd))
        .await
        .unwrap();
    let addr = listener.local_addr();
    let server = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        read_to_end(&mut conn).await
    });

    let socket = Socket::bind("127.0.0.1:0", config(CongestionStrategy::Aimd))
        .await
        .unwrap();
    let mut conn = socket.connect(addr).await.unwrap();
    conn.send(&pattern(10_000)).await.unwrap();
    timeout(Duration::from_secs(5), conn.flush())
        .await
        .expect("flush timed out")
        .unwrap();

    drop(conn);
    server.abort();
}

#[tokio::test]
async fn concurrent_peers_are_kept_apart() {
    let mut listener = Listener::bind("127.0.0.1:0", config(CongestionStrategy::Aimd))
        .await
        .unwrap();
    let addr = listener.local_addr();

    let server = tokio::spawn(async move {
        let mut echoes = Vec::new();
        for _ in 0..4 {
            let mut conn = listener.accept().await.unwrap();
            echoes.push(tokio::spawn(async move {
                while let Some(chunk) = conn.recv().await.unwrap() {
                    conn.send(&chunk).await.unwrap();
                }
                conn.close().await.unwrap();
            }));
        }
        for e in echoes {
            e.await.unwrap();
        }
    });

    let mut clients = Vec::new();
    for id in 0..4u8 {
        clients.push(tokio::spawn(async move {
            let socket = Socket::bind("127.0.0.1:0", config(CongestionStrategy::Aimd))
                .await
                .unwrap();
            let mut conn = socket.connect(addr).await.unwrap();
            let message = vec![id; 3000 + id as usize * 700];
            conn.send(&message).await.unwrap();
            let echoed = read_exact(&mut conn, message.len()).await;
            conn.close().await.unwrap();
            assert_eq!(echoed, message, "peer {id} got someone else's bytes");
        }));
    }

    timeout(Duration::from_secs(10), async {
        for c in clients {
            c.await.unwrap();
        }
        server.await.unwrap();
    })
    .await
    .expect("peers timed out");
}

#[tokio::test]
async fn bidirectional_transfer() {
    let mut listener = Listener::bind("127.0.0.1:0", config(CongestionStrategy::Fixed(4)))
        .await
        .unwrap();
    let addr = listener.local_addr();
    let from_server = pattern(20_000);
    let from_client: Vec<u8> = pattern(15_000).into_iter().rev().collect();

    let expected = from_client.clone();
    let outgoing = from_server.clone();
    let server = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        conn.send(&outgoing).await.unwrap();
        let got = read_to_end(&mut conn).await;
        conn.close().await.unwrap();
        assert_eq!(got, expected);
    });

    let socket = Socket::bind("127.0.0.1:0", config(CongestionStrategy::Fixed(4)))
        .await
        .unwrap();
    let mut conn = socket.connect(addr).await.unwrap();
    conn.send(&from_client).await.unwrap();
    let got = timeout(Duration::from_secs(10), read_exact(&mut conn, from_server.len()))
        .await
        .expect("recv timed out");
    assert_eq!(got, from_server);
    conn.close().await.unwrap();

    timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn zero_fixed_window_still_carries_data() {
    let mut listener = Listener::bind("127.0.0.1:0", config(CongestionStrategy::Fixed(0)))
        .await
        .unwrap();
    let addr = listener.local_addr();
    let server = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        let got = read_to_end(&mut conn).await;
        conn.close().await.unwrap();
        got
    });

    let socket = Socket::bind("127.0.0.1:0", config(CongestionStrategy::Fixed(0)))
        .await
        .unwrap();
    let mut conn = timeout(Duration::from_secs(5), socket.connect(addr))
        .await
        .expect("connect timed out")
        .unwrap();
    let data = pattern(5000);
    conn.send(&data).await.unwrap();
    conn.close().await.unwrap();

    let got = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(got, data);
}

#[tokio::test]
async fn stuck_backlog_fails_send_but_keeps_the_connection() {
    let mut listener = Listener::bind("127.0.0.1:0", config(CongestionStrategy::Aimd))
        .await
        .unwrap();
    let addr = listener.local_addr();
    let socket = Socket::bind(
        "127.0.0.1:0",
        Config {
            initial_rto: Duration::from_millis(20),
            max_rto: Duration::from_millis(40),
            max_retransmits: 1000,
            max_buffered: 2,
            backlog_timeout: Duration::from_millis(200),
            congestion: CongestionStrategy::Fixed(1),
            ..Config::default()
        },
    )
    .await
    .unwrap();

    let accept = async { listener.accept().await };
    let (conn, server) = tokio::join!(socket.connect(addr), accept);
    let mut conn = conn.unwrap();
    // Not driven yet, so nothing we send is acknowledged.
    let mut server = server.unwrap();

    // One packet in flight plus two buffered, then the backlog is full.
    let data = pattern(10 * 1024);
    let err = timeout(Duration::from_secs(5), conn.send(&data))
        .await
        .expect("send hung")
        .unwrap_err();
    assert!(matches!(err, ConnError::CongestionCollapse), "{err:?}");
    assert_eq!(conn.state(), ConnectionState::Established);

    let queued = 3 * 1024;
    let reader = tokio::spawn(async move { read_exact(&mut server, queued + 4).await });

    conn.send(b"tail").await.expect("connection unusable after collapse");
    timeout(Duration::from_secs(5), conn.flush())
        .await
        .expect("flush timed out")
        .unwrap();

    let got = timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
    let mut expected = data[..queued].to_vec();
    expected.extend_from_slice(b"tail");
    assert_eq!(got, expected);
}

// ---------------------------------------------------------------------------
// Faulty network
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transfer_survives_loss_duplication_and_reordering() {
    for (seed, congestion) in [(7, CongestionStrategy::Fixed(4)), (11, CongestionStrategy::Aimd)] {
        let server_socket = lossy_socket(config(congestion), seed).await;
        let addr = server_socket.local_addr();
        let server = spawn_echo(server_socket.listen().unwrap());

        let client_socket = lossy_socket(config(congestion), seed + 1).await;
        let data = pattern(30_000);

        let echoed = timeout(Duration::from_secs(30), async {
            let mut conn = client_socket.connect(addr).await.unwrap();
            conn.send(&data).await.unwrap();
            let echoed = read_exact(&mut conn, data.len()).await;
            conn.close().await.unwrap();
            echoed
        })
        .await
        .expect("lossy transfer timed out");

        assert_eq!(echoed.len(), data.len());
        assert!(echoed == data, "payload corrupted or reordered (seed {seed})");
        let total = timeout(Duration::from_secs(30), server).await.unwrap().unwrap();
        assert_eq!(total, data.len());
    }
}

#[tokio::test]
async fn garbage_datagrams_do_not_disturb_a_connection() {
    let mut listener = Listener::bind("127.0.0.1:0", config(CongestionStrategy::Aimd))
        .await
        .unwrap();
    let addr: SocketAddr = listener.local_addr();
    let server = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        let got = read_to_end(&mut conn).await;
        conn.close().await.unwrap();
        got
    });

    let socket = Socket::bind("127.0.0.1:0", config(CongestionStrategy::Aimd))
        .await
        .unwrap();
    let mut conn = socket.connect(addr).await.unwrap();

    let noise = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    noise.send_to(&[0xff; 3], addr).await.unwrap();
    noise.send_to(&[0u8; 2000], addr).await.unwrap();

    conn.send(b"still intact").await.unwrap();
    conn.close().await.unwrap();
    let got = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(got, b"still intact");
}
