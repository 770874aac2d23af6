//! End-to-end data transfer tests.
//!
//! Covers:
//! 1. A short message delivered intact, followed by a mutual close.
//! 2. An endpoint whose every segment is lost gives up after `max_retries`.
//! 3. Out-of-order arrivals reassembled in sequence order.
//! 4. Reliable delivery over a lossy channel.
//! 5. Flow control against a tiny receive queue and a slow reader.
//! 6. Early return from `receive_data` once the peer has closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use tcp_sim::segment::flags;
use tcp_sim::{
    ChannelConfig, ConnectionEndpoint, ConnectionState, Demultiplexer, EndpointConfig, Segment,
    SimulatedChannel,
};

const CLIENT: u16 = 10;
const SERVER: u16 = 20;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Net {
    channel: Arc<SimulatedChannel>,
    client: ConnectionEndpoint,
    server: ConnectionEndpoint,
    dispatcher: JoinHandle<()>,
}

impl Drop for Net {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn net(channel: ChannelConfig, config: EndpointConfig) -> Net {
    let channel = Arc::new(SimulatedChannel::new(channel).unwrap());
    let demux = Arc::new(Demultiplexer::new(Arc::clone(&channel)));
    let client = ConnectionEndpoint::new(CLIENT, Arc::clone(&channel), config.clone()).unwrap();
    let server = ConnectionEndpoint::new(SERVER, Arc::clone(&channel), config).unwrap();
    demux.register(client.clone());
    demux.register(server.clone());
    let dispatcher = demux.spawn();
    Net {
        channel,
        client,
        server,
        dispatcher,
    }
}

async fn establish(net: &Net) {
    let listening = tokio::spawn({
        let server = net.server.clone();
        async move { server.listen().await }
    });
    while net.server.state() != ConnectionState::Listen {
        tokio::task::yield_now().await;
    }
    let state = tokio::time::timeout(Duration::from_secs(60), net.client.connect(SERVER))
        .await
        .expect("connect timed out");
    assert_eq!(state, ConnectionState::Established);
    assert_eq!(listening.await.unwrap(), ConnectionState::Established);
}

/// Read exactly `len` bytes on a background task.
fn spawn_reader(server: &ConnectionEndpoint, len: usize) -> JoinHandle<Vec<u8>> {
    let server = server.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; len];
        let n = server.receive_data(&mut buf).await;
        buf.truncate(n);
        buf
    })
}

async fn wait_for_state(ep: &ConnectionEndpoint, state: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while ep.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("port {} stuck in {}", ep.local_port(), ep.state()));
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hello_world_then_mutual_close() {
    let net = net(ChannelConfig::default(), EndpointConfig::default());
    establish(&net).await;

    let reader = spawn_reader(&net.server, 12);
    assert_eq!(net.client.send_data(b"Hello world!").await, 12);
    assert!(net.client.flush().await);

    let received = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("receive timed out")
        .unwrap();
    assert_eq!(received, b"Hello world!");

    net.client.close().await;
    wait_for_state(&net.server, ConnectionState::CloseWait).await;
    net.server.close().await;

    wait_for_state(&net.client, ConnectionState::Closed).await;
    wait_for_state(&net.server, ConnectionState::Closed).await;
}

#[tokio::test(start_paused = true)]
async fn total_loss_exhausts_retries_and_closes() {
    let config = EndpointConfig::default();
    let max_retries = config.max_retries;
    let channel = Arc::new(
        SimulatedChannel::new(ChannelConfig {
            drop_probability: 1.0,
            ..ChannelConfig::default()
        })
        .unwrap(),
    );
    let client = ConnectionEndpoint::new(CLIENT, Arc::clone(&channel), config).unwrap();

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect(SERVER).await }
    });
    while client.state() != ConnectionState::SynSent {
        tokio::task::yield_now().await;
    }

    // The peer's SYN+ACK is delivered by hand; everything the client sends
    // is lost.
    let syn_ack = Segment::new(SERVER, CLIENT)
        .with_flags(flags::SYN | flags::ACK)
        .with_ack(1)
        .with_wnd(30);
    client.handle_segment(syn_ack).await.unwrap();
    assert_eq!(connecting.await.unwrap(), ConnectionState::Established);

    let sent = tokio::time::timeout(Duration::from_secs(60), client.send_data(&[7u8; 90]))
        .await
        .expect("send_data never unblocked");

    assert_eq!(sent, 30, "only the first window's worth was queued");
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.stats().retransmissions, u64::from(max_retries));
    assert!(!client.all_segments_confirmed());
    assert_eq!(channel.stats().enqueued, 0);
}

#[tokio::test(start_paused = true)]
async fn out_of_order_segments_are_reassembled() {
    let channel = Arc::new(
        SimulatedChannel::new(ChannelConfig {
            capacity: 16,
            ..ChannelConfig::default()
        })
        .unwrap(),
    );
    let server =
        ConnectionEndpoint::new(SERVER, Arc::clone(&channel), EndpointConfig::default()).unwrap();
    let listening = tokio::spawn({
        let server = server.clone();
        async move { server.listen().await }
    });
    while server.state() != ConnectionState::Listen {
        tokio::task::yield_now().await;
    }
    let syn = Segment::new(CLIENT, SERVER).with_flags(flags::SYN).with_wnd(1500);
    server.handle_segment(syn).await.unwrap();
    assert_eq!(listening.await.unwrap(), ConnectionState::Established);
    let syn_ack = channel.receive().await.unwrap();
    assert_eq!(syn_ack.ack, 1);

    let data = |seq: u32, byte: u8| {
        Segment::new(CLIENT, SERVER)
            .with_flags(flags::PSH | flags::ACK)
            .with_seq(seq)
            .with_ack(1)
            .with_wnd(1500)
            .with_payload(vec![byte; 30])
    };

    // The third segment overtakes the second.
    server.handle_segment(data(61, b'c')).await.unwrap();
    let dup_ack = channel.receive().await.unwrap();
    assert_eq!(dup_ack.ack, 1);
    assert_eq!(server.stats().out_of_order, 1);

    server.handle_segment(data(1, b'a')).await.unwrap();
    assert_eq!(channel.receive().await.unwrap().ack, 31);

    server.handle_segment(data(31, b'b')).await.unwrap();
    assert_eq!(channel.receive().await.unwrap().ack, 91, "buffered segment drained");

    let mut buf = [0u8; 90];
    assert_eq!(server.receive_data(&mut buf).await, 90);
    assert_eq!(&buf[..30], &[b'a'; 30]);
    assert_eq!(&buf[30..60], &[b'b'; 30]);
    assert_eq!(&buf[60..], &[b'c'; 30]);
}

#[tokio::test(start_paused = true)]
async fn lossy_channel_delivers_everything_in_order() {
    let net = net(
        ChannelConfig {
            drop_probability: 0.2,
            seed: Some(7),
            ..ChannelConfig::default()
        },
        EndpointConfig {
            rto: Duration::from_millis(50),
            max_retries: 20,
            ..EndpointConfig::default()
        },
    );
    establish(&net).await;

    let message = pattern(600);
    let reader = spawn_reader(&net.server, message.len());
    assert_eq!(net.client.send_data(&message).await, message.len());

    let received = tokio::time::timeout(Duration::from_secs(600), reader)
        .await
        .expect("receive timed out")
        .unwrap();
    assert_eq!(received, message);
    assert!(net.channel.stats().dropped > 0);
}

#[tokio::test(start_paused = true)]
async fn tiny_window_throttles_sender_to_slow_reader() {
    let net = net(
        ChannelConfig::default(),
        EndpointConfig {
            mss: 5,
            recv_queue_capacity: 2,
            rto: Duration::from_millis(200),
            max_retries: 50,
        },
    );
    establish(&net).await;

    let message = pattern(100);
    let sender = tokio::spawn({
        let client = net.client.clone();
        let message = message.clone();
        async move { client.send_data(&message).await }
    });

    let mut received = Vec::new();
    while received.len() < message.len() {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut chunk = [0u8; 7];
        let want = chunk.len().min(message.len() - received.len());
        let n = net.server.receive_data(&mut chunk[..want]).await;
        assert!(n > 0, "reader starved");
        received.extend_from_slice(&chunk[..n]);
    }

    assert_eq!(received, message);
    assert_eq!(sender.await.unwrap(), message.len());
    assert!(net.client.flush().await);
}

#[tokio::test]
async fn receive_returns_early_after_peer_close() {
    let net = net(ChannelConfig::default(), EndpointConfig::default());
    establish(&net).await;

    net.client.send_data(b"abc").await;
    net.client.close().await;
    wait_for_state(&net.server, ConnectionState::CloseWait).await;

    let mut buf = [0u8; 64];
    let n = net.server.receive_data(&mut buf).await;
    assert_eq!(&buf[..n], b"abc");
    assert_eq!(net.server.receive_data(&mut buf).await, 0);
}

#[tokio::test]
async fn flush_waits_for_every_acknowledgement() {
    let net = net(ChannelConfig::default(), EndpointConfig::default());
    establish(&net).await;

    let message = pattern(300);
    let reader = spawn_reader(&net.server, message.len());
    net.client.send_data(&message).await;

    let flushed = tokio::time::timeout(Duration::from_secs(5), net.client.flush())
        .await
        .expect("flush timed out");
    assert!(flushed);
    assert!(net.client.all_segments_confirmed());
    assert_eq!(reader.await.unwrap(), message);
    assert_eq!(net.client.stats().retransmissions, 0);
}
