//! Routes segments from the shared channel to their endpoints.
//!
//! The [`Demultiplexer`] keeps the registry of active endpoints and runs the
//! single dispatch loop: pop a datagram, decode it, find the endpoint for
//! `(dest_port, source_port)`, run its processing step, repeat.  Replies
//! produced by the endpoints leave through one forwarding task, in the order
//! they were produced.
//!
//! Matching prefers an exact `(local, remote)` pair over a listening
//! endpoint whose remote port is still unbound (`0`).  Segments with no
//! match are discarded; on a lossy network that is an ordinary event.
//!
//! The registry lock covers lookup and mutation only.  It is released before
//! any endpoint handler runs, and matching reads each endpoint's remote port
//! without taking the endpoint's own lock.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::SimulatedChannel;
use crate::endpoint::ConnectionEndpoint;
use crate::error::Result;
use crate::segment::Segment;

pub struct Demultiplexer {
    channel: Arc<SimulatedChannel>,
    endpoints: Mutex<Vec<ConnectionEndpoint>>,
    unroutable: AtomicU64,
    faults: AtomicU64,
}

impl Demultiplexer {
    pub fn new(channel: Arc<SimulatedChannel>) -> Self {
        Self {
            channel,
            endpoints: Mutex::new(Vec::new()),
            unroutable: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        }
    }

    pub fn register(&self, endpoint: ConnectionEndpoint) {
        log::debug!("[demux] registered port {}", endpoint.local_port());
        self.registry().push(endpoint);
    }

    /// Remove `endpoint` from the registry.  Returns `false` if it was not
    /// registered.
    pub fn unregister(&self, endpoint: &ConnectionEndpoint) -> bool {
        let mut endpoints = self.registry();
        let Some(index) = endpoints.iter().position(|e| e.ptr_eq(endpoint)) else {
            return false;
        };
        endpoints.remove(index);
        log::debug!("[demux] unregistered port {}", endpoint.local_port());
        true
    }

    /// The endpoint that should receive a segment addressed to `local_port`
    /// from `remote_port`.
    pub fn lookup(&self, local_port: u16, remote_port: u16) -> Option<ConnectionEndpoint> {
        let endpoints = self.registry();
        let mut listening = None;
        for endpoint in endpoints.iter().filter(|e| e.local_port() == local_port) {
            match endpoint.remote_port() {
                bound if bound == remote_port => return Some(endpoint.clone()),
                0 if listening.is_none() => listening = Some(endpoint),
                _ => {}
            }
        }
        listening.cloned()
    }

    /// Segments discarded because no endpoint matched.
    pub fn unroutable(&self) -> u64 {
        self.unroutable.load(Ordering::Relaxed)
    }

    /// Datagrams discarded because they did not decode or their handler
    /// failed.
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Route one datagram and return the endpoint's replies.  A datagram
    /// that fails to decode, or whose handler errors or panics, is logged
    /// and yields no replies.
    pub(crate) fn dispatch(&self, datagram: &[u8]) -> Vec<Segment> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.route(datagram))) {
            Ok(Ok(replies)) => replies,
            Ok(Err(e)) => {
                self.faults.fetch_add(1, Ordering::Relaxed);
                log::warn!("[demux] {e}; datagram dropped");
                Vec::new()
            }
            Err(_) => {
                self.faults.fetch_add(1, Ordering::Relaxed);
                log::error!("[demux] segment handler panicked; datagram dropped");
                Vec::new()
            }
        }
    }

    fn route(&self, datagram: &[u8]) -> Result<Vec<Segment>> {
        let segment = Segment::decode(datagram)?;
        let Some(endpoint) = self.lookup(segment.dest_port, segment.source_port) else {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
            log::trace!("[demux] no endpoint for {segment}; discarded");
            return Ok(Vec::new());
        };

        log::trace!("[demux] {segment} → port {}", endpoint.local_port());
        endpoint.process_segment(segment)
    }

    /// The dispatch loop.  Runs until its task is aborted.
    ///
    /// This loop is the channel's only consumer, so it never waits for
    /// channel capacity itself.  Replies are queued to a single forwarding
    /// task, which keeps them in dispatch order.  Dropping the loop closes
    /// the queue and ends the forwarder.
    pub async fn run(&self) {
        log::debug!("[demux] dispatch loop started");
        let replies_tx = forward_replies(Arc::clone(&self.channel));
        loop {
            let datagram = self.channel.receive_datagram().await;
            let replies = self.dispatch(&datagram);
            if !replies.is_empty() && replies_tx.send(replies).is_err() {
                log::error!("[demux] reply forwarder gone; dispatch loop stopping");
                return;
            }
        }
    }

    /// Run the dispatch loop on its own task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let demux = Arc::clone(self);
        tokio::spawn(async move { demux.run().await })
    }

    fn registry(&self) -> MutexGuard<'_, Vec<ConnectionEndpoint>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawn the task that writes reply batches to `channel` one after another.
fn forward_replies(channel: Arc<SimulatedChannel>) -> mpsc::UnboundedSender<Vec<Segment>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Segment>>();
    tokio::spawn(async move {
        while let Some(replies) = rx.recv().await {
            for reply in replies {
                channel.send(reply).await;
            }
        }
        log::debug!("[demux] reply forwarder stopped");
    });
    tx
}

impl std::fmt::Debug for Demultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demultiplexer")
            .field("endpoints", &self.registry().len())
            .field("unroutable", &self.unroutable())
            .field("faults", &self.faults())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{ChannelConfig, EndpointConfig};
    use crate::segment::flags;
    use crate::state::ConnectionState;

    fn channel() -> Arc<SimulatedChannel> {
        Arc::new(SimulatedChannel::new(ChannelConfig::default()).unwrap())
    }

    async fn listening(server: &ConnectionEndpoint) {
        tokio::spawn({
            let server = server.clone();
            async move { server.listen().await }
        });
        while server.state() != ConnectionState::Listen {
            tokio::task::yield_now().await;
        }
    }

    fn endpoint(port: u16, channel: &Arc<SimulatedChannel>) -> ConnectionEndpoint {
        ConnectionEndpoint::new(port, Arc::clone(channel), EndpointConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn exact_match_beats_wildcard() {
        let chan = channel();
        let demux = Demultiplexer::new(Arc::clone(&chan));
        let listener = endpoint(20, &chan);
        let connected = endpoint(20, &chan);
        demux.register(listener.clone());
        demux.register(connected.clone());

        // connect() binds the remote port before its SYN goes out.
        tokio::spawn({
            let connected = connected.clone();
            async move { connected.connect(10).await }
        });
        while connected.remote_port() != 10 {
            tokio::task::yield_now().await;
        }

        assert!(demux.lookup(20, 10).unwrap().ptr_eq(&connected));
        assert!(demux.lookup(20, 11).unwrap().ptr_eq(&listener));
        assert!(demux.lookup(21, 10).is_none());
    }

    #[tokio::test]
    async fn unmatched_segments_are_counted_and_dropped() {
        let chan = channel();
        let demux = Demultiplexer::new(Arc::clone(&chan));
        let replies = demux.dispatch(&Segment::new(10, 99).with_flags(flags::SYN).encode());
        assert!(replies.is_empty());
        assert_eq!(demux.unroutable(), 1);
    }

    #[tokio::test]
    async fn unregister_removes_only_that_endpoint() {
        let chan = channel();
        let demux = Demultiplexer::new(Arc::clone(&chan));
        let a = endpoint(20, &chan);
        let b = endpoint(30, &chan);
        demux.register(a.clone());
        demux.register(b.clone());

        assert!(demux.unregister(&a));
        assert!(!demux.unregister(&a));
        assert!(demux.lookup(20, 10).is_none());
        assert!(demux.lookup(30, 10).unwrap().ptr_eq(&b));
    }

    #[tokio::test]
    async fn dispatch_returns_handler_replies() {
        let chan = channel();
        let demux = Demultiplexer::new(Arc::clone(&chan));
        let server = endpoint(20, &chan);
        demux.register(server.clone());
        listening(&server).await;

        let syn = Segment::new(10, 20).with_flags(flags::SYN).with_wnd(1500);
        let replies = demux.dispatch(&syn.encode());
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_syn() && replies[0].is_ack());
        assert_eq!(server.state(), ConnectionState::Established);
        assert_eq!(demux.lookup(20, 10).map(|e| e.remote_port()), Some(10));
    }

    #[tokio::test]
    async fn loop_routes_channel_traffic() {
        let chan = channel();
        let demux = Arc::new(Demultiplexer::new(Arc::clone(&chan)));
        let client = endpoint(10, &chan);
        let server = endpoint(20, &chan);
        demux.register(client.clone());
        demux.register(server.clone());
        let dispatcher = demux.spawn();

        let listening = tokio::spawn({
            let server = server.clone();
            async move { server.listen().await }
        });
        while server.state() != ConnectionState::Listen {
            tokio::task::yield_now().await;
        }
        let state = tokio::time::timeout(Duration::from_secs(5), client.connect(20))
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Established);
        assert_eq!(listening.await.unwrap(), ConnectionState::Established);
        dispatcher.abort();
    }

    #[tokio::test]
    async fn undecodable_datagram_is_counted_and_routing_continues() {
        let chan = channel();
        let demux = Demultiplexer::new(Arc::clone(&chan));
        let server = endpoint(20, &chan);
        demux.register(server.clone());
        listening(&server).await;

        let syn = Segment::new(10, 20).with_flags(flags::SYN).with_wnd(1500);
        let mut corrupt = syn.encode();
        corrupt[4] ^= 0x01;
        assert!(demux.dispatch(&corrupt).is_empty());
        assert!(demux.dispatch(&[0xde, 0xad]).is_empty());
        assert_eq!(demux.faults(), 2);
        assert_eq!(server.state(), ConnectionState::Listen);

        let replies = demux.dispatch(&syn.encode());
        assert_eq!(replies.len(), 1);
        assert_eq!(server.state(), ConnectionState::Established);
        assert_eq!(demux.unroutable(), 0);
    }

    #[tokio::test]
    async fn fin_at_end_of_sequence_space_is_answered() {
        let chan = channel();
        let demux = Demultiplexer::new(Arc::clone(&chan));
        demux.register(endpoint(20, &chan));

        let fin = Segment::new(10, 20)
            .with_flags(flags::FIN | flags::ACK)
            .with_seq(u32::MAX);
        let replies = demux.dispatch(&fin.encode());
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].ack, 0);
        assert_eq!(replies[0].dest_port, 10);
        assert_eq!(demux.faults(), 0);
    }

    #[tokio::test]
    async fn forwarder_keeps_reply_order() {
        let chan = Arc::new(
            SimulatedChannel::new(ChannelConfig {
                capacity: 1,
                ..ChannelConfig::default()
            })
            .unwrap(),
        );
        let tx = forward_replies(Arc::clone(&chan));
        let reply = |seq: u32| Segment::new(20, 10).with_seq(seq);
        tx.send(vec![reply(0), reply(1)]).unwrap();
        tx.send(vec![reply(2)]).unwrap();
        tx.send(vec![reply(3), reply(4)]).unwrap();

        for seq in 0..5 {
            let got = tokio::time::timeout(Duration::from_secs(1), chan.receive())
                .await
                .expect("forwarder stalled")
                .unwrap();
            assert_eq!(got.seq, seq);
        }
    }

    #[tokio::test]
    async fn loop_survives_malformed_traffic() {
        let chan = channel();
        let demux = Arc::new(Demultiplexer::new(Arc::clone(&chan)));
        let client = endpoint(10, &chan);
        let server = endpoint(20, &chan);
        demux.register(client.clone());
        demux.register(server.clone());
        let dispatcher = demux.spawn();

        chan.send_datagram(vec![0u8; 4]).await;
        let mut corrupt = Segment::new(10, 20).with_flags(flags::SYN).encode();
        corrupt[0] ^= 0xff;
        chan.send_datagram(corrupt).await;

        listening(&server).await;
        let state = tokio::time::timeout(Duration::from_secs(5), client.connect(20))
            .await
            .expect("handshake stalled behind malformed datagrams");
        assert_eq!(state, ConnectionState::Established);
        assert_eq!(demux.faults(), 2);
        dispatcher.abort();
    }
}
