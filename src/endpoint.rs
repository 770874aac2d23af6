//! Application-facing connection handle.
//!
//! A [`ConnectionEndpoint`] owns one [`Tcb`] behind a mutex and three wait
//! conditions.  Three kinds of task drive it:
//!
//! - application calls (`connect`, `send_data`, `receive_data`, ...);
//! - the [`crate::demux::Demultiplexer`], through [`ConnectionEndpoint::handle_segment`]
//!   or the synchronous `process_segment` step;
//! - the endpoint's own retransmission timer.
//!
//! Each of them locks the TCB, runs one protocol step and releases the lock
//! *before* handing the resulting segments to the channel, which may wait
//! for capacity.
//!
//! ```text
//!  app task ──┐
//!  dispatcher ├──▶ Mutex<Tcb> ──▶ Reaction ──▶ channel.send (lock released)
//!  timer task ┘                        │
//!                                      └──▶ Notify: ack / data / established
//! ```

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::Notify;

use crate::channel::SimulatedChannel;
use crate::config::EndpointConfig;
use crate::connection::{EndpointStats, Reaction, Tcb, TimerAction};
use crate::error::{Error, Result};
use crate::segment::Segment;
use crate::state::ConnectionState;

/// Cloneable handle to one end of a connection.  Clones share the same
/// state; the demultiplexer's registry holds one of them.
#[derive(Clone)]
pub struct ConnectionEndpoint {
    inner: Arc<Inner>,
}

struct Inner {
    /// Handed to timer tasks so a pending expiry does not keep the endpoint
    /// alive.
    me: Weak<Inner>,
    local_port: u16,
    /// Lock-free copy of `Tcb::remote_port` for registry matching.
    remote_port: AtomicU16,
    channel: Arc<SimulatedChannel>,
    tcb: Mutex<Tcb>,
    ack_received: Notify,
    data_available: Notify,
    established: Notify,
}

impl ConnectionEndpoint {
    /// Create a CLOSED endpoint bound to `local_port`.  The caller registers
    /// it with a demultiplexer.
    pub fn new(
        local_port: u16,
        channel: Arc<SimulatedChannel>,
        config: EndpointConfig,
    ) -> Result<Self> {
        config.validate()?;
        if local_port == 0 {
            return Err(Error::config("local_port", "port 0 is the unbound wildcard"));
        }
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            local_port,
            remote_port: AtomicU16::new(0),
            channel,
            tcb: Mutex::new(Tcb::new(local_port, &config)),
            ack_received: Notify::new(),
            data_available: Notify::new(),
            established: Notify::new(),
        });
        Ok(Self { inner })
    }

    /// Active open.  Returns once the handshake has settled: `Established`
    /// on success, `Closed` if the SYN was retried to exhaustion.
    pub async fn connect(&self, remote_port: u16) -> ConnectionState {
        let out = {
            let mut tcb = self.inner.lock();
            let r = tcb.open_active(remote_port);
            if r.outbound.is_empty() {
                log::warn!("[ep:{}] connect ignored in {}", self.inner.local_port, tcb.state);
                return tcb.state;
            }
            self.inner.react(&mut tcb, r)
        };
        log::info!("[ep:{}] connecting to port {remote_port}", self.inner.local_port);
        self.inner.transmit(out).await;
        self.await_handshake().await
    }

    /// Passive open.  Returns once a peer's SYN has been answered, or
    /// immediately if the endpoint was already used.
    pub async fn listen(&self) -> ConnectionState {
        {
            let mut tcb = self.inner.lock();
            tcb.open_passive();
        }
        log::info!("[ep:{}] listening", self.inner.local_port);
        self.await_handshake().await
    }

    async fn await_handshake(&self) -> ConnectionState {
        let state = self
            .inner
            .wait_until(&self.inner.established, |tcb| {
                tcb.state.handshake_settled().then_some(tcb.state)
            })
            .await;
        if state == ConnectionState::Established {
            log::info!(
                "[ep:{}] connection established with port {}",
                self.inner.local_port,
                self.remote_port()
            );
        }
        state
    }

    /// Fragment `data` into MSS-sized segments and hand them to the channel,
    /// waiting for window space as needed.
    ///
    /// Returns the number of bytes queued for transmission.  This is
    /// `data.len()` unless the connection closed part-way, e.g. after
    /// retry exhaustion.
    pub async fn send_data(&self, data: &[u8]) -> usize {
        let mut queued = 0;
        while queued < data.len() {
            let rest = &data[queued..];
            let step = self
                .inner
                .wait_until(&self.inner.ack_received, |tcb| match tcb.state {
                    ConnectionState::Established | ConnectionState::CloseWait => {
                        if tcb.send.sequence_space_exhausted() {
                            log::warn!(
                                "[ep:{}] sequence space exhausted; only close is possible",
                                tcb.local_port
                            );
                            return Some(None);
                        }
                        let (n, r) = tcb.send_fragment(rest)?;
                        Some(Some((n, self.inner.react(tcb, r))))
                    }
                    _ => Some(None),
                })
                .await;
            let Some((n, out)) = step else {
                log::debug!(
                    "[ep:{}] send_data stopped after {queued} of {} bytes",
                    self.inner.local_port,
                    data.len()
                );
                break;
            };
            self.inner.transmit(out).await;
            queued += n;
        }
        queued
    }

    /// Fill `buf` with delivered bytes.
    ///
    /// Waits until `buf` is full, or returns early with what was copied once
    /// the peer has closed (or the connection is gone) and nothing is
    /// queued.
    pub async fn receive_data(&self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let step = self
                .inner
                .wait_until(&self.inner.data_available, |tcb| {
                    if !tcb.recv.is_empty() {
                        let (n, r) = tcb.read(&mut buf[copied..]);
                        return Some(Some((n, self.inner.react(tcb, r))));
                    }
                    match tcb.state {
                        ConnectionState::CloseWait | ConnectionState::Closed => Some(None),
                        _ => None,
                    }
                })
                .await;
            let Some((n, out)) = step else { break };
            self.inner.transmit(out).await;
            copied += n;
        }
        copied
    }

    /// Start the teardown by sending FIN.  Does not wait for the peer.
    pub async fn close(&self) {
        let out = {
            let mut tcb = self.inner.lock();
            let r = tcb.close();
            self.inner.react(&mut tcb, r)
        };
        if !out.is_empty() {
            log::info!("[ep:{}] closing", self.inner.local_port);
        }
        self.inner.transmit(out).await;
    }

    /// Wait until every sent segment is acknowledged (`true`) or the
    /// connection is closed with data outstanding (`false`).
    pub async fn flush(&self) -> bool {
        self.inner
            .wait_until(&self.inner.ack_received, |tcb| {
                if tcb.send.all_confirmed() {
                    Some(true)
                } else if tcb.state == ConnectionState::Closed {
                    Some(false)
                } else {
                    None
                }
            })
            .await
    }

    /// Run one inbound segment through the state machine and transmit the
    /// reply, if any.
    pub async fn handle_segment(&self, segment: Segment) -> Result<()> {
        let out = self.process_segment(segment)?;
        self.inner.transmit(out).await;
        Ok(())
    }

    /// Synchronous half of [`Self::handle_segment`]: processes the segment
    /// and returns the segments to transmit instead of sending them.
    pub(crate) fn process_segment(&self, segment: Segment) -> Result<Vec<Segment>> {
        if segment.dest_port != self.inner.local_port {
            return Err(Error::Misrouted {
                expected: self.inner.local_port,
                actual: segment.dest_port,
            });
        }
        let mut tcb = self.inner.lock();
        let r = tcb.on_segment(segment);
        Ok(self.inner.react(&mut tcb, r))
    }

    /// `true` iff `snd_unack == snd_next`.
    pub fn all_segments_confirmed(&self) -> bool {
        self.inner.lock().send.all_confirmed()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    /// Bound peer port, `0` while unbound.
    pub fn remote_port(&self) -> u16 {
        self.inner.remote_port.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> EndpointStats {
        self.inner.lock().stats
    }

    /// `true` if both handles refer to the same endpoint.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ConnectionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEndpoint")
            .field("local_port", &self.local_port())
            .field("remote_port", &self.remote_port())
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Tcb> {
        self.tcb.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Carry out the non-I/O parts of a reaction while the lock is held and
    /// return the segments to send once it is released.
    fn react(&self, tcb: &mut Tcb, r: Reaction) -> Vec<Segment> {
        match r.timer {
            TimerAction::Keep => {}
            TimerAction::Restart => self.arm_timer(tcb),
            TimerAction::Stop => tcb.timer.cancel(),
        }
        self.remote_port.store(tcb.remote_port, Ordering::Release);

        if r.wake_senders {
            self.ack_received.notify_waiters();
        }
        if r.wake_readers {
            self.data_available.notify_waiters();
        }
        if r.wake_handshake {
            self.established.notify_waiters();
        }

        tcb.stats.segments_sent += r.outbound.len() as u64;
        r.outbound
    }

    fn arm_timer(&self, tcb: &mut Tcb) {
        let me = self.me.clone();
        tcb.timer.arm(move |generation| async move {
            let Some(inner) = me.upgrade() else { return };
            let out = inner.on_timeout(generation);
            inner.transmit(out).await;
        });
    }

    fn on_timeout(&self, generation: u64) -> Vec<Segment> {
        let mut tcb = self.lock();
        if !tcb.timer.is_current(generation) {
            return Vec::new();
        }
        tcb.timer.fired();
        let r = tcb.on_retransmit_timeout();
        self.react(&mut tcb, r)
    }

    async fn transmit(&self, segments: Vec<Segment>) {
        for segment in segments {
            log::trace!("[ep:{}] → {segment}", self.local_port);
            self.channel.send(segment).await;
        }
    }

    /// Wait on `notify` until `ready` yields a value.  `ready` runs under the
    /// TCB lock; the waiter is registered before each check, so a signal
    /// raised in between is not lost.
    async fn wait_until<T>(
        &self,
        notify: &Notify,
        mut ready: impl FnMut(&mut Tcb) -> Option<T>,
    ) -> T {
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let value = {
                let mut tcb = self.lock();
                ready(&mut tcb)
            };
            if let Some(value) = value {
                return value;
            }

            notified.await;
        }
    }
}
