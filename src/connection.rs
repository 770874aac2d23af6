//! Per-connection protocol engine.
//!
//! [`Tcb`] (transmission control block) holds the complete state for one
//! connection and implements the state machine, the cumulative-ACK
//! processing, the reorder drain and the retransmission decision.  Every
//! method is synchronous and runs under the owning endpoint's lock.
//!
//! Methods never perform I/O.  Each returns a [`Reaction`]: the segments to
//! transmit once the lock is released, what to do with the retransmission
//! timer, and which wait conditions to signal.  The
//! [`crate::endpoint::ConnectionEndpoint`] applies it.

use crate::config::EndpointConfig;
use crate::receiver::{Arrival, ReceiveBuffer};
use crate::segment::{flags, Segment};
use crate::sender::SendWindow;
use crate::state::ConnectionState;
use crate::timer::RetransmitTimer;

/// Counters exposed through [`crate::endpoint::ConnectionEndpoint::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Segments handed to the channel, including retransmissions.
    pub segments_sent: u64,
    /// Timeout-driven retransmissions of the oldest unacknowledged segment.
    pub retransmissions: u64,
    /// Segments that arrived ahead of `rcv_next`.
    pub out_of_order: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerAction {
    #[default]
    Keep,
    Restart,
    Stop,
}

#[derive(Debug, Default)]
pub(crate) struct Reaction {
    pub outbound: Vec<Segment>,
    pub timer: TimerAction,
    /// "window/ack available"
    pub wake_senders: bool,
    /// "data available"
    pub wake_readers: bool,
    /// "handshake established"
    pub wake_handshake: bool,
}

impl Reaction {
    fn wake_all(&mut self) {
        self.wake_senders = true;
        self.wake_readers = true;
        self.wake_handshake = true;
    }
}

#[derive(Debug)]
pub(crate) struct Tcb {
    pub state: ConnectionState,
    pub local_port: u16,
    /// `0` until the handshake binds a peer.
    pub remote_port: u16,
    pub send: SendWindow,
    pub recv: ReceiveBuffer,
    pub timer: RetransmitTimer,
    /// Retransmissions of the current oldest segment.
    pub retries: u32,
    /// Set once the peer's FIN has been consumed.
    peer_fin: bool,
    /// Set by the first connect or listen; a used TCB is never reopened.
    opened: bool,
    mss: usize,
    max_retries: u32,
    pub stats: EndpointStats,
}

impl Tcb {
    pub fn new(local_port: u16, config: &EndpointConfig) -> Self {
        Self {
            state: ConnectionState::Closed,
            local_port,
            remote_port: 0,
            send: SendWindow::new(),
            recv: ReceiveBuffer::new(config.recv_queue_capacity, config.mss),
            timer: RetransmitTimer::new(config.rto),
            retries: 0,
            peer_fin: false,
            opened: false,
            mss: config.mss,
            max_retries: config.max_retries,
            stats: EndpointStats::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Application events
    // -----------------------------------------------------------------------

    /// CLOSED --connect--> SYN_SENT.
    pub fn open_active(&mut self, remote_port: u16) -> Reaction {
        let mut r = Reaction::default();
        if self.opened {
            return r;
        }
        self.opened = true;
        self.remote_port = remote_port;
        let syn = self.segment(flags::SYN);
        self.transmit_new(syn, &mut r);
        r.timer = TimerAction::Restart;
        self.enter(ConnectionState::SynSent);
        r
    }

    /// CLOSED --listen--> LISTEN.
    pub fn open_passive(&mut self) {
        if !self.opened {
            self.opened = true;
            self.enter(ConnectionState::Listen);
        }
    }

    /// Build, store and emit the next data fragment from `data`.
    ///
    /// Returns `None` when the window is closed; the caller waits for an ACK
    /// and tries again.
    pub fn send_fragment(&mut self, data: &[u8]) -> Option<(usize, Reaction)> {
        let len = self.send.sendable(self.mss)?.min(data.len());
        let mut r = Reaction::default();
        let fragment = self
            .segment(flags::PSH | flags::ACK)
            .with_payload(&data[..len]);
        log::trace!(
            "[ep:{}] → DATA seq={} len={} in_flight={}",
            self.local_port,
            fragment.seq,
            len,
            self.send.in_flight()
        );
        if self.transmit_new(fragment, &mut r) {
            r.timer = TimerAction::Restart;
        }
        Some((len, r))
    }

    /// Any non-CLOSED state --close--> FIN_WAIT.
    pub fn close(&mut self) -> Reaction {
        let mut r = Reaction::default();
        if self.state == ConnectionState::Closed {
            return r;
        }
        let fin = self.segment(flags::FIN | flags::ACK);
        self.transmit_new(fin, &mut r);
        r.timer = TimerAction::Restart;
        self.enter(ConnectionState::FinWait);
        r
    }

    /// Copy delivered bytes into `buf`.  Once the queue runs dry after a
    /// read, the reaction carries a window update for the peer.
    pub fn read(&mut self, buf: &mut [u8]) -> (usize, Reaction) {
        let mut r = Reaction::default();
        let n = self.recv.read(buf);
        if n > 0 && self.recv.is_empty() && self.state != ConnectionState::Closed {
            r.outbound.push(self.ack_segment());
        }
        (n, r)
    }

    // -----------------------------------------------------------------------
    // Timer event
    // -----------------------------------------------------------------------

    /// Retransmission timeout for the oldest unacknowledged segment.
    pub fn on_retransmit_timeout(&mut self) -> Reaction {
        let mut r = Reaction::default();
        if self.state == ConnectionState::Closed {
            r.timer = TimerAction::Stop;
            return r;
        }
        let Some(oldest) = self.send.oldest().cloned() else {
            r.timer = TimerAction::Stop;
            return r;
        };

        if self.retries >= self.max_retries {
            log::warn!(
                "[ep:{}] seq={} unacknowledged after {} retransmissions; aborting",
                self.local_port,
                oldest.seq,
                self.retries
            );
            self.enter(ConnectionState::Closed);
            r.timer = TimerAction::Stop;
            r.wake_all();
            return r;
        }

        self.retries += 1;
        self.stats.retransmissions += 1;
        log::debug!(
            "[ep:{}] timeout; retransmitting seq={} (attempt {})",
            self.local_port,
            oldest.seq,
            self.retries
        );
        r.outbound.push(oldest);
        r.timer = TimerAction::Restart;
        r
    }

    // -----------------------------------------------------------------------
    // Network event
    // -----------------------------------------------------------------------

    /// Run one inbound segment through the state machine.
    pub fn on_segment(&mut self, seg: Segment) -> Reaction {
        let mut r = Reaction::default();
        log::trace!("[ep:{}] ← {seg} in {}", self.local_port, self.state);

        match self.state {
            ConnectionState::Closed => {
                // The peer may retransmit its FIN after we already closed.
                if seg.is_fin() {
                    let ack = Segment::new(self.local_port, seg.source_port)
                        .with_flags(flags::ACK)
                        .with_seq(self.send.snd_next)
                        .with_ack(seg.seq_end())
                        .with_wnd(self.recv.advertised_window());
                    r.outbound.push(ack);
                }
            }

            ConnectionState::Listen => {
                if seg.is_syn() && !seg.is_ack() {
                    self.remote_port = seg.source_port;
                    self.send.snd_wnd = seg.wnd;
                    self.recv.synchronize(seg.seq_end());
                    let syn_ack = self.segment(flags::SYN | flags::ACK);
                    self.transmit_new(syn_ack, &mut r);
                    r.timer = TimerAction::Restart;
                    self.enter(ConnectionState::Established);
                    r.wake_handshake = true;
                }
            }

            ConnectionState::SynSent => {
                if seg.is_syn() && seg.is_ack() {
                    self.recv.synchronize(seg.seq_end());
                    self.send.complete_handshake(seg.ack, seg.wnd);
                    self.retries = 0;
                    r.timer = TimerAction::Stop;
                    r.outbound.push(self.ack_segment());
                    self.enter(ConnectionState::Established);
                    r.wake_handshake = true;
                }
            }

            ConnectionState::Established => {
                self.process_ack(&seg, &mut r);
                if seg.occupies_sequence_space() {
                    self.accept_data(seg, &mut r);
                }
            }

            ConnectionState::FinWait => {
                self.process_ack(&seg, &mut r);
                if seg.is_fin() {
                    self.recv.consume_fin(seg.seq_end());
                    self.peer_fin = true;
                    r.outbound.push(self.ack_segment());
                    r.timer = TimerAction::Stop;
                    self.enter(ConnectionState::Closed);
                    r.wake_all();
                } else if self.peer_fin && self.send.all_confirmed() {
                    // Peer's FIN came earlier, in CLOSE_WAIT; ours is now acked.
                    r.timer = TimerAction::Stop;
                    self.enter(ConnectionState::Closed);
                    r.wake_all();
                }
            }

            ConnectionState::CloseWait => {
                self.process_ack(&seg, &mut r);
                r.outbound.push(self.ack_segment());
            }
        }
        r
    }

    // -----------------------------------------------------------------------
    // Shared helpers (ESTABLISHED, FIN_WAIT, CLOSE_WAIT)
    // -----------------------------------------------------------------------

    /// Cumulative-ACK processing.
    fn process_ack(&mut self, seg: &Segment, r: &mut Reaction) {
        if !seg.is_ack() {
            return;
        }
        let previous_wnd = self.send.snd_wnd;
        if self.send.on_ack(seg.ack, seg.wnd) {
            self.retries = 0;
            r.timer = if self.send.has_unacked() {
                TimerAction::Restart
            } else {
                TimerAction::Stop
            };
            r.wake_senders = true;
        } else if seg.wnd > previous_wnd {
            r.wake_senders = true;
        }
    }

    /// Data (or FIN) processing in ESTABLISHED.  Always answers with a
    /// cumulative ACK; a reordered arrival makes it a duplicate ACK.
    fn accept_data(&mut self, seg: Segment, r: &mut Reaction) {
        let seq = seg.seq;
        match self.recv.on_segment(seg) {
            Arrival::Delivered { fin } => {
                r.wake_readers = true;
                if fin {
                    self.peer_fin = true;
                    self.enter(ConnectionState::CloseWait);
                }
            }
            Arrival::Reordered => {
                self.stats.out_of_order += 1;
                log::debug!(
                    "[ep:{}] out of order: got seq={seq}, expected {}; buffered",
                    self.local_port,
                    self.recv.rcv_next
                );
            }
            Arrival::QueueFull => {
                log::debug!("[ep:{}] receive queue full; dropped seq={seq}", self.local_port);
            }
            Arrival::OutOfRange => {
                log::warn!(
                    "[ep:{}] seq={seq} runs past the end of the sequence space; dropped",
                    self.local_port
                );
            }
            Arrival::Duplicate => {}
        }
        r.outbound.push(self.ack_segment());
    }

    /// Store `seg` for retransmission and queue it for sending.  Returns
    /// `true` if it is the only segment in flight; the retry counter starts
    /// over for it.
    fn transmit_new(&mut self, seg: Segment, r: &mut Reaction) -> bool {
        r.outbound.push(seg.clone());
        let first = self.send.record(seg);
        if first {
            self.retries = 0;
        }
        first
    }

    /// Segment from this endpoint to the bound peer, stamped with the current
    /// sequence state and receive window.
    fn segment(&self, flags: u8) -> Segment {
        Segment::new(self.local_port, self.remote_port)
            .with_flags(flags)
            .with_seq(self.send.snd_next)
            .with_ack(self.recv.rcv_next)
            .with_wnd(self.recv.advertised_window())
    }

    pub fn ack_segment(&self) -> Segment {
        self.segment(flags::ACK)
    }

    fn enter(&mut self, next: ConnectionState) {
        if self.state != next {
            log::debug!("[ep:{}] {} → {}", self.local_port, self.state, next);
            self.state = next;
        }
    }
}
