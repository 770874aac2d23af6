//! Send-side sequence space and retransmission store.
//!
//! [`SendWindow`] tracks what has been sent and what the peer has
//! acknowledged.  It does **not** touch the channel or the timer;
//! [`crate::connection::Tcb`] calls these methods and decides what to
//! transmit.
//!
//! # Sequence-number layout
//!
//! ```text
//!  snd_unack          snd_next
//!      │                  │
//!  ────┼──────────────────┼──────────────────▶ seq space
//!      │ <── in flight ──▶│ <── usable (snd_wnd - in flight) ──▶
//! ```
//!
//! Invariants: `snd_unack <= snd_next`, and every key of the unacked store
//! lies in `[snd_unack, snd_next)`.
//!
//! Sequence numbers do not wrap.  Data may use every number below
//! `u32::MAX - 1`; the last one before `u32::MAX` is kept for the FIN.  Once
//! data reaches that bound the connection can only be closed.

use std::collections::BTreeMap;

use crate::segment::Segment;

/// Peer window assumed before the peer advertises one.  Small but non-zero,
/// so the first fragment can always go out.
const INITIAL_SND_WND: u16 = 1;

/// First sequence number data may not occupy.
const DATA_SEQ_LIMIT: u32 = u32::MAX - 1;

#[derive(Debug)]
pub struct SendWindow {
    /// Next sequence number to assign.
    pub snd_next: u32,
    /// Oldest unacknowledged sequence number.
    pub snd_unack: u32,
    /// Last window advertised by the peer, in bytes.
    pub snd_wnd: u16,
    /// Exact copies of every segment still awaiting acknowledgement.
    unacked: BTreeMap<u32, Segment>,
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SendWindow {
    pub fn new() -> Self {
        Self {
            snd_next: 0,
            snd_unack: 0,
            snd_wnd: INITIAL_SND_WND,
            unacked: BTreeMap::new(),
        }
    }

    /// Sequence numbers sent but not yet acknowledged.
    pub fn in_flight(&self) -> u32 {
        self.snd_next - self.snd_unack
    }

    /// `true` when nothing is awaiting acknowledgement.
    pub fn all_confirmed(&self) -> bool {
        self.snd_unack == self.snd_next
    }

    pub fn has_unacked(&self) -> bool {
        !self.unacked.is_empty()
    }

    /// Sequence numbers still available for payload bytes.
    pub fn data_space(&self) -> u32 {
        DATA_SEQ_LIMIT.saturating_sub(self.snd_next)
    }

    pub fn sequence_space_exhausted(&self) -> bool {
        self.data_space() == 0
    }

    /// Largest fragment that may be sent right now, or `None` when the
    /// caller has to wait for an acknowledgement.
    ///
    /// A zero peer window lets exactly one 1-byte probe through while
    /// nothing else is in flight, so the peer has a reason to answer with a
    /// fresh window.  Never exceeds [`SendWindow::data_space`].
    pub fn sendable(&self, mss: usize) -> Option<usize> {
        let space = usize::try_from(self.data_space()).unwrap_or(usize::MAX);
        if space == 0 {
            return None;
        }
        if self.snd_wnd == 0 {
            return self.all_confirmed().then_some(1);
        }
        let usable = i64::from(self.snd_wnd) - i64::from(self.in_flight());
        (usable > 0).then(|| mss.min(usable as usize).min(space))
    }

    /// Store a just-built segment for retransmission and advance `snd_next`.
    ///
    /// Returns `true` when the segment is the only one in flight, i.e. the
    /// retransmission timer must be started for it.
    pub fn record(&mut self, segment: Segment) -> bool {
        debug_assert_eq!(segment.seq, self.snd_next);
        debug_assert!(segment.fits_sequence_space());
        let first_in_flight = self.all_confirmed();
        self.snd_next = self.snd_next.saturating_add(segment.seq_len());
        self.unacked.insert(segment.seq, segment);
        first_in_flight
    }

    /// Process a cumulative ACK carrying the peer's window.
    ///
    /// Returns `true` when `snd_unack` advanced.  Acks at or behind
    /// `snd_unack`, or beyond `snd_next`, only update the window.
    pub fn on_ack(&mut self, ack: u32, wnd: u16) -> bool {
        self.snd_wnd = wnd;
        if ack <= self.snd_unack || ack > self.snd_next {
            return false;
        }
        self.unacked = self.unacked.split_off(&ack);
        self.snd_unack = ack;
        true
    }

    /// Adopt the peer's acknowledgement of our SYN.  The handshake segment is
    /// no longer needed for retransmission.
    pub fn complete_handshake(&mut self, ack: u32, wnd: u16) {
        self.snd_unack = ack.clamp(self.snd_unack, self.snd_next);
        self.snd_wnd = wnd;
        self.unacked.clear();
    }

    /// The oldest stored segment, i.e. the one at `snd_unack`.
    pub fn oldest(&self) -> Option<&Segment> {
        self.unacked.first_key_value().map(|(_, seg)| seg)
    }

    pub fn unacked_seqs(&self) -> impl Iterator<Item = u32> + '_ {
        self.unacked.keys().copied()
    }
}
