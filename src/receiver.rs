//! Inbound reassembly and receive-window management.
//!
//! [`ReceiveBuffer`] handles everything between a segment arriving at an
//! endpoint and the application reading contiguous bytes:
//! - in-order segments go to a bounded delivery queue;
//! - segments ahead of `rcv_next` wait in a reorder buffer until the gap
//!   closes, then drain in sequence order within the same step;
//! - duplicates are recognised and left alone;
//! - the advertised window reflects free space in the delivery queue.
//!
//! It does **not** send ACKs itself; it reports what happened and the
//! caller builds the acknowledgement.

use std::collections::{BTreeMap, VecDeque};

use crate::segment::Segment;

/// Outcome of offering a segment to the [`ReceiveBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// The segment (and possibly buffered successors) was accepted and
    /// `rcv_next` advanced.  `fin` reports that the peer's FIN was consumed.
    Delivered { fin: bool },
    /// In order, but the delivery queue is full; the peer must retransmit.
    QueueFull,
    /// Ahead of `rcv_next`; parked in the reorder buffer.
    Reordered,
    /// Entirely behind `rcv_next`.
    Duplicate,
    /// Runs past the end of the 32-bit sequence space; never accepted.
    OutOfRange,
}

#[derive(Debug)]
pub struct ReceiveBuffer {
    /// Next expected sequence number.  Never decreases.
    pub rcv_next: u32,
    /// Segments that arrived ahead of `rcv_next`, keyed by sequence number.
    reorder: BTreeMap<u32, Segment>,
    /// In-order data awaiting the application.  Only payload-bearing
    /// segments are queued.
    queue: VecDeque<Segment>,
    /// Bytes of the head segment the application has already consumed.
    head_offset: usize,
    capacity: usize,
    mss: usize,
}

impl ReceiveBuffer {
    pub fn new(capacity: usize, mss: usize) -> Self {
        Self {
            rcv_next: 0,
            reorder: BTreeMap::new(),
            queue: VecDeque::with_capacity(capacity),
            head_offset: 0,
            capacity,
            mss,
        }
    }

    /// Start expecting `rcv_next` (the peer's ISN + 1 after its SYN).
    pub fn synchronize(&mut self, rcv_next: u32) {
        self.rcv_next = self.rcv_next.max(rcv_next);
    }

    /// Move `rcv_next` past a FIN at `fin_end` without queueing anything.
    pub fn consume_fin(&mut self, fin_end: u32) {
        self.rcv_next = self.rcv_next.max(fin_end);
    }

    /// Offer an inbound segment that occupies sequence space.
    pub fn on_segment(&mut self, segment: Segment) -> Arrival {
        if !segment.fits_sequence_space() {
            return Arrival::OutOfRange;
        }
        if segment.seq > self.rcv_next {
            self.reorder.entry(segment.seq).or_insert(segment);
            return Arrival::Reordered;
        }
        if segment.seq < self.rcv_next {
            return Arrival::Duplicate;
        }

        let mut fin = match self.deliver(segment) {
            Ok(fin) => fin,
            Err(_) => return Arrival::QueueFull,
        };

        // Drain whatever is now contiguous.  Nothing follows a FIN.
        while !fin {
            let Some(next) = self.reorder.remove(&self.rcv_next) else {
                break;
            };
            match self.deliver(next) {
                Ok(f) => fin = f,
                Err(parked) => {
                    self.reorder.insert(parked.seq, parked);
                    break;
                }
            }
        }
        // Entries now behind rcv_next can never be delivered.
        self.reorder = self.reorder.split_off(&self.rcv_next);

        Arrival::Delivered { fin }
    }

    /// Accept an in-order segment, handing it back if the queue has no room.
    fn deliver(&mut self, segment: Segment) -> Result<bool, Segment> {
        if !segment.payload.is_empty() && self.is_full() {
            return Err(segment);
        }
        let fin = segment.is_fin();
        self.rcv_next = segment.seq_end();
        if !segment.payload.is_empty() {
            self.queue.push_back(segment);
        }
        Ok(fin)
    }

    /// Copy queued bytes into `buf`, returning how many were copied.  A
    /// partially read segment stays at the head of the queue.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(head) = self.queue.front() else {
                break;
            };
            let remaining = &head.payload[self.head_offset..];
            let n = remaining.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&remaining[..n]);
            copied += n;
            self.head_offset += n;
            if self.head_offset == head.payload.len() {
                self.queue.pop_front();
                self.head_offset = 0;
            }
        }
        copied
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// Segments waiting in the delivery queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Segments parked ahead of `rcv_next`.
    pub fn reordered(&self) -> usize {
        self.reorder.len()
    }

    /// Free delivery-queue slots scaled by the MSS.  A validated
    /// [`crate::config::EndpointConfig`] keeps the full window within
    /// `u16::MAX`; anything larger saturates.
    pub fn advertised_window(&self) -> u16 {
        let free = self.capacity.saturating_sub(self.queue.len());
        u16::try_from(free.saturating_mul(self.mss)).unwrap_or(u16::MAX)
    }
}
