//! Simulated transmission medium shared by every endpoint.
//!
//! Real networks drop packets and have finite buffering.  The
//! [`SimulatedChannel`] models exactly those two faults:
//!
//! | Fault         | Behaviour                                               |
//! |---------------|---------------------------------------------------------|
//! | Packet loss   | `send` discards a segment with probability             |
//! |               | `drop_probability`, before it occupies any capacity.   |
//! | Bounded queue | `send` waits while `capacity` segments are in flight.  |
//!
//! The medium carries encoded datagrams, not segments: [`SimulatedChannel::send`]
//! encodes on the way in and the receiving side decodes, so a corrupt or
//! truncated datagram reaches the consumer as a [`DecodeError`].
//!
//! Delivery is FIFO for the channel as a whole; datagrams from different
//! connections interleave freely.  Sending cannot fail: it either drops or
//! eventually enqueues, and receiving waits until something arrives.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;

use crate::config::ChannelConfig;
use crate::error::{DecodeError, Result};
use crate::segment::Segment;

/// Cumulative counters since the channel was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Datagrams that entered the queue.
    pub enqueued: u64,
    /// Datagrams discarded by the loss model.
    pub dropped: u64,
}

struct Medium {
    queue: VecDeque<Vec<u8>>,
    rng: StdRng,
    stats: ChannelStats,
}

pub struct SimulatedChannel {
    capacity: usize,
    drop_probability: f64,
    medium: Mutex<Medium>,
    /// Signalled whenever a datagram is enqueued.
    not_empty: Notify,
    /// Signalled whenever a datagram is dequeued.
    not_full: Notify,
}

impl SimulatedChannel {
    pub fn new(config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            capacity: config.capacity,
            drop_probability: config.drop_probability,
            medium: Mutex::new(Medium {
                queue: VecDeque::with_capacity(config.capacity),
                rng,
                stats: ChannelStats::default(),
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        })
    }

    /// Encode a segment and hand it to the network.
    pub async fn send(&self, segment: Segment) {
        log::trace!("[chan] send {segment}");
        self.send_datagram(segment.encode()).await;
    }

    /// Hand raw bytes to the network.
    ///
    /// The loss decision is made first, so a dropped datagram never waits for
    /// capacity.  Otherwise waits while the channel is full, then enqueues
    /// and wakes any waiting receiver.
    pub async fn send_datagram(&self, datagram: Vec<u8>) {
        {
            let mut medium = self.medium();
            if self.drop_probability > 0.0 && medium.rng.random_bool(self.drop_probability) {
                medium.stats.dropped += 1;
                log::trace!("[chan] dropped {} bytes", datagram.len());
                return;
            }
        }

        loop {
            let space = self.not_full.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut medium = self.medium();
                if medium.queue.len() < self.capacity {
                    medium.queue.push_back(datagram);
                    medium.stats.enqueued += 1;
                    drop(medium);
                    self.not_empty.notify_waiters();
                    return;
                }
            }

            space.await;
        }
    }

    /// Take the oldest datagram, waiting while the channel is empty.
    pub async fn receive_datagram(&self) -> Vec<u8> {
        loop {
            let arrival = self.not_empty.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            if let Some(datagram) = self.try_receive_datagram() {
                return datagram;
            }

            arrival.await;
        }
    }

    /// Take the oldest datagram if one is queued.
    pub fn try_receive_datagram(&self) -> Option<Vec<u8>> {
        let datagram = self.medium().queue.pop_front()?;
        self.not_full.notify_waiters();
        Some(datagram)
    }

    /// Take and decode the oldest datagram, waiting while the channel is empty.
    pub async fn receive(&self) -> std::result::Result<Segment, DecodeError> {
        Segment::decode(&self.receive_datagram().await)
    }

    pub fn try_receive(&self) -> Option<std::result::Result<Segment, DecodeError>> {
        self.try_receive_datagram()
            .map(|datagram| Segment::decode(&datagram))
    }

    /// Datagrams currently in flight.
    pub fn len(&self) -> usize {
        self.medium().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        self.medium().stats
    }

    fn medium(&self) -> MutexGuard<'_, Medium> {
        self.medium.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SimulatedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedChannel")
            .field("capacity", &self.capacity)
            .field("drop_probability", &self.drop_probability)
            .field("len", &self.len())
            .finish()
    }
}
