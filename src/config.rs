//! Construction-time knobs for the channel and for connection endpoints.
//!
//! Every value is fixed once the owning object is built.  The defaults match
//! the reference exchange the demo binary runs: a 10-slot channel with no
//! loss, 30-byte segments, a 50-segment receive queue, a 500 ms
//! retransmission timeout and 5 retries.

use std::time::Duration;

use crate::error::{Error, Result};

/// Parameters of the shared [`crate::channel::SimulatedChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Maximum number of segments in flight inside the channel.
    pub capacity: usize,
    /// Probability in `[0.0, 1.0]` that a segment is silently discarded.
    pub drop_probability: f64,
    /// Seed for the loss RNG.  `None` seeds from the operating system, so
    /// loss patterns differ between runs.
    pub seed: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            drop_probability: 0.0,
            seed: None,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::config("capacity", "must hold at least one segment"));
        }
        if !(0.0..=1.0).contains(&self.drop_probability) {
            return Err(Error::config(
                "drop_probability",
                format!("{} is outside [0.0, 1.0]", self.drop_probability),
            ));
        }
        Ok(())
    }
}

/// Parameters of a [`crate::endpoint::ConnectionEndpoint`].
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Maximum payload bytes carried by one segment.  At most `u16::MAX`,
    /// the largest payload the length field can describe.
    pub mss: usize,
    /// Number of in-order segments the delivery queue holds before the
    /// advertised window reaches zero.  `recv_queue_capacity * mss` is the
    /// full receive window and must fit the 16-bit window field.
    pub recv_queue_capacity: usize,
    /// Fixed retransmission timeout.
    pub rto: Duration,
    /// Retransmissions of the oldest unacknowledged segment before the
    /// connection is forced closed.
    pub max_retries: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            mss: 30,
            recv_queue_capacity: 50,
            rto: Duration::from_millis(500),
            max_retries: 5,
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mss == 0 {
            return Err(Error::config("mss", "must be at least one byte"));
        }
        if self.recv_queue_capacity == 0 {
            return Err(Error::config(
                "recv_queue_capacity",
                "must hold at least one segment",
            ));
        }
        let max_window = usize::from(u16::MAX);
        if self.mss > max_window {
            return Err(Error::config(
                "mss",
                format!("{} exceeds the {max_window}-byte payload limit", self.mss),
            ));
        }
        let window = self.recv_queue_capacity.saturating_mul(self.mss);
        if window > max_window {
            return Err(Error::config(
                "recv_queue_capacity",
                format!(
                    "{} segments of {} bytes give a {window}-byte window; \
                     the header carries at most {max_window}",
                    self.recv_queue_capacity, self.mss
                ),
            ));
        }
        if self.rto.is_zero() {
            return Err(Error::config("rto", "must be non-zero"));
        }
        Ok(())
    }
}
