//! Crate-wide error types.
//!
//! Protocol operations on a [`crate::endpoint::ConnectionEndpoint`] never
//! fail: loss, reordering and retry exhaustion surface as state transitions.
//! The errors here cover the edges of the system instead: rejected
//! configuration, undecodable wire bytes, and segments handed to the wrong
//! endpoint.

use thiserror::Error;

/// Reasons a byte buffer could not be parsed into a [`crate::segment::Segment`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer of {len} bytes is too short to contain a header")]
    BufferTooShort { len: usize },
    #[error("payload length field says {declared} bytes but {actual} follow the header")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum verification failed")]
    ChecksumFailed,
    #[error("unknown flag bits {0:#04x}")]
    UnknownFlags(u8),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed segment: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid configuration for '{field}': {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("segment for port {actual} handed to endpoint on port {expected}")]
    Misrouted { expected: u16, actual: u16 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}
