//! Wire unit exchanged through the simulated channel.
//!
//! A [`Segment`] is pure data: control flags, sequence/acknowledgement
//! numbers, the advertised window, port addressing and a payload.  It is
//! built once by an endpoint and handed to the channel; nothing mutates it
//! afterwards.
//!
//! The channel carries segments as values, but the layout below is the
//! on-wire form used by [`Segment::encode`] / [`Segment::decode`].
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |        Destination Port       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |            Window             | Payload Len   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  (cont.)      |           Checksum            |  Payload ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 19 bytes.

use std::fmt;

use crate::error::DecodeError;

/// Bit-flag constants for [`Segment::flags`].
pub mod flags {
    /// Synchronise sequence numbers (handshake).
    pub const SYN: u8 = 0b0000_0001;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0000_0010;
    /// Sender has no more data to send.
    pub const FIN: u8 = 0b0000_0100;
    /// Segment carries application data.
    pub const PSH: u8 = 0b0000_1000;

    pub(crate) const ALL: u8 = SYN | ACK | FIN | PSH;
}

pub const HEADER_LEN: usize = 19;

const OFF_SRC: usize = 0;
const OFF_DST: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_WINDOW: usize = 13;
const OFF_PAYLOAD_LEN: usize = 15;
const OFF_CHECKSUM: usize = 17;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    pub source_port: u16,
    pub dest_port: u16,
    /// Sequence number of the first payload byte, or of the SYN/FIN flag
    /// itself for control segments.
    pub seq: u32,
    /// Next sequence number expected from the peer; meaningful only when
    /// [`flags::ACK`] is set.
    pub ack: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Free receive space advertised by the sender of this segment, in bytes.
    pub wnd: u16,
    pub payload: Vec<u8>,
}

impl Segment {
    /// An empty segment addressed from `source_port` to `dest_port`.
    pub fn new(source_port: u16, dest_port: u16) -> Self {
        Self {
            source_port,
            dest_port,
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    pub fn with_wnd(mut self, wnd: u16) -> Self {
        self.wnd = wnd;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    #[inline]
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    pub fn is_syn(&self) -> bool {
        self.has(flags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.has(flags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.has(flags::FIN)
    }

    pub fn is_psh(&self) -> bool {
        self.has(flags::PSH)
    }

    /// Sequence numbers this segment consumes: one per payload byte, plus one
    /// each for SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        let payload = u32::try_from(self.payload.len()).unwrap_or(u32::MAX);
        payload
            .saturating_add(u32::from(self.is_syn()))
            .saturating_add(u32::from(self.is_fin()))
    }

    /// First sequence number after this segment.  Wraps to `0` past
    /// `u32::MAX`.
    pub fn seq_end(&self) -> u32 {
        self.seq.wrapping_add(self.seq_len())
    }

    /// Whether the whole segment fits below the end of the sequence space.
    pub fn fits_sequence_space(&self) -> bool {
        self.seq.checked_add(self.seq_len()).is_some()
    }

    /// `false` for a pure acknowledgement.
    pub fn occupies_sequence_space(&self) -> bool {
        self.seq_len() > 0
    }

    /// Serialise into a newly allocated buffer, computing the payload length
    /// and checksum fields.
    ///
    /// Payloads longer than `u16::MAX` bytes cannot be represented; endpoints
    /// never build them because the MSS bounds every fragment.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = self.payload.len();
        debug_assert!(payload_len <= usize::from(u16::MAX));
        let mut buf = vec![0u8; HEADER_LEN + payload_len];

        buf[OFF_SRC..OFF_SRC + 2].copy_from_slice(&self.source_port.to_be_bytes());
        buf[OFF_DST..OFF_DST + 2].copy_from_slice(&self.dest_port.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        buf[OFF_FLAGS] = self.flags;
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&self.wnd.to_be_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&(payload_len as u16).to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        // Checksum field is still zero here.
        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        buf
    }

    /// Parse a segment produced by [`Segment::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::BufferTooShort { len: buf.len() });
        }

        let u16_at = |off: usize| u16::from_be_bytes([buf[off], buf[off + 1]]);
        let u32_at =
            |off: usize| u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);

        let declared = usize::from(u16_at(OFF_PAYLOAD_LEN));
        let actual = buf.len() - HEADER_LEN;
        if declared != actual {
            return Err(DecodeError::LengthMismatch { declared, actual });
        }

        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].fill(0);
        if internet_checksum(&scratch) != u16_at(OFF_CHECKSUM) {
            return Err(DecodeError::ChecksumFailed);
        }

        let flag_bits = buf[OFF_FLAGS];
        if flag_bits & !flags::ALL != 0 {
            return Err(DecodeError::UnknownFlags(flag_bits & !flags::ALL));
        }

        Ok(Segment {
            source_port: u16_at(OFF_SRC),
            dest_port: u16_at(OFF_DST),
            seq: u32_at(OFF_SEQ),
            ack: u32_at(OFF_ACK),
            flags: flag_bits,
            wnd: u16_at(OFF_WINDOW),
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (flags::SYN, "SYN"),
            (flags::FIN, "FIN"),
            (flags::PSH, "PSH"),
            (flags::ACK, "ACK"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.has(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(
            f,
            "[{} src={} dst={} seq={} ack={} wnd={} len={}]",
            set.join(" "),
            self.source_port,
            self.dest_port,
            self.seq,
            self.ack,
            self.wnd,
            self.payload.len()
        )
    }
}

/// Internet checksum (RFC 1071): one's-complement of the folded sum of
/// 16-bit big-endian words.  The checksum field must be zeroed first.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    // Odd trailing byte is padded with zero on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
