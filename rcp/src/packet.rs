//! Wire-format definitions for RCP packets.
//!
//! Every datagram exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Range-checking every numeric field at assignment time.
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a received buffer back into a [`Packet`], rejecting
//!   malformed or out-of-range input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! Both numeric fields are **big-endian**.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Sequence Number        |     Acknowledgment Number     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Reserved (zero)                      |A|S|F|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Payload (0..=1024 bytes)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The payload length is not carried in the header: it is whatever follows
//! the 8 header bytes in the datagram.

use thiserror::Error;

use crate::seq::MAX_SEQ_NUM;

/// Bit-flag constants for header byte 7.
pub mod flags {
    /// Sender has no more data to send.
    pub const FIN: u8 = 0b0000_0001;
    /// Synchronise sequence numbers (handshake).
    pub const SYN: u8 = 0b0000_0010;
    /// Acknowledgment field is valid.
    pub const ACK: u8 = 0b0000_0100;

    pub(crate) const MASK: u8 = FIN | SYN | ACK;
}

/// Byte length of the fixed-size header.
pub const HEADER_LEN: usize = 8;

/// Maximum number of payload bytes one packet may carry.
pub const MAX_PAYLOAD: usize = 1024;

/// Largest valid datagram: header plus a full payload.
pub const PACKET_SIZE: usize = HEADER_LEN + MAX_PAYLOAD;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 2;
const OFF_FLAGS: usize = 7;

/// Errors raised by packet setters and by decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    /// A setter received a value at or above its bound.
    #[error("{field} {value} is out of range")]
    OutOfRange { field: &'static str, value: usize },
    /// Fewer bytes than a header.
    #[error("datagram of {0} bytes is shorter than a header")]
    Truncated(usize),
    /// More bytes than the largest packet.
    #[error("datagram of {0} bytes exceeds the largest packet")]
    Oversized(usize),
    /// The caller claimed more valid bytes than the buffer holds.
    #[error("{valid} valid bytes claimed for a buffer of {capacity}")]
    Overrun { valid: usize, capacity: usize },
    /// A decoded sequence or acknowledgment number is not in the sequence space.
    #[error("decoded {field} {value} lies outside the sequence space")]
    OutsideSequenceSpace { field: &'static str, value: u16 },
}

impl PacketError {
    /// `true` for errors produced while parsing a received datagram.
    pub fn is_decode_error(&self) -> bool {
        !matches!(self, PacketError::OutOfRange { .. })
    }
}

/// A single RCP message: header fields plus an inline, fixed-capacity payload.
///
/// The payload lives inside the value (no separate heap allocation), so a
/// packet is at most [`PACKET_SIZE`] bytes of state and moving one is a plain
/// copy.
#[derive(Clone)]
pub struct Packet {
    seq: u16,
    ack: u16,
    flags: u8,
    len: u16,
    payload: [u8; MAX_PAYLOAD],
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

// Bytes past `len` are scratch space and take no part in equality.
impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
            && self.ack == other.ack
            && self.flags == other.flags
            && self.payload() == other.payload()
    }
}

impl Eq for Packet {}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("seq", &self.seq)
            .field("ack", &self.ack)
            .field("syn", &self.is_syn())
            .field("ack_flag", &self.is_ack())
            .field("fin", &self.is_fin())
            .field("len", &self.len)
            .finish()
    }
}

/// One-line summary for logs, e.g. `SYN+ACK seq=5000 ack=101 len=0`.
impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (self.is_syn(), "SYN"),
            (self.is_fin(), "FIN"),
            (self.is_ack(), "ACK"),
        ];
        let mut first = true;
        for (_, name) in names.iter().filter(|(set, _)| *set) {
            if !first {
                f.write_str("+")?;
            }
            f.write_str(name)?;
            first = false;
        }
        if first {
            f.write_str("-")?;
        }
        write!(f, " seq={} ack={} len={}", self.seq, self.ack, self.len)
    }
}

impl Packet {
    /// An empty packet: sequence and acknowledgment numbers 0, no flags,
    /// no payload.
    pub const fn new() -> Self {
        Self {
            seq: 0,
            ack: 0,
            flags: 0,
            len: 0,
            payload: [0; MAX_PAYLOAD],
        }
    }

    /// A packet with no payload, built from numbers the caller already keeps
    /// inside the sequence space.
    pub(crate) fn with_header(seq: u16, ack: u16, flag_bits: u8) -> Self {
        debug_assert!(seq < MAX_SEQ_NUM && ack < MAX_SEQ_NUM);
        let mut packet = Self::new();
        packet.seq = seq;
        packet.ack = ack;
        packet.flags = flag_bits & flags::MASK;
        packet
    }

    /// Copy as much of `data` as fits into the payload; returns the number
    /// of bytes taken.
    pub(crate) fn fill_payload(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(MAX_PAYLOAD);
        self.payload[..n].copy_from_slice(&data[..n]);
        self.len = n as u16;
        n
    }

    pub fn sequence_number(&self) -> u16 {
        self.seq
    }

    pub fn acknowledgment_number(&self) -> u16 {
        self.ack
    }

    pub fn length(&self) -> u16 {
        self.len
    }

    pub fn is_fin(&self) -> bool {
        self.flags & flags::FIN != 0
    }

    pub fn is_syn(&self) -> bool {
        self.flags & flags::SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }

    /// Raw flag bits; only the three [`flags`] bits are ever set.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Set the sequence number.
    ///
    /// Values at or above [`MAX_SEQ_NUM`] are rejected and the previous value
    /// is kept.
    pub fn set_sequence_number(&mut self, seq: u16) -> Result<(), PacketError> {
        check_seq("sequence number", seq)?;
        self.seq = seq;
        Ok(())
    }

    /// Set the acknowledgment number.  Same bound as the sequence number.
    pub fn set_acknowledgment_number(&mut self, ack: u16) -> Result<(), PacketError> {
        check_seq("acknowledgment number", ack)?;
        self.ack = ack;
        Ok(())
    }

    /// Set how many bytes of [`payload_mut`](Self::payload_mut) are part of
    /// the packet.  Call this after writing into the payload directly.
    pub fn set_length(&mut self, len: u16) -> Result<(), PacketError> {
        if len as usize > MAX_PAYLOAD {
            return Err(PacketError::OutOfRange {
                field: "payload length",
                value: len as usize,
            });
        }
        self.len = len;
        Ok(())
    }

    pub fn set_fin(&mut self) {
        self.flags |= flags::FIN;
    }

    pub fn set_syn(&mut self) {
        self.flags |= flags::SYN;
    }

    pub fn set_ack(&mut self) {
        self.flags |= flags::ACK;
    }

    pub fn clear_fin(&mut self) {
        self.flags &= !flags::FIN;
    }

    pub fn clear_syn(&mut self) {
        self.flags &= !flags::SYN;
    }

    pub fn clear_ack(&mut self) {
        self.flags &= !flags::ACK;
    }

    /// The valid payload bytes (`length()` of them).
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }

    /// The whole payload capacity, for writing in place.
    pub fn payload_mut(&mut self) -> &mut [u8; MAX_PAYLOAD] {
        &mut self.payload
    }

    /// Copy `data` into the payload and set the length to match.
    pub fn set_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        if data.len() > MAX_PAYLOAD {
            return Err(PacketError::OutOfRange {
                field: "payload length",
                value: data.len(),
            });
        }
        self.payload[..data.len()].copy_from_slice(data);
        self.len = data.len() as u16;
        Ok(())
    }

    /// Number of sequence numbers this packet consumes: its payload length,
    /// plus one each for SYN and FIN.
    pub fn segment_len(&self) -> u16 {
        self.len + u16::from(self.is_syn()) + u16::from(self.is_fin())
    }

    /// Reset to the freshly-constructed state.
    pub fn clear(&mut self) {
        self.seq = 0;
        self.ack = 0;
        self.flags = 0;
        self.len = 0;
    }

    /// Size of this packet on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.len as usize
    }

    /// Serialise into a newly allocated vector of exactly
    /// [`wire_len`](Self::wire_len) bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.wire_len()];
        self.write_into(&mut buf);
        buf
    }

    /// Serialise into the front of `buf`, returning the number of bytes
    /// written.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`wire_len`](Self::wire_len); a
    /// [`PACKET_SIZE`] buffer always fits.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        let n = self.wire_len();
        self.write_into(&mut buf[..n]);
        n
    }

    fn write_into(&self, buf: &mut [u8]) {
        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 2].copy_from_slice(&self.ack.to_be_bytes());
        buf[4..OFF_FLAGS].fill(0);
        buf[OFF_FLAGS] = self.flags & flags::MASK;
        buf[HEADER_LEN..].copy_from_slice(self.payload());
    }

    /// Parse the first `n` bytes of `buf` as a packet.
    ///
    /// Fails when `n` is outside `[HEADER_LEN, PACKET_SIZE]`, when `n`
    /// exceeds `buf.len()`, or when either number lies outside the sequence
    /// space.  Never reads past `buf[n - 1]`.
    pub fn decode(buf: &[u8], n: usize) -> Result<Self, PacketError> {
        let mut packet = Self::new();
        packet.decode_in_place(buf, n)?;
        Ok(packet)
    }

    /// Like [`decode`](Self::decode), but overwrites `self` so one packet
    /// can be reused across a receive loop.
    ///
    /// On failure `self` is left untouched.
    pub fn decode_in_place(&mut self, buf: &[u8], n: usize) -> Result<(), PacketError> {
        if n < HEADER_LEN {
            return Err(PacketError::Truncated(n));
        }
        if n > PACKET_SIZE {
            return Err(PacketError::Oversized(n));
        }
        if n > buf.len() {
            return Err(PacketError::Overrun {
                valid: n,
                capacity: buf.len(),
            });
        }

        let seq = u16::from_be_bytes([buf[OFF_SEQ], buf[OFF_SEQ + 1]]);
        let ack = u16::from_be_bytes([buf[OFF_ACK], buf[OFF_ACK + 1]]);
        if seq >= MAX_SEQ_NUM {
            return Err(PacketError::OutsideSequenceSpace {
                field: "sequence number",
                value: seq,
            });
        }
        if ack >= MAX_SEQ_NUM {
            return Err(PacketError::OutsideSequenceSpace {
                field: "acknowledgment number",
                value: ack,
            });
        }

        let len = n - HEADER_LEN;
        self.seq = seq;
        self.ack = ack;
        self.flags = buf[OFF_FLAGS] & flags::MASK;
        self.len = len as u16;
        self.payload[..len].copy_from_slice(&buf[HEADER_LEN..n]);
        Ok(())
    }
}

fn check_seq(field: &'static str, value: u16) -> Result<(), PacketError> {
    if value >= MAX_SEQ_NUM {
        return Err(PacketError::OutOfRange {
            field,
            value: value as usize,
        });
    }
    Ok(())
}
