//! Owned bus messages presented as an appendable/extractable bit queue.
//!
//! A message is a bounded byte buffer addressed at bit granularity, because
//! the wire codec moves data in 11- or 14-bit chunks rather than bytes. The
//! first three bytes are the header (destination, source, command code),
//! rendered once at construction; the payload follows as arbitrary bits.
//!
//! Ownership follows the handler contract: `send` moves a message into the
//! handler, `transmitted` moves it back out; inbound messages are allocated
//! by the handler and handed over through `process`.

use crate::consts::{BROADCAST_ADDRESS, HEADER_LEN, MAX_MESSAGE_BYTES};

#[cfg(not(feature = "std"))]
use heapless::Vec;
#[cfg(feature = "std")]
use std::vec::Vec;

/// Error raised when a message operation exceeds its buffer or argument
/// bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The message buffer is full.
    #[error("message buffer full")]
    Overflow,
    /// More bits were requested than one call can carry.
    #[error("bit count out of range")]
    BadWidth,
}

/// A bus message: 3-byte header, bit-granular payload, transmit priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    #[cfg(feature = "std")]
    data: Vec<u8>,
    #[cfg(not(feature = "std"))]
    data: Vec<u8, MAX_MESSAGE_BYTES>,
    /// Total number of valid bits in `data`.
    len_bits: u16,
    /// Read cursor for [`Message::take_bits`].
    pos_bits: u16,
    /// Transmit priority, 1 (highest) to the bus wire count.
    pub prio: u8,
}

impl Message {
    /// Creates an empty message with no header, priority 1.
    ///
    /// Used by the handler for inbound frames whose header arrives as
    /// ordinary payload bits.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            len_bits: 0,
            pos_bits: 0,
            prio: 1,
        }
    }

    /// Creates an outbound message and renders its header.
    pub fn with_header(dst: u8, src: u8, code: u8, prio: u8) -> Self {
        let mut msg = Self::new();
        msg.prio = prio;
        // Header fits the fresh buffer; the pushes cannot fail.
        let _ = msg.push_byte(dst);
        let _ = msg.push_byte(src);
        let _ = msg.push_byte(code);
        msg
    }

    #[cfg(feature = "std")]
    fn grow(&mut self) -> Result<(), MessageError> {
        if self.data.len() >= MAX_MESSAGE_BYTES {
            return Err(MessageError::Overflow);
        }
        self.data.push(0);
        Ok(())
    }

    #[cfg(not(feature = "std"))]
    fn grow(&mut self) -> Result<(), MessageError> {
        self.data.push(0).map_err(|_| MessageError::Overflow)
    }

    /// Appends the low `width` bits of `value`, most significant bit first.
    ///
    /// `width` may be 0 (a no-op) up to 16 bits, which covers the widest
    /// chunk the codec produces.
    pub fn push_bits(&mut self, value: u16, width: u8) -> Result<(), MessageError> {
        if width > 16 {
            return Err(MessageError::BadWidth);
        }
        for i in (0..width).rev() {
            let bit = (value >> i) & 1;
            let byte = (self.len_bits / 8) as usize;
            if byte == self.data.len() {
                self.grow()?;
            }
            if bit != 0 {
                self.data[byte] |= 0x80 >> (self.len_bits % 8);
            }
            self.len_bits += 1;
        }
        Ok(())
    }

    /// Appends one byte.
    pub fn push_byte(&mut self, byte: u8) -> Result<(), MessageError> {
        self.push_bits(byte as u16, 8)
    }

    /// Appends a byte slice.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), MessageError> {
        for &b in bytes {
            self.push_byte(b)?;
        }
        Ok(())
    }

    /// Reads the next `width` bits at the cursor, MSB first.
    ///
    /// Returns `None` when fewer than `width` bits remain.
    pub fn take_bits(&mut self, width: u8) -> Option<u16> {
        if width > 16 || self.remaining_bits() < width as u16 {
            return None;
        }
        let mut out: u16 = 0;
        for _ in 0..width {
            let byte = (self.pos_bits / 8) as usize;
            let bit = (self.data[byte] >> (7 - self.pos_bits % 8)) & 1;
            out = (out << 1) | bit as u16;
            self.pos_bits += 1;
        }
        Some(out)
    }

    /// Reads `width` bits at an absolute bit offset without moving the
    /// cursor.
    pub fn peek_bits(&self, offset: u16, width: u8) -> Option<u16> {
        if width > 16 || offset + width as u16 > self.len_bits {
            return None;
        }
        let mut out: u16 = 0;
        for i in 0..width as u16 {
            let pos = offset + i;
            let bit = (self.data[(pos / 8) as usize] >> (7 - pos % 8)) & 1;
            out = (out << 1) | bit as u16;
        }
        Some(out)
    }

    /// Resets the read cursor to the start of the message.
    pub fn rewind(&mut self) {
        self.pos_bits = 0;
    }

    /// Drops bits off the end of the message.
    ///
    /// Used by the receiver to strip the zero padding of a partial final
    /// chunk once the residue marker has named its valid bit count.
    pub fn truncate_bits(&mut self, drop: u16) {
        self.len_bits = self.len_bits.saturating_sub(drop);
        if self.pos_bits > self.len_bits {
            self.pos_bits = self.len_bits;
        }
    }

    /// Total number of bits in the message.
    pub fn bits(&self) -> u16 {
        self.len_bits
    }

    /// Bits left between the cursor and the end of the message.
    pub fn remaining_bits(&self) -> u16 {
        self.len_bits - self.pos_bits
    }

    /// True when the message holds a complete header.
    pub fn has_header(&self) -> bool {
        self.len_bits >= HEADER_LEN as u16 * 8
    }

    /// Destination address from the header.
    pub fn dst(&self) -> Option<u8> {
        self.peek_bits(0, 8).map(|v| v as u8)
    }

    /// Source address from the header.
    pub fn src(&self) -> Option<u8> {
        self.peek_bits(8, 8).map(|v| v as u8)
    }

    /// Command code from the header.
    pub fn code(&self) -> Option<u8> {
        self.peek_bits(16, 8).map(|v| v as u8)
    }

    /// True when the header addresses `address` or the broadcast address.
    pub fn addressed_to(&self, address: u8) -> bool {
        match self.dst() {
            Some(dst) => dst == address || dst == BROADCAST_ADDRESS,
            None => false,
        }
    }

    /// The payload bytes following the header.
    ///
    /// Trailing bits that do not fill a byte are not included.
    pub fn payload(&self) -> &[u8] {
        let start = HEADER_LEN as usize;
        let end = (self.len_bits / 8) as usize;
        if end <= start {
            return &[];
        }
        &self.data[start..end]
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_rendering() {
        let msg = Message::with_header(2, 1, 3, 1);
        assert_eq!(msg.bits(), 24);
        assert_eq!(msg.dst(), Some(2));
        assert_eq!(msg.src(), Some(1));
        assert_eq!(msg.code(), Some(3));
        assert!(msg.has_header());
    }

    #[test]
    fn test_bit_round_trip_msb_first() {
        let mut msg = Message::new();
        msg.push_bits(0b101, 3).unwrap();
        msg.push_bits(0x2ce, 11).unwrap();
        msg.push_bits(0, 0).unwrap();
        msg.push_bits(1, 1).unwrap();
        assert_eq!(msg.bits(), 15);
        assert_eq!(msg.take_bits(3), Some(0b101));
        assert_eq!(msg.take_bits(11), Some(0x2ce));
        assert_eq!(msg.take_bits(1), Some(1));
        assert_eq!(msg.take_bits(1), None);
    }

    #[test]
    fn test_take_bits_refuses_short_reads() {
        let mut msg = Message::new();
        msg.push_bits(0xab, 8).unwrap();
        assert_eq!(msg.take_bits(9), None);
        assert_eq!(msg.take_bits(8), Some(0xab));
    }

    #[test]
    fn test_rewind_allows_retransmission() {
        let mut msg = Message::with_header(9, 8, 7, 1);
        msg.push_byte(0x55).unwrap();
        let first: Vec<u16> = (0..2).map(|_| msg.take_bits(11).unwrap()).collect();
        msg.rewind();
        let second: Vec<u16> = (0..2).map(|_| msg.take_bits(11).unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_truncate_drops_padding() {
        let mut msg = Message::new();
        msg.push_bits(0b1101_0000_000, 11).unwrap();
        msg.truncate_bits(7);
        assert_eq!(msg.bits(), 4);
        assert_eq!(msg.peek_bits(0, 4), Some(0b1101));
    }

    #[test]
    fn test_payload_excludes_header() {
        let mut msg = Message::with_header(1, 2, 3, 1);
        msg.push_bytes(&[0xa5, 0x5a]).unwrap();
        assert_eq!(msg.payload(), &[0xa5, 0x5a]);
    }

    #[test]
    fn test_addressing() {
        let msg = Message::with_header(7, 1, 0, 1);
        assert!(msg.addressed_to(7));
        assert!(!msg.addressed_to(8));
        let bcast = Message::with_header(BROADCAST_ADDRESS, 1, 0, 1);
        assert!(bcast.addressed_to(42));
        assert!(!Message::new().addressed_to(7));
    }

    #[test]
    fn test_overflow_reported() {
        let mut msg = Message::new();
        for _ in 0..MAX_MESSAGE_BYTES {
            msg.push_byte(0xff).unwrap();
        }
        assert_eq!(msg.push_byte(0), Err(MessageError::Overflow));
    }
}
