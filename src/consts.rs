//! Constants used across the bus protocol implementation.
//!
//! This module defines the per-wire-count codec table together with the
//! timing, sizing, and retry bounds shared by the handler and its
//! integrators.
//!
//! ## Key Concepts
//!
//! - **Codec table**: for N data wires, one bus transition carries one of
//!   `2^N - 1` symbol values; B-bit chunks span X transitions, with R
//!   symbols' worth of headroom reserved for the trailing-residue marker.
//! - **Slot timing**: one signal slot (`TIMER_A`) paces the transmitter;
//!   the settle time (`TIMER_B`) bounds skew and propagation after an edge.
//! - **Bounds**: queue depth, retry count, and message size are fixed so
//!   that the handler never allocates past its heapless buffers.
//!
//! These values should be used wherever framing or timing logic is
//! implemented so that all nodes on one bus agree on slot boundaries.

/// Smallest supported number of data wires.
pub const MIN_WIRES: u8 = 2;

/// Largest supported number of data wires.
pub const MAX_WIRES: u8 = 4;

/// Per-wire-count codec parameters.
///
/// One instance describes how chunks map onto wire transitions for a bus
/// with `wires` data wires. See [`WireConfig::for_wires`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireConfig {
    /// Number of data wires on the bus (2 to 4).
    pub wires: u8,
    /// Largest symbol value, `2^wires - 1`.
    pub max_symbol: u8,
    /// Data bits carried by one complete chunk.
    pub chunk_bits: u8,
    /// Wire transitions spanned by one chunk.
    pub chunk_symbols: u8,
    /// Symbols of value headroom reserved for the trailing residue marker.
    pub residue_symbols: u8,
}

/// The codec table: (wires, max symbol, chunk bits, symbols, residue).
pub const WIRE_CONFIGS: [WireConfig; 3] = [
    WireConfig {
        wires: 2,
        max_symbol: 3,
        chunk_bits: 11,
        chunk_symbols: 7,
        residue_symbols: 3,
    },
    WireConfig {
        wires: 3,
        max_symbol: 7,
        chunk_bits: 14,
        chunk_symbols: 5,
        residue_symbols: 2,
    },
    WireConfig {
        wires: 4,
        max_symbol: 15,
        chunk_bits: 11,
        chunk_symbols: 3,
        residue_symbols: 1,
    },
];

impl WireConfig {
    /// Looks up the codec parameters for a bus with `wires` data wires.
    ///
    /// Returns `None` outside the supported 2..=4 range.
    pub const fn for_wires(wires: u8) -> Option<Self> {
        if wires < MIN_WIRES || wires > MAX_WIRES {
            return None;
        }
        Some(WIRE_CONFIGS[(wires - MIN_WIRES) as usize])
    }

    /// Bitmask covering all data wires.
    pub const fn wire_mask(&self) -> u8 {
        self.max_symbol
    }

    /// First chunk value that is not plain data: `2^chunk_bits`.
    pub const fn chunk_limit(&self) -> u16 {
        1 << self.chunk_bits
    }

    /// Number of distinct trailing-residue marker values, `max_symbol^residue_symbols`.
    pub const fn residue_span(&self) -> u16 {
        let mut span: u16 = 1;
        let mut i = 0;
        while i < self.residue_symbols {
            span *= self.max_symbol as u16;
            i += 1;
        }
        span
    }

    /// Largest value X symbols can carry, `max_symbol^chunk_symbols - 1`.
    pub const fn symbol_limit(&self) -> u16 {
        let mut limit: u32 = 1;
        let mut i = 0;
        while i < self.chunk_symbols {
            limit *= self.max_symbol as u32;
            i += 1;
        }
        (limit - 1) as u16
    }

    /// Wire changes tolerated within one slot before the line is declared
    /// unstable.
    pub const fn flap_limit(&self) -> u8 {
        2 * self.wires
    }

    /// Wire driven low by a receiver to acknowledge a frame.
    pub const fn ack_mask(&self) -> u8 {
        0b01
    }

    /// Wire pattern driven by a receiver to reject a frame. On a two-wire
    /// bus both wires are asserted; wider buses use wire 1.
    pub const fn nack_mask(&self) -> u8 {
        if self.wires == 2 { 0b11 } else { 0b10 }
    }
}

/// Upper bound of `chunk_symbols` over all configurations; sizes the
/// per-chunk symbol buffers.
pub const MAX_CHUNK_SYMBOLS: usize = 7;

/// Default duration of one signal slot in microseconds (`TIMER_A`).
///
/// Integrators must pick a slot at least four times the worst-case
/// wire-to-wire skew plus propagation delay.
pub const SLOT_US: u32 = 5_000;

/// Divider from slot time to settle time (`TIMER_B = TIMER_A / SETTLE_DIV`).
pub const SETTLE_DIV: u32 = 5;

/// Slots a receiver waits for the next edge before giving up on a frame.
pub const FRAME_TIMEOUT_SLOTS: u16 = 4;

/// Slots a sender waits for an acknowledgement after releasing the bus.
pub const ACK_WINDOW_SLOTS: u8 = 3;

/// Settle periods the bus may stay driven in `WaitIdle` before a hold-time
/// error is raised.
pub const HOLD_MAX: u8 = 4;

/// Default bound on internal retransmissions before a send is failed
/// upstream.
pub const MAX_RETRIES: u8 = 3;

/// Extra settle rounds tolerated while an acquisition resolves.
pub const ACQUIRE_TRIES: u8 = 2;

/// Raw minifloat encoding of the initial retry delay, in slots.
pub const BACKOFF_START: u8 = 2;

/// Raw minifloat increment applied per failure; sixteen steps double the
/// delay, so eight is a factor of roughly 1.4.
pub const BACKOFF_GROWTH: u8 = 8;

/// Upper bound on the retry delay, in slots.
pub const BACKOFF_CAP_SLOTS: u16 = 16;

/// Depth of the handler's message FIFOs.
pub const QUEUE_DEPTH: usize = 4;

/// Length (in bytes) of the fixed message header: destination, source,
/// command code.
pub const HEADER_LEN: u8 = 3;

/// Maximum number of payload data bits in one message.
pub const MAX_MESSAGE_BITS: u16 = 2048;

/// Buffer size backing one message: header plus a full payload.
pub const MAX_MESSAGE_BYTES: usize = HEADER_LEN as usize + (MAX_MESSAGE_BITS as usize + 7) / 8;

/// Destination address that every node accepts.
pub const BROADCAST_ADDRESS: u8 = u8::MAX;
