//! # moatbus
//!
//! A portable, no_std handler for a multi-master wired bus on 2 to 4
//! open-drain data wires, aimed at low-cost microcontrollers on
//! short-to-medium cable runs.
//!
//! The bus is **self-timed**: every transition changes at least one wire,
//! so no UARTs, differential drivers, or CAN controllers are needed. The
//! only hardware prerequisites are pin-change interrupts, a microsecond
//! timebase, and a periodic main-loop call.
//!
//! ## Crate features
//! | Feature               | Description |
//! |-----------------------|-------------|
//! | `std`                 | Disables `#![no_std]` support and replaces `heapless::Vec`s with
//! `std::vec::Vec`s |
//! | `delay-loop`          | Blocking poll-loop integration over `embedded_hal::delay::DelayNs` |
//! | `timer-isr` (default) | `critical_section`-guarded global handler for ISR integration |
//! | `defmt`               | Forwards `defmt` support to the dependency stack |
//! | `log`                 | Emits `log` tracing from the handler |
//!
//! ## Software features
//!
//! - **Multi-master** operation with priority arbitration on a dedicated
//!   acquisition slot and natural tie-breaking through collision detection
//! - **Self-timed multi-level signalling**: each transition carries
//!   log2(2^N - 1) bits on an N-wire bus
//! - **Per-symbol 11-bit CRC** (polynomial 0x583) matched to the
//!   wire-level error model
//! - **Ack/nack half-cycle** per frame with bounded internal retries and
//!   geometric backoff
//! - Fully portable: all hardware access goes through the
//!   [`BusIo`](handler::BusIo) capability record
//!
//! ## Usage
//!
//! ```rust
//! use moatbus::handler::{BusError, BusHandler, BusIo, SendResult, Timeout};
//! use moatbus::message::Message;
//!
//! #[derive(Debug, Default)]
//! struct MyIo {
//!     wires: u8,
//! }
//!
//! impl BusIo for MyIo {
//!     fn set_wire(&mut self, bits: u8) {
//!         // drive the open-drain outputs
//!         self.wires = bits;
//!     }
//!     fn get_wire(&mut self) -> u8 {
//!         self.wires
//!     }
//!     fn set_timeout(&mut self, _timeout: Timeout) {
//!         // arm the hardware timer; it later calls handler.timer()
//!     }
//!     fn process(&mut self, msg: Message) -> bool {
//!         msg.code() == Some(4)
//!     }
//!     fn transmitted(&mut self, _msg: Message, _result: SendResult) {}
//!     fn report_error(&mut self, _err: BusError) {}
//! }
//!
//! let mut bus = BusHandler::new(MyIo::default(), 3, 12).expect("supported wire count");
//! bus.timer(); // the quiet bus settles from WaitIdle to Idle
//!
//! let mut msg = Message::with_header(7, 12, 4, 1);
//! msg.push_bytes(&[0xa5, 0x5a]).unwrap();
//! bus.send(msg).unwrap();
//! // ...pin-change ISR calls bus.wire(), timer ISR calls bus.timer(),
//! // the main loop calls bus.poll().
//! ```
//!
//! ## Integration notes
//!
//! - The default signal slot is 5 ms; pick a slot of at least four times
//!   the worst-case wire-to-wire skew plus propagation delay.
//! - Every observed wire change must reach
//!   [`wire()`](handler::BusHandler::wire); debouncing happens inside the
//!   handler.
//! - Only one timeout is armed at a time; arming a new one cancels the
//!   previous.
//!
//! --
//! Designed for `#![no_std]` use in resource-constrained embedded
//! environments.

#![deny(
    bad_style,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    while_true,
    missing_debug_implementations,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "timer-isr")]
pub use critical_section;

#[cfg(all(feature = "timer-isr", not(feature = "std")))]
pub use heapless;

pub mod consts;
pub mod crc;
pub mod encoding;
pub mod handler;
pub mod message;
pub mod minifloat;
pub mod timer;
pub mod wires;
