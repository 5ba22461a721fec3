//! Timer plumbing for the bus handler.
//!
//! The handler asks for exactly one of three delays through
//! [`Timeout`](crate::handler::Timeout): a settle time (`TIMER_B`), a slot
//! multiple (`TIMER_A`), or cancellation. This module converts those
//! requests into microseconds and hardware-timer reload values, and hosts
//! the two integration styles:
//!
//! - `timer-isr` (default): a `critical_section`-guarded global handler
//!   driven from pin-change and timer interrupts, see [`isr`]
//! - `delay-loop`: a blocking poll loop for interrupt-free bring-up,
//!   see the `delay` submodule
//!
//! Common prescalers for a 16 MHz AVR-class part and the default 5 ms slot
//! (for use with [`compute_timer_reload`] and [`const_timer_reload`]):
//!
//! | PRESCALER | RELOAD | Interval |
//! |-----------|--------|----------|
//! |        64 |    250 |     1 ms |
//! |       256 |    312 |     5 ms |
//! |      1024 |     78 |     5 ms |

use libm::round;

use crate::consts::{SETTLE_DIV, SLOT_US};
use crate::handler::Timeout;

#[cfg(feature = "delay-loop")]
mod delay;
#[cfg_attr(feature = "delay-loop", allow(unused_imports))]
#[cfg(feature = "delay-loop")]
pub use delay::*;

#[cfg(feature = "timer-isr")]
mod isr;
#[cfg_attr(feature = "timer-isr", allow(unused_imports))]
#[cfg(feature = "timer-isr")]
pub use isr::*;

/// Settle time in microseconds for a given slot time.
pub const fn settle_us(slot_us: u32) -> u32 {
    slot_us / SETTLE_DIV
}

/// Converts a timeout request to microseconds.
///
/// Returns `None` for [`Timeout::Off`]. `slot_us` is the integrator's slot
/// time, typically [`SLOT_US`].
pub const fn timeout_us(timeout: Timeout, slot_us: u32) -> Option<u32> {
    match timeout {
        Timeout::Off => None,
        Timeout::Break => Some(settle_us(slot_us)),
        Timeout::Slots(n) => Some(slot_us * n as u32),
    }
}

/// Converts a timeout request to microseconds using the default slot time.
pub const fn default_timeout_us(timeout: Timeout) -> Option<u32> {
    timeout_us(timeout, SLOT_US)
}

/// Computes the reload value for a hardware timer running the settle clock.
///
/// # Arguments
/// - `f_cpu`: CPU frequency in Hz
/// - `prescaler`: timer prescaler (e.g., 8, 64, 256)
/// - `interval_us`: desired tick interval in microseconds
///
/// # Returns
/// The reload/compare value, rounded to the nearest integer.
pub fn compute_timer_reload(f_cpu: u32, prescaler: u32, interval_us: f32) -> u16 {
    let ticks_per_second = f_cpu as f64 / prescaler as f64;
    let ticks = ticks_per_second * (interval_us as f64 / 1_000_000.0);
    round(ticks) as u16
}

/// Compile-time reload value calculator.
///
/// Same contract as [`compute_timer_reload`], with truncating arithmetic
/// that keeps microsecond precision via picosecond scaling.
pub const fn const_timer_reload(f_cpu: u32, prescaler: u32, interval_us: u32) -> u16 {
    let interval_ps = interval_us as u64 * 1_000_000;
    let ticks = (f_cpu / prescaler) as u64 * interval_ps / 1_000_000_000_000;
    ticks as u16
}
