//! GPIO adapter for the bus wires.
//!
//! The bus is wired-OR: a wire is either pulled low by at least one node or
//! floats high through the shared pull-up. [`GpioWires`] emulates an
//! open-drain driver with one push-pull output and one input per wire:
//! asserting a wire drives its output low, releasing lets the pull-up win.
//! On hardware with true open-drain pins, configure the output accordingly
//! and the adapter behaves identically.
//!
//! The adapter only covers the pin side of the integrator surface; timers
//! and message callbacks stay with the integrator's [`crate::handler::BusIo`]
//! implementation, which typically embeds a `GpioWires` and forwards
//! `set_wire`/`get_wire` to it.

use embedded_hal::digital::{InputPin, OutputPin};

/// Open-drain style driver/sampler for `N` bus wires.
///
/// Bit i of a wire-state byte corresponds to `outputs[i]`/`inputs[i]`;
/// a set bit means "pulled low".
#[derive(Debug)]
pub struct GpioWires<O, I, const N: usize>
where
    O: OutputPin,
    I: InputPin,
{
    /// Driver pins, one per wire.
    pub outputs: [O; N],
    /// Sense pins, one per wire.
    pub inputs: [I; N],
    driven: u8,
}

impl<O, I, const N: usize> GpioWires<O, I, N>
where
    O: OutputPin,
    I: InputPin,
{
    /// Wraps the pin arrays and releases every wire.
    pub fn new(outputs: [O; N], inputs: [I; N]) -> Self {
        let mut wires = Self {
            outputs,
            inputs,
            driven: 0,
        };
        wires.drive(0);
        wires
    }

    /// Drives the wires in `bits` low and releases the rest.
    ///
    /// Pin errors are absorbed; a failed driver surfaces as a collision or
    /// hold-time fault at the handler level.
    pub fn drive(&mut self, bits: u8) {
        for (i, pin) in self.outputs.iter_mut().enumerate() {
            if bits & (1 << i) != 0 {
                let _ = pin.set_low();
            } else {
                let _ = pin.set_high();
            }
        }
        self.driven = bits;
    }

    /// Samples all wires into one state byte (bit set = wire low).
    pub fn sample(&mut self) -> u8 {
        let mut bits = 0;
        for (i, pin) in self.inputs.iter_mut().enumerate() {
            if pin.is_low().unwrap_or(false) {
                bits |= 1 << i;
            }
        }
        bits
    }

    /// The wire pattern this node currently drives.
    pub fn driven(&self) -> u8 {
        self.driven
    }
}
