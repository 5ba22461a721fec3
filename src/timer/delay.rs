use crate::handler::{BusHandler, BusIo};
use embedded_hal::delay::DelayNs;

/// Runs one iteration of a blocking, interrupt-free bus loop.
///
/// For bring-up on targets without pin-change interrupts: the caller loops
/// over this function at a step well below the settle time, tracking the
/// previously seen wire state in `last_wires` and deciding `timer_due`
/// from the timeout its [`BusIo::set_timeout`] implementation recorded.
///
/// # Arguments
/// - `handler`: the bus handler to drive.
/// - `delay`: a delay provider, typically from the HAL.
/// - `step_us`: the loop step in microseconds; keep it at or below a fifth
///   of the settle time so edges are not missed.
/// - `last_wires`: the wire state seen by the previous iteration.
/// - `timer_due`: whether the armed timeout has expired since the previous
///   iteration.
///
/// # Example
/// ```rust,ignore
/// let mut seen = 0;
/// loop {
///     let due = timebase.consume_deadline();
///     poll_bus_once(&mut handler, &mut delay, 200, &mut seen, due);
/// }
/// ```
///
/// # Notes
/// - Polling trades timing margin for simplicity; prefer the `timer-isr`
///   integration for anything beyond bench tests.
/// - `delay.delay_us()` precision directly bounds the usable slot time.
pub fn poll_bus_once<IO, D>(
    handler: &mut BusHandler<IO>,
    delay: &mut D,
    step_us: u32,
    last_wires: &mut u8,
    timer_due: bool,
) where
    IO: BusIo,
    D: DelayNs,
{
    let now = handler.io.get_wire();
    if now != *last_wires {
        *last_wires = now;
        handler.wire(now);
    }
    if timer_due {
        handler.timer();
    }
    handler.poll();
    delay.delay_us(step_us);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{BusError, BusState, SendResult, Timeout};
    use crate::message::Message;
    use embedded_hal_mock::eh1::delay::NoopDelay;

    #[derive(Debug, Default)]
    struct LoopIo {
        wire: u8,
    }

    impl BusIo for LoopIo {
        fn set_wire(&mut self, bits: u8) {
            self.wire = bits;
        }
        fn get_wire(&mut self) -> u8 {
            self.wire
        }
        fn set_timeout(&mut self, _timeout: Timeout) {}
        fn process(&mut self, _msg: Message) -> bool {
            true
        }
        fn transmitted(&mut self, _msg: Message, _result: SendResult) {}
        fn report_error(&mut self, _err: BusError) {}
    }

    #[test]
    fn test_poll_feeds_wire_changes_and_timer() {
        let mut handler = BusHandler::new(LoopIo::default(), 2, 1).unwrap();
        let mut delay = NoopDelay::new();
        let mut seen = 0;

        // Timer due: the handler settles out of WaitIdle.
        poll_bus_once(&mut handler, &mut delay, 200, &mut seen, true);
        assert_eq!(handler.state(), BusState::Idle);

        // A foreign edge shows up in the sampled state.
        handler.io.wire = 0b10;
        poll_bus_once(&mut handler, &mut delay, 200, &mut seen, false);
        assert_eq!(seen, 0b10);
        assert_eq!(handler.state(), BusState::ReadAcquire);
    }
}
