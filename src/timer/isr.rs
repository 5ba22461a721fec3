use crate::handler::{BusHandler, BusIo, SendError};
use crate::message::Message;
use core::cell::RefCell;
use critical_section::Mutex;

/// Creates the global static `BusHandler` storage for interrupt use.
///
/// Both the main loop and the pin-change/timer ISRs need the handler, so
/// it lives in a `critical_section` mutex. The cell starts empty; fill it
/// with [`global_bus_setup`].
///
/// # Example
/// ```rust
/// use core::cell::RefCell;
/// use critical_section::Mutex;
/// use moatbus::handler::BusHandler;
/// use moatbus::timer::global_bus_init;
/// # use moatbus::handler::{BusIo, Timeout, SendResult, BusError};
/// # use moatbus::message::Message;
/// # #[derive(Debug)] struct MyIo;
/// # impl BusIo for MyIo {
/// #     fn set_wire(&mut self, _: u8) {}
/// #     fn get_wire(&mut self) -> u8 { 0 }
/// #     fn set_timeout(&mut self, _: Timeout) {}
/// #     fn process(&mut self, _: Message) -> bool { true }
/// #     fn transmitted(&mut self, _: Message, _: SendResult) {}
/// #     fn report_error(&mut self, _: BusError) {}
/// # }
///
/// static BUS: Mutex<RefCell<Option<BusHandler<MyIo>>>> = global_bus_init::<MyIo>();
/// ```
pub const fn global_bus_init<IO: BusIo>() -> Mutex<RefCell<Option<BusHandler<IO>>>> {
    Mutex::new(RefCell::new(None))
}

/// Stores a handler in the global cell created by [`global_bus_init`].
pub fn global_bus_setup<IO: BusIo>(
    global: &'static Mutex<RefCell<Option<BusHandler<IO>>>>,
    handler: BusHandler<IO>,
) {
    critical_section::with(|cs| {
        let _ = global.borrow(cs).replace(Some(handler));
    });
}

/// Forwards a wire change to the global handler.
///
/// Call from the pin-change ISR with the freshly sampled wire state.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn EXTI0() {
///     let bits = sample_bus_pins();
///     global_bus_wire(&BUS, bits);
/// }
/// ```
pub fn global_bus_wire<IO: BusIo>(
    global: &'static Mutex<RefCell<Option<BusHandler<IO>>>>,
    bits: u8,
) {
    critical_section::with(|cs| {
        if let Some(handler) = global.borrow(cs).borrow_mut().as_mut() {
            handler.wire(bits);
        }
    });
}

/// Forwards a timeout expiry to the global handler.
///
/// Call from the timer ISR armed through the handler's `set_timeout`
/// callback.
pub fn global_bus_timer<IO: BusIo>(global: &'static Mutex<RefCell<Option<BusHandler<IO>>>>) {
    critical_section::with(|cs| {
        if let Some(handler) = global.borrow(cs).borrow_mut().as_mut() {
            handler.timer();
        }
    });
}

/// Runs the global handler's deferred work from the main loop.
///
/// Message delivery and completion callbacks execute inside the critical
/// section; keep `process`/`transmitted` implementations short.
pub fn global_bus_poll<IO: BusIo>(global: &'static Mutex<RefCell<Option<BusHandler<IO>>>>) {
    critical_section::with(|cs| {
        if let Some(handler) = global.borrow(cs).borrow_mut().as_mut() {
            handler.poll();
        }
    });
}

/// Enqueues a message on the global handler.
///
/// Returns the message wrapped in [`SendError`] if the handler is missing
/// or its queue is full.
pub fn send_to_global_bus<IO: BusIo>(
    global: &'static Mutex<RefCell<Option<BusHandler<IO>>>>,
    msg: Message,
) -> Result<(), SendError> {
    critical_section::with(|cs| {
        if let Some(handler) = global.borrow(cs).borrow_mut().as_mut() {
            handler.send(msg)
        } else {
            Err(SendError::QueueFull(msg))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{BusError, SendResult, Timeout};

    #[derive(Debug, Default)]
    struct NullIo {
        wire: u8,
    }

    impl BusIo for NullIo {
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
    fn test_global_setup_and_events() {
        static BUS: Mutex<RefCell<Option<BusHandler<NullIo>>>> = global_bus_init::<NullIo>();

        let handler = BusHandler::new(NullIo::default(), 2, 7).unwrap();
        global_bus_setup(&BUS, handler);

        critical_section::with(|cs| {
            assert!(BUS.borrow(cs).borrow().is_some());
        });

        // Drive the empty bus to idle and queue a message.
        global_bus_timer(&BUS);
        let msg = Message::with_header(2, 7, 0, 1);
        assert!(send_to_global_bus(&BUS, msg).is_ok());
        global_bus_wire(&BUS, 0b01);
        global_bus_poll(&BUS);
    }

    #[test]
    fn test_send_without_handler_returns_message() {
        static EMPTY: Mutex<RefCell<Option<BusHandler<NullIo>>>> = global_bus_init::<NullIo>();
        let msg = Message::with_header(1, 2, 3, 1);
        match send_to_global_bus(&EMPTY, msg) {
            Err(SendError::QueueFull(m)) => assert_eq!(m.dst(), Some(1)),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
