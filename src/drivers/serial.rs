//! Serial Packet Transport
//!
//! UART link to the radio coprocessor. The process lends one buffer for
//! incoming bytes and one per outgoing packet; a single subscribe slot
//! reports both directions, told apart by the first upcall argument.

use crate::dispatch::{Dispatcher, Lent, Upcall};
use crate::syscall::{DriverId, Kernel, KernelError, KernelResult};

/// Command opcode that starts sending the TX buffer.
const CMD_WRITE: u32 = 0;

/// Allow slots
pub mod allow {
    pub const RX: u32 = 0;
    pub const TX: u32 = 1;
}

/// Subscribe slot for transport events.
pub const EVENT_SLOT: u32 = 0;

/// A decoded transport upcall.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SerialEvent {
    /// The TX buffer has been sent and may be reclaimed.
    TxDone,
    /// Reception began; `len` bytes are expected.
    RxStarted { len: usize },
    /// `len` bytes landed in the RX buffer.
    RxDone { len: usize },
    /// An event kind this binding does not know.
    Other(Upcall),
}

impl From<Upcall> for SerialEvent {
    fn from(upcall: Upcall) -> Self {
        match upcall.arg0 {
            1 => Self::TxDone,
            2 => Self::RxStarted { len: upcall.arg1 },
            3 => Self::RxDone { len: upcall.arg1 },
            _ => Self::Other(upcall),
        }
    }
}

/// Serial transport (driver 5).
pub struct Serial<'d, 'a, K: Kernel> {
    dispatcher: &'d Dispatcher<'a, K>,
}

impl<'d, 'a, K: Kernel> Serial<'d, 'a, K> {
    pub fn new(dispatcher: &'d Dispatcher<'a, K>) -> Self {
        Self { dispatcher }
    }

    /// Install the handler for both TX and RX events.
    pub fn on_event<F>(&self, mut handler: F) -> KernelResult<()>
    where
        F: FnMut(SerialEvent) + 'a,
    {
        self.dispatcher
            .subscribe(DriverId::SERIAL, EVENT_SLOT, move |upcall| {
                handler(SerialEvent::from(upcall))
            })
    }

    /// Lend `rx` as the receive buffer.
    ///
    /// # Returns
    /// The previous receive buffer, if one was lent.
    pub fn setup_rx_buffer(&self, rx: &'a mut [u8]) -> KernelResult<Option<&'a mut [u8]>> {
        Ok(self
            .dispatcher
            .allow(DriverId::SERIAL, allow::RX, rx)?
            .and_then(Lent::into_mut))
    }

    /// Send `tx` as one packet.
    ///
    /// `tx` stays lent until [`take_tx_buffer`](Self::take_tx_buffer).
    ///
    /// # Errors
    /// `Busy` while the previous packet has not been reclaimed.
    pub fn write(&self, tx: &'a [u8]) -> KernelResult<()> {
        if self.dispatcher.is_lent(DriverId::SERIAL, allow::TX) {
            return Err(KernelError::Busy);
        }
        self.dispatcher.allow_readonly(DriverId::SERIAL, allow::TX, tx)?;
        self.dispatcher
            .command(DriverId::SERIAL, CMD_WRITE, 0)
            .map(|_| ())
    }

    /// Reclaim the receive buffer.
    pub fn take_rx_buffer(&self) -> KernelResult<Option<&'a mut [u8]>> {
        Ok(self
            .dispatcher
            .revoke(DriverId::SERIAL, allow::RX)?
            .and_then(Lent::into_mut))
    }

    /// Reclaim the last transmitted packet.
    pub fn take_tx_buffer(&self) -> KernelResult<Option<&'a [u8]>> {
        Ok(self
            .dispatcher
            .revoke(DriverId::SERIAL, allow::TX)?
            .map(Lent::into_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Effect, FakeKernel, Trigger};
    use alloc::vec::Vec;
    use core::cell::RefCell;

    #[test]
    fn test_event_decoding() {
        assert_eq!(SerialEvent::from(Upcall::new(1, 0, 0)), SerialEvent::TxDone);
        assert_eq!(
            SerialEvent::from(Upcall::new(2, 17, 0)),
            SerialEvent::RxStarted { len: 17 }
        );
        assert_eq!(
            SerialEvent::from(Upcall::new(3, 17, 0)),
            SerialEvent::RxDone { len: 17 }
        );
        let odd = Upcall::new(9, 1, 2);
        assert_eq!(SerialEvent::from(odd), SerialEvent::Other(odd));
    }

    #[test]
    fn test_packet_exchange() {
        let fake = FakeKernel::new();
        let write = Trigger::Command { driver: DriverId::SERIAL, opcode: CMD_WRITE };
        fake.on(write, Effect::Capture { slot: allow::TX });
        fake.on(write, Effect::Fire { slot: EVENT_SLOT, upcall: Upcall::new(1, 0, 0) });
        let events = RefCell::new(Vec::new());
        let mut rx = [0u8; 8];
        let dispatcher = Dispatcher::new(&fake);
        let serial = Serial::new(&dispatcher);

        serial.on_event(|event| events.borrow_mut().push(event)).unwrap();
        assert!(serial.setup_rx_buffer(&mut rx).unwrap().is_none());
        serial.write(b"\x01\x02").unwrap();
        dispatcher.yield_now();
        assert_eq!(fake.captured(), b"\x01\x02");

        fake.write_grant(DriverId::SERIAL, allow::RX, b"ok").unwrap();
        fake.fire(DriverId::SERIAL, EVENT_SLOT, Upcall::new(3, 2, 0));
        dispatcher.yield_now();

        assert_eq!(
            *events.borrow(),
            [SerialEvent::TxDone, SerialEvent::RxDone { len: 2 }]
        );
        let rx = serial.take_rx_buffer().unwrap().unwrap();
        assert_eq!(&rx[..2], b"ok");
        assert!(serial.take_tx_buffer().unwrap().is_some());
    }

    #[test]
    fn test_second_packet_waits_for_reclaim() {
        let fake = FakeKernel::new();
        let dispatcher = Dispatcher::new(&fake);
        let serial = Serial::new(&dispatcher);

        serial.write(b"one").unwrap();
        assert_eq!(serial.write(b"two"), Err(KernelError::Busy));
        assert_eq!(fake.grant(DriverId::SERIAL, allow::TX).as_deref(), Some(&b"one"[..]));

        assert_eq!(serial.take_tx_buffer().unwrap(), Some(&b"one"[..]));
        serial.write(b"two").unwrap();
        assert_eq!(fake.grant(DriverId::SERIAL, allow::TX).as_deref(), Some(&b"two"[..]));
    }
}
