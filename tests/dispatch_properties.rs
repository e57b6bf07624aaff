//! End-to-end behaviour of the dispatcher and bindings against the fake
//! kernel.

use std::cell::{Cell, RefCell};

use pantheros_user::drivers::gpio::INTERRUPT_SLOT;
use pantheros_user::drivers::spi::{self, COMPLETION_SLOT};
use pantheros_user::drivers::{Gpio, Spi};
use pantheros_user::testing::{FakeKernel, Syscall};
use pantheros_user::{Dispatcher, DriverId, KernelError, Upcall};

const SENSOR: DriverId = DriverId::new(12);

#[test]
fn read_only_command_is_repeatable() {
    let fake = FakeKernel::new();
    fake.set_command_result(SENSOR, 1, 37);
    let dispatcher = Dispatcher::new(&fake);

    let first = dispatcher.command(SENSOR, 1, 0);
    for _ in 0..5 {
        assert_eq!(dispatcher.command(SENSOR, 1, 0), first);
    }
    assert_eq!(first, Ok(37));
}

#[test]
fn revoke_always_succeeds() {
    let fake = FakeKernel::new();
    let mut buffer = [0u8; 4];
    let dispatcher = Dispatcher::new(&fake);

    // Never granted.
    assert!(dispatcher.revoke(SENSOR, 0).unwrap().is_none());
    // Granted, then revoked twice.
    dispatcher.allow(SENSOR, 0, &mut buffer).unwrap();
    assert!(dispatcher.revoke(SENSOR, 0).unwrap().is_some());
    assert!(dispatcher.revoke(SENSOR, 0).unwrap().is_none());

    assert_eq!(
        fake.count(|call| matches!(call, Syscall::Allow { len: 0, .. })),
        3
    );
    assert!(fake.grant(SENSOR, 0).is_none());
}

#[test]
fn replaced_handler_sees_nothing() {
    let fake = FakeKernel::new();
    let old_hits = Cell::new(0);
    let new_hits = Cell::new(0);
    let dispatcher = Dispatcher::new(&fake);

    dispatcher
        .subscribe(SENSOR, 0, |_| old_hits.set(old_hits.get() + 1))
        .unwrap();
    // Fired while the old handler was registered, delivered after.
    fake.fire(SENSOR, 0, Upcall::EMPTY);
    fake.fire(SENSOR, 0, Upcall::EMPTY);
    dispatcher
        .subscribe(SENSOR, 0, |_| new_hits.set(new_hits.get() + 1))
        .unwrap();

    dispatcher.yield_now();
    dispatcher.yield_now();
    assert_eq!(old_hits.get(), 0);
    assert_eq!(new_hits.get(), 2);
}

#[test]
fn handler_replacing_itself_is_dropped_after_run() {
    let fake = FakeKernel::new();
    let hits = Cell::new(0);
    let replaced = Cell::new(false);
    let dispatcher = std::rc::Rc::new(Dispatcher::new(&fake));
    let weak = std::rc::Rc::downgrade(&dispatcher);

    let hits_ref = &hits;
    let replaced_ref = &replaced;
    dispatcher
        .subscribe(SENSOR, 0, move |_| {
            hits_ref.set(hits_ref.get() + 1);
            if let Some(d) = weak.upgrade() {
                d.subscribe(SENSOR, 0, move |_| replaced_ref.set(true)).unwrap();
            }
        })
        .unwrap();

    fake.fire(SENSOR, 0, Upcall::EMPTY);
    fake.fire(SENSOR, 0, Upcall::EMPTY);
    dispatcher.yield_now();
    dispatcher.yield_now();
    assert_eq!(hits.get(), 1);
    assert!(replaced.get());
}

#[test]
fn bridge_uses_one_of_each() {
    let fake = FakeKernel::new();
    fake.fire_on_command(SENSOR, 0, 0, Upcall::new(5, 0, 0));
    let dispatcher = Dispatcher::new(&fake);

    let upcall = dispatcher
        .bridge(SENSOR, 0, || dispatcher.command(SENSOR, 0, 0))
        .unwrap();
    assert_eq!(upcall.arg0, 5);
    assert_eq!(
        fake.calls(),
        [
            Syscall::Subscribe { driver: SENSOR, slot: 0, registered: true },
            Syscall::Command { driver: SENSOR, opcode: 0, data: 0 },
            Syscall::Yield,
        ]
    );
}

#[test]
fn late_delivery_after_bridge_is_dropped() {
    let fake = FakeKernel::new();
    fake.fire_on_command(SENSOR, 0, 0, Upcall::EMPTY);
    fake.fire_on_command(SENSOR, 0, 0, Upcall::EMPTY);
    let dispatcher = Dispatcher::new(&fake);

    dispatcher
        .bridge(SENSOR, 0, || dispatcher.command(SENSOR, 0, 0))
        .unwrap();
    assert_eq!(fake.pending(), 1);
    dispatcher.yield_now();
    assert_eq!(fake.pending(), 0);
    assert!(!dispatcher.is_subscribed(SENSOR, 0));
}

#[test]
fn gpio_events_drained_one_by_one() {
    const PIN: u32 = 6;
    const EVENTS: usize = 7;

    let fake = FakeKernel::new();
    let seen = Cell::new(0usize);
    let level = Cell::new(None);
    let dispatcher = Dispatcher::new(&fake);
    let gpio = Gpio::new(&dispatcher);
    gpio.on_interrupt(|event| {
        assert_eq!(event.pin, PIN);
        seen.set(seen.get() + 1);
        level.set(Some(event.high));
    })
    .unwrap();

    for i in 0..EVENTS {
        let high = i % 2 == 0;
        fake.fire(DriverId::GPIO, INTERRUPT_SLOT, Upcall::new(PIN as usize, high as usize, 0));
        dispatcher.yield_now();
        assert_eq!(level.get(), Some(high));
    }
    assert_eq!(seen.get(), EVENTS);
    assert_eq!(level.get(), Some((EVENTS - 1) % 2 == 0));
}

#[test]
fn spi_write_sync_call_order() {
    let fake = FakeKernel::new();
    fake.fire_on_command(DriverId::SPI, 1, COMPLETION_SLOT, Upcall::EMPTY);
    let dispatcher = Dispatcher::new(&fake);
    let spi = Spi::new(&dispatcher);
    let data: [u8; 10] = *b"0123456789";

    spi.write_sync(&data).unwrap();

    assert_eq!(
        &fake.calls()[..4],
        [
            Syscall::Allow { driver: DriverId::SPI, slot: spi::allow::WRITE, len: 10 },
            Syscall::Subscribe { driver: DriverId::SPI, slot: COMPLETION_SLOT, registered: true },
            Syscall::Command { driver: DriverId::SPI, opcode: 1, data: 10 },
            Syscall::Yield,
        ]
    );
    // Revoked once the transfer completed.
    assert_eq!(
        fake.calls().last(),
        Some(&Syscall::Allow { driver: DriverId::SPI, slot: spi::allow::WRITE, len: 0 })
    );
    assert_eq!(&data, b"0123456789");
}

#[test]
fn failing_transfer_never_yields() {
    let fake = FakeKernel::new();
    fake.fail_command(DriverId::SPI, 1, KernelError::Busy);
    let dispatcher = Dispatcher::new(&fake);
    let spi = Spi::new(&dispatcher);

    assert_eq!(spi.write_sync(b"abc"), Err(KernelError::Busy));
    assert_eq!(fake.count(|call| matches!(call, Syscall::Yield)), 0);
    assert!(fake.grant(DriverId::SPI, spi::allow::WRITE).is_none());
}

#[test]
fn yield_without_handler_drops_event() {
    let fake = FakeKernel::new();
    let log = RefCell::new(Vec::new());
    let dispatcher = Dispatcher::new(&fake);
    fake.fire(SENSOR, 3, Upcall::EMPTY);
    dispatcher.subscribe(SENSOR, 4, |u| log.borrow_mut().push(u.arg0)).unwrap();
    fake.fire(SENSOR, 4, Upcall::new(1, 0, 0));

    dispatcher.yield_now();
    assert_eq!(*log.borrow(), vec![1]);
}

#[test]
fn spi_sync_aborts_on_failed_allow() {
    let fake = FakeKernel::new();
    let dispatcher = Dispatcher::new(&fake);
    let spi = Spi::new(&dispatcher);

    fake.fail_allow(DriverId::SPI, spi::allow::WRITE, KernelError::Reserve);
    assert_eq!(spi.write_sync(b"abc"), Err(KernelError::Reserve));

    let mut read = [0u8; 3];
    fake.fail_allow(DriverId::SPI, spi::allow::WRITE, KernelError::Reserve);
    assert_eq!(spi.read_write_sync(b"abc", &mut read), Err(KernelError::Reserve));

    assert_eq!(fake.count(|call| matches!(call, Syscall::Yield)), 0);
    assert_eq!(fake.count(|call| matches!(call, Syscall::Subscribe { .. })), 0);
    assert_eq!(fake.count(|call| matches!(call, Syscall::Command { .. })), 0);
    // The read buffer lent before the failure was handed back.
    assert!(fake.grant(DriverId::SPI, spi::allow::READ).is_none());
}

#[test]
fn spi_sync_aborts_on_failed_subscribe() {
    let fake = FakeKernel::new();
    let dispatcher = Dispatcher::new(&fake);
    let spi = Spi::new(&dispatcher);

    fake.fail_subscribe(DriverId::SPI, COMPLETION_SLOT, KernelError::Off);
    assert_eq!(spi.write_sync(b"abc"), Err(KernelError::Off));

    let mut read = [0u8; 3];
    fake.fail_subscribe(DriverId::SPI, COMPLETION_SLOT, KernelError::Off);
    assert_eq!(spi.read_write_sync(b"abc", &mut read), Err(KernelError::Off));

    assert_eq!(fake.count(|call| matches!(call, Syscall::Yield)), 0);
    assert_eq!(fake.count(|call| matches!(call, Syscall::Command { .. })), 0);
    assert!(fake.grant(DriverId::SPI, spi::allow::READ).is_none());
    assert!(fake.grant(DriverId::SPI, spi::allow::WRITE).is_none());
}
