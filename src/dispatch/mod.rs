//! Upcall Dispatch
//!
//! Turns "the kernel fired an event" into "a registered handler runs on the
//! caller's stack".
//!
//! # Design
//! - One [`Dispatcher`] owns the table from (driver, subscribe slot) to the
//!   handler record; there is no process-wide callback state
//! - Every kernel registration points at the same entry function with the
//!   slot's record as context, so all deliveries funnel through here
//! - Records are boxed and live as long as the dispatcher, so a context
//!   pointer the kernel still holds never dangles
//!
//! # Scheduling Rules
//! - `yield` delivers at most one upcall; drain by yielding again
//! - Handlers run to completion and may not yield themselves
//! - Re-subscribing a slot replaces its handler; the old one never runs again
//! - No ordering is assumed across slots

mod condition;
mod grant;

pub use condition::Condition;
pub use grant::Lent;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use core::cell::{Cell, RefCell};
use core::ptr::{self, NonNull};

use log::{debug, trace, warn};

use crate::syscall::{decode, DriverId, Kernel, KernelError, KernelResult};

/// Arguments of one upcall.
///
/// `arg0` and `arg1` are event specific; `arg2` is reserved by most drivers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Upcall {
    pub arg0: usize,
    pub arg1: usize,
    pub arg2: usize,
}

impl Upcall {
    /// All-zero arguments.
    pub const EMPTY: Self = Self::new(0, 0, 0);

    /// Bundle upcall arguments.
    #[inline]
    pub const fn new(arg0: usize, arg1: usize, arg2: usize) -> Self {
        Self { arg0, arg1, arg2 }
    }
}

/// Table key: one subscribe or allow slot of one driver.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) struct SlotKey {
    driver: DriverId,
    slot: u32,
}

impl SlotKey {
    #[inline]
    const fn new(driver: DriverId, slot: u32) -> Self {
        Self { driver, slot }
    }
}

/// What runs when a slot's upcall is delivered.
enum Handler<'a> {
    /// Application handler.
    Callback(Box<dyn FnMut(Upcall) + 'a>),
    /// Completion flag of an in-progress [`Dispatcher::bridge`].
    Condition(NonNull<Condition>),
}

/// Per-slot registration.
struct SlotRecord<'a> {
    key: SlotKey,
    handler: RefCell<Option<Handler<'a>>>,
    /// Bumped on every replacement so a running handler can tell it was
    /// replaced while it ran.
    generation: Cell<u32>,
    delivering: Rc<Cell<bool>>,
}

impl<'a> SlotRecord<'a> {
    fn new(key: SlotKey, delivering: Rc<Cell<bool>>) -> Self {
        Self {
            key,
            handler: RefCell::new(None),
            generation: Cell::new(0),
            delivering,
        }
    }

    fn install(&self, handler: Option<Handler<'a>>) -> Option<Handler<'a>> {
        self.generation.set(self.generation.get().wrapping_add(1));
        self.handler.replace(handler)
    }

    fn is_occupied(&self) -> bool {
        self.handler.borrow().is_some()
    }

    /// Detach a bridge's condition if it is still the installed handler.
    fn release_condition(&self, condition: NonNull<Condition>) {
        let ours = matches!(
            self.handler.borrow().as_ref(),
            Some(Handler::Condition(c)) if *c == condition
        );
        if ours {
            self.install(None);
        }
    }

    fn deliver(&self, upcall: Upcall) {
        let generation = self.generation.get();
        let Some(handler) = self.handler.borrow_mut().take() else {
            trace!(
                "{}: upcall {:?} on vacant slot {} dropped",
                self.key.driver,
                upcall,
                self.key.slot
            );
            return;
        };

        self.delivering.set(true);
        let handler = match handler {
            Handler::Condition(condition) => {
                // SAFETY: A condition is only installed by `bridge`, which
                // detaches it before the condition goes out of scope.
                unsafe { condition.as_ref() }.signal(upcall);
                Handler::Condition(condition)
            }
            Handler::Callback(mut callback) => {
                callback(upcall);
                Handler::Callback(callback)
            }
        };
        self.delivering.set(false);

        // A handler replaced during its own run is dropped here.
        if self.generation.get() == generation {
            *self.handler.borrow_mut() = Some(handler);
        }
    }
}

/// The entry point every kernel registration points at.
///
/// # Safety
/// `context` must be null or point at a live `SlotRecord`.
unsafe extern "C" fn upcall_entry(arg0: usize, arg1: usize, arg2: usize, context: *mut ()) {
    if context.is_null() {
        return;
    }
    // SAFETY: The only non-null contexts handed to the kernel are boxed
    // records owned by a live dispatcher, which clears every registration
    // before freeing them.
    let record = unsafe { &*context.cast::<SlotRecord<'_>>() };
    record.deliver(Upcall::new(arg0, arg1, arg2));
}

/// Detaches a bridge's condition when the bridge returns by any path.
struct ConditionScope<'r, 'a> {
    record: &'r SlotRecord<'a>,
    condition: NonNull<Condition>,
}

impl Drop for ConditionScope<'_, '_> {
    fn drop(&mut self) {
        self.record.release_condition(self.condition);
    }
}

/// Owner of all upcall registrations and buffer grants of a process.
///
/// Handlers may borrow anything that outlives `'a`.
pub struct Dispatcher<'a, K: Kernel> {
    kernel: K,
    slots: RefCell<BTreeMap<SlotKey, Box<SlotRecord<'a>>>>,
    grants: RefCell<BTreeMap<SlotKey, Lent<'a>>>,
    delivering: Rc<Cell<bool>>,
}

impl<'a, K: Kernel> Dispatcher<'a, K> {
    /// Create a dispatcher with no registrations.
    pub fn new(kernel: K) -> Self {
        Self {
            kernel,
            slots: RefCell::new(BTreeMap::new()),
            grants: RefCell::new(BTreeMap::new()),
            delivering: Rc::new(Cell::new(false)),
        }
    }

    /// The underlying kernel.
    #[inline]
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Check if a handler is currently running.
    #[inline]
    pub fn in_upcall(&self) -> bool {
        self.delivering.get()
    }

    /// Issue a command and decode its status.
    pub fn command(&self, driver: DriverId, opcode: u32, data: usize) -> KernelResult<usize> {
        let raw = self.kernel.command(driver, opcode, data);
        trace!("{}: command {}({:#x}) -> {}", driver, opcode, data, raw);
        decode(raw)
    }

    /// Register `handler` for `(driver, slot)`, replacing any previous one.
    ///
    /// If the kernel rejects the registration the previous handler stays.
    pub fn subscribe<F>(&self, driver: DriverId, slot: u32, handler: F) -> KernelResult<()>
    where
        F: FnMut(Upcall) + 'a,
    {
        self.attach(SlotKey::new(driver, slot), Handler::Callback(Box::new(handler)))
    }

    /// Clear the registration of `(driver, slot)`.
    pub fn unsubscribe(&self, driver: DriverId, slot: u32) -> KernelResult<()> {
        // SAFETY: No upcall and a null context leave nothing for the kernel to hold
        decode(unsafe { self.kernel.subscribe(driver, slot, None, ptr::null_mut()) })?;
        if let Some(record) = self.slots.borrow().get(&SlotKey::new(driver, slot)) {
            record.install(None);
        }
        debug!("{}: subscribe slot {} cleared", driver, slot);
        Ok(())
    }

    /// Check if `(driver, slot)` has a live handler.
    pub fn is_subscribed(&self, driver: DriverId, slot: u32) -> bool {
        self.slots
            .borrow()
            .get(&SlotKey::new(driver, slot))
            .is_some_and(|record| record.is_occupied())
    }

    /// Cede control to the kernel, letting at most one upcall run.
    ///
    /// Refused (with a warning) when called from inside a handler.
    pub fn yield_now(&self) {
        if self.in_upcall() {
            warn!("yield from inside an upcall refused");
            return;
        }
        self.kernel.yield_now();
    }

    /// Yield until `condition` is set.
    ///
    /// Returns immediately, with the condition possibly unset, when called
    /// from inside a handler.
    pub fn yield_for(&self, condition: &Condition) {
        while !condition.is_set() {
            if self.in_upcall() {
                warn!("yield_for from inside an upcall refused");
                return;
            }
            self.kernel.yield_now();
        }
    }

    /// Run an asynchronous operation as a blocking call.
    ///
    /// Installs a completion flag on `(driver, slot)`, runs `trigger`, then
    /// yields until the slot's upcall arrives. A failed registration or
    /// trigger is returned at once, without yielding.
    ///
    /// # Returns
    /// The arguments of the completing upcall.
    ///
    /// # Errors
    /// `Busy` when called from inside a handler, which could never yield.
    pub fn bridge<T, F>(&self, driver: DriverId, slot: u32, trigger: F) -> KernelResult<Upcall>
    where
        F: FnOnce() -> KernelResult<T>,
    {
        if self.in_upcall() {
            return Err(KernelError::Busy);
        }

        let condition = Condition::new();
        let flag = NonNull::from(&condition);
        let key = SlotKey::new(driver, slot);
        self.attach(key, Handler::Condition(flag))?;
        let _scope = ConditionScope {
            record: self.record(key),
            condition: flag,
        };

        trigger()?;
        self.yield_for(&condition);
        Ok(condition.upcall().unwrap_or(Upcall::EMPTY))
    }

    /// Get (creating if needed) the record of `key`.
    fn record(&self, key: SlotKey) -> &SlotRecord<'a> {
        let mut slots = self.slots.borrow_mut();
        let record = slots
            .entry(key)
            .or_insert_with(|| Box::new(SlotRecord::new(key, Rc::clone(&self.delivering))));
        let record: *const SlotRecord<'a> = &**record;
        // SAFETY: Records are boxed and never removed from the table while
        // the dispatcher lives, so the address outlives this borrow of self.
        unsafe { &*record }
    }

    fn attach(&self, key: SlotKey, handler: Handler<'a>) -> KernelResult<()> {
        let record = self.record(key);
        let context = record as *const SlotRecord<'a> as *mut ();
        // SAFETY: `context` is a boxed record that lives until Drop, which
        // clears this registration before the table is freed.
        let raw = unsafe {
            self.kernel
                .subscribe(key.driver, key.slot, Some(upcall_entry), context)
        };
        decode(raw)?;
        record.install(Some(handler));
        debug!("{}: handler installed on subscribe slot {}", key.driver, key.slot);
        Ok(())
    }
}

impl<'a, K: Kernel> Drop for Dispatcher<'a, K> {
    fn drop(&mut self) {
        let kernel = &self.kernel;
        for key in self.grants.get_mut().keys() {
            // SAFETY: A zero-length grant lends nothing
            let raw = unsafe { kernel.allow(key.driver, key.slot, ptr::null_mut(), 0) };
            if raw < 0 {
                warn!("{}: revoke of slot {} on teardown failed: {}", key.driver, key.slot, raw);
            }
        }
        for key in self.slots.get_mut().keys() {
            // SAFETY: Clearing a registration hands the kernel nothing
            let raw = unsafe { kernel.subscribe(key.driver, key.slot, None, ptr::null_mut()) };
            if raw < 0 {
                warn!("{}: clearing slot {} on teardown failed: {}", key.driver, key.slot, raw);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeKernel, Syscall};
    use alloc::vec;
    use alloc::vec::Vec;

    const DRIVER: DriverId = DriverId::new(9);

    #[test]
    fn test_handler_runs_once_per_yield() {
        let fake = FakeKernel::new();
        let seen = RefCell::new(Vec::new());
        let dispatcher = Dispatcher::new(&fake);
        dispatcher
            .subscribe(DRIVER, 0, |upcall| seen.borrow_mut().push(upcall.arg0))
            .unwrap();

        fake.fire(DRIVER, 0, Upcall::new(1, 0, 0));
        fake.fire(DRIVER, 0, Upcall::new(2, 0, 0));

        dispatcher.yield_now();
        assert_eq!(*seen.borrow(), vec![1]);
        dispatcher.yield_now();
        assert_eq!(*seen.borrow(), vec![1, 2]);
        dispatcher.yield_now();
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_rejected_subscribe_keeps_old_handler() {
        let fake = FakeKernel::new();
        let hits = Cell::new(0);
        let dispatcher = Dispatcher::new(&fake);
        dispatcher.subscribe(DRIVER, 0, |_| hits.set(hits.get() + 1)).unwrap();

        fake.fail_subscribe(DRIVER, 0, KernelError::Reserve);
        assert_eq!(
            dispatcher.subscribe(DRIVER, 0, |_| panic!("must not run")),
            Err(KernelError::Reserve)
        );

        fake.fire(DRIVER, 0, Upcall::EMPTY);
        dispatcher.yield_now();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_unsubscribe_drops_pending_upcalls() {
        let fake = FakeKernel::new();
        let hits = Cell::new(0);
        let dispatcher = Dispatcher::new(&fake);
        dispatcher.subscribe(DRIVER, 1, |_| hits.set(hits.get() + 1)).unwrap();
        fake.fire(DRIVER, 1, Upcall::EMPTY);

        dispatcher.unsubscribe(DRIVER, 1).unwrap();
        assert!(!dispatcher.is_subscribed(DRIVER, 1));
        dispatcher.yield_now();
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_bridge_returns_upcall_arguments() {
        let fake = FakeKernel::new();
        fake.fire_on_command(DRIVER, 0, 0, Upcall::new(77, 5, 0));
        let dispatcher = Dispatcher::new(&fake);

        let upcall = dispatcher
            .bridge(DRIVER, 0, || dispatcher.command(DRIVER, 0, 0))
            .unwrap();
        assert_eq!(upcall, Upcall::new(77, 5, 0));
        // The bridge's flag is detached once it returns.
        assert!(!dispatcher.is_subscribed(DRIVER, 0));
    }

    #[test]
    fn test_bridge_aborts_on_failed_subscribe() {
        let fake = FakeKernel::new();
        fake.fail_subscribe(DRIVER, 0, KernelError::Off);
        let dispatcher = Dispatcher::new(&fake);
        let mut triggered = false;

        let result = dispatcher.bridge(DRIVER, 0, || {
            triggered = true;
            Ok(())
        });
        assert_eq!(result, Err(KernelError::Off));
        assert!(!triggered);
        assert_eq!(fake.count(|call| matches!(call, Syscall::Yield)), 0);
    }

    #[test]
    fn test_yield_inside_handler_is_refused() {
        let dispatcher = Rc::new(Dispatcher::new(FakeKernel::new()));
        let nested = Rc::new(Cell::new(None));
        let weak = Rc::downgrade(&dispatcher);
        let seen = Rc::clone(&nested);
        dispatcher
            .subscribe(DRIVER, 0, move |_| {
                if let Some(d) = weak.upgrade() {
                    d.yield_now();
                    seen.set(Some(d.bridge(DRIVER, 1, || Ok(()))));
                }
            })
            .unwrap();
        dispatcher.kernel().fire(DRIVER, 0, Upcall::EMPTY);
        dispatcher.kernel().fire(DRIVER, 0, Upcall::EMPTY);

        dispatcher.yield_now();
        // The nested yield did not drain the second event.
        assert_eq!(dispatcher.kernel().pending(), 1);
        assert_eq!(nested.get(), Some(Err(KernelError::Busy)));
        assert!(!dispatcher.in_upcall());
    }

    #[test]
    fn test_drop_clears_registrations_and_grants() {
        let fake = FakeKernel::new();
        let mut buffer = [0u8; 4];
        {
            let dispatcher = Dispatcher::new(&fake);
            dispatcher.subscribe(DRIVER, 2, |_| {}).unwrap();
            dispatcher.allow(DRIVER, 0, &mut buffer).unwrap();
            assert!(fake.is_subscribed(DRIVER, 2));
            assert!(fake.grant(DRIVER, 0).is_some());
        }
        assert!(!fake.is_subscribed(DRIVER, 2));
        assert!(fake.grant(DRIVER, 0).is_none());
        buffer[0] = 1;
    }

    #[test]
    fn test_revoke_returns_buffer() {
        let fake = FakeKernel::new();
        let mut buffer = [0u8; 8];
        let dispatcher = Dispatcher::new(&fake);
        assert!(dispatcher.allow(DRIVER, 0, &mut buffer).unwrap().is_none());
        fake.write_grant(DRIVER, 0, b"hi").unwrap();

        let lent = dispatcher.revoke(DRIVER, 0).unwrap().unwrap();
        assert!(lent.is_exclusive());
        let buffer = lent.into_mut().unwrap();
        assert_eq!(&buffer[..2], b"hi");
        assert!(!dispatcher.is_lent(DRIVER, 0));
    }

    #[test]
    fn test_empty_grant_rejected_locally() {
        let fake = FakeKernel::new();
        let dispatcher = Dispatcher::new(&fake);
        assert_eq!(
            dispatcher.allow_readonly(DRIVER, 1, &[]).unwrap_err(),
            KernelError::Size
        );
        assert_eq!(fake.count(|call| matches!(call, Syscall::Allow { .. })), 0);
    }
}
