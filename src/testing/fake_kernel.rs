//! In-memory kernel for testing.
//!
//! Implements [`Kernel`] with scripted drivers: every trap is recorded in
//! order, command results and faults are injected up front, and events are
//! queued until the process yields, just like the real upcall ring.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use log::{trace, warn};

use crate::dispatch::Upcall;
use crate::syscall::{DriverId, Kernel, KernelError, MemOp, UpcallFn};

/// Events the fake holds before dropping new ones (the kernel's upcall ring).
pub const DEFAULT_QUEUE_DEPTH: usize = 10;

/// Bytes of memory behind `memop`.
pub const ARENA_SIZE: usize = 64 * 1024;

/// Alignment of the initial break.
const ARENA_ALIGN: usize = 16;

/// Consecutive yields with nothing to deliver before the fake gives up.
const IDLE_YIELD_LIMIT: usize = 1024;

/// One recorded trap.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Syscall {
    Yield,
    Subscribe {
        driver: DriverId,
        slot: u32,
        /// `false` when the slot was cleared.
        registered: bool,
    },
    Command {
        driver: DriverId,
        opcode: u32,
        data: usize,
    },
    Allow {
        driver: DriverId,
        slot: u32,
        len: usize,
    },
    Memop {
        op: MemOp,
        arg: isize,
    },
}

/// What makes a scripted [`Effect`] happen.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Trigger {
    /// A successful command.
    Command { driver: DriverId, opcode: u32 },
    /// A registration (not a clear) of a subscribe slot.
    Subscribe { driver: DriverId, slot: u32 },
}

impl Trigger {
    fn driver(&self) -> DriverId {
        match *self {
            Self::Command { driver, .. } | Self::Subscribe { driver, .. } => driver,
        }
    }
}

/// Simulated driver behaviour, applied to the trigger's driver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Effect {
    /// Queue an upcall on a subscribe slot.
    Fire { slot: u32, upcall: Upcall },
    /// Copy one allow slot's bytes into another (loopback DMA).
    Copy { from: u32, to: u32 },
    /// Append an allow slot's bytes to the capture log.
    Capture { slot: u32 },
}

/// Which primitive a fault is armed on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Primitive {
    Subscribe,
    Command,
    Allow,
}

type Key = (DriverId, u32);

#[derive(Clone, Copy)]
struct Registration {
    upcall: UpcallFn,
    context: *mut (),
}

#[derive(Clone, Copy)]
struct Region {
    ptr: *mut u8,
    len: usize,
}

/// Deterministic stand-in for the kernel.
pub struct FakeKernel {
    calls: RefCell<Vec<Syscall>>,
    subscriptions: RefCell<BTreeMap<Key, Registration>>,
    grants: RefCell<BTreeMap<Key, Region>>,
    /// Command results by (driver, opcode); 0 when absent
    results: RefCell<BTreeMap<Key, isize>>,
    /// One-shot faults by (primitive, driver, slot or opcode)
    faults: RefCell<BTreeMap<(Primitive, DriverId, u32), KernelError>>,
    rules: RefCell<Vec<(Trigger, Effect)>>,
    fired: RefCell<VecDeque<(Key, Upcall)>>,
    depth: usize,
    captured: RefCell<Vec<u8>>,
    idle_yields: Cell<usize>,
    arena: Box<[Cell<u8>]>,
    brk: Cell<usize>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    /// Create a fake with no drivers scripted and a queue of
    /// [`DEFAULT_QUEUE_DEPTH`] events.
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    /// Create a fake holding at most `depth` undelivered events.
    pub fn with_queue_depth(depth: usize) -> Self {
        let arena: Box<[Cell<u8>]> = (0..ARENA_SIZE + ARENA_ALIGN).map(|_| Cell::new(0)).collect();
        let base = align_up(arena.as_ptr() as usize, ARENA_ALIGN);
        Self {
            calls: RefCell::new(Vec::new()),
            subscriptions: RefCell::new(BTreeMap::new()),
            grants: RefCell::new(BTreeMap::new()),
            results: RefCell::new(BTreeMap::new()),
            faults: RefCell::new(BTreeMap::new()),
            rules: RefCell::new(Vec::new()),
            fired: RefCell::new(VecDeque::new()),
            depth,
            captured: RefCell::new(Vec::new()),
            idle_yields: Cell::new(0),
            arena,
            brk: Cell::new(base),
        }
    }

    // ---- scripting ----

    /// Queue an upcall for `(driver, slot)`.
    ///
    /// # Returns
    /// `false` if the queue was full and the event was dropped.
    pub fn fire(&self, driver: DriverId, slot: u32, upcall: Upcall) -> bool {
        let mut fired = self.fired.borrow_mut();
        if fired.len() >= self.depth {
            warn!("{}: upcall queue full, slot {} event dropped", driver, slot);
            return false;
        }
        fired.push_back(((driver, slot), upcall));
        true
    }

    /// Make every later `command(driver, opcode, _)` return `raw`.
    pub fn set_command_result(&self, driver: DriverId, opcode: u32, raw: isize) {
        self.results.borrow_mut().insert((driver, opcode), raw);
    }

    /// Fail the next subscribe on `(driver, slot)` with `error`.
    pub fn fail_subscribe(&self, driver: DriverId, slot: u32, error: KernelError) {
        self.arm(Primitive::Subscribe, driver, slot, error);
    }

    /// Fail the next command `opcode` on `driver` with `error`.
    pub fn fail_command(&self, driver: DriverId, opcode: u32, error: KernelError) {
        self.arm(Primitive::Command, driver, opcode, error);
    }

    /// Fail the next non-empty allow on `(driver, slot)` with `error`.
    ///
    /// Revocations always succeed.
    pub fn fail_allow(&self, driver: DriverId, slot: u32, error: KernelError) {
        self.arm(Primitive::Allow, driver, slot, error);
    }

    /// Apply `effect` every time `trigger` happens, after earlier rules.
    pub fn on(&self, trigger: Trigger, effect: Effect) {
        self.rules.borrow_mut().push((trigger, effect));
    }

    /// Fire `upcall` on `slot` whenever `command(driver, opcode, _)` succeeds.
    pub fn fire_on_command(&self, driver: DriverId, opcode: u32, slot: u32, upcall: Upcall) {
        self.on(Trigger::Command { driver, opcode }, Effect::Fire { slot, upcall });
    }

    /// Fire `upcall` on `slot` whenever that slot is registered.
    pub fn fire_on_subscribe(&self, driver: DriverId, slot: u32, upcall: Upcall) {
        self.on(Trigger::Subscribe { driver, slot }, Effect::Fire { slot, upcall });
    }

    /// Write `data` into the buffer currently lent on `(driver, slot)`.
    ///
    /// # Errors
    /// `Invalid` if nothing is lent, `Size` if `data` does not fit.
    pub fn write_grant(&self, driver: DriverId, slot: u32, data: &[u8]) -> Result<(), KernelError> {
        let region = self
            .grants
            .borrow()
            .get(&(driver, slot))
            .copied()
            .ok_or(KernelError::Invalid)?;
        if data.len() > region.len {
            return Err(KernelError::Size);
        }
        // SAFETY: The region is lent to us until revoked, and `data.len()`
        // is within it.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), region.ptr, data.len()) };
        Ok(())
    }

    // ---- inspection ----

    /// Every trap so far, oldest first.
    pub fn calls(&self) -> Vec<Syscall> {
        self.calls.borrow().clone()
    }

    /// Number of recorded traps matching `pred`.
    pub fn count(&self, pred: impl Fn(&Syscall) -> bool) -> usize {
        self.calls.borrow().iter().filter(|&call| pred(call)).count()
    }

    /// Forget recorded traps.
    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    /// Events queued but not yet delivered.
    pub fn pending(&self) -> usize {
        self.fired.borrow().len()
    }

    /// Check if `(driver, slot)` has a kernel-side registration.
    pub fn is_subscribed(&self, driver: DriverId, slot: u32) -> bool {
        self.subscriptions.borrow().contains_key(&(driver, slot))
    }

    /// Copy of the buffer lent on `(driver, slot)`, if any.
    pub fn grant(&self, driver: DriverId, slot: u32) -> Option<Vec<u8>> {
        let region = self.grants.borrow().get(&(driver, slot)).copied()?;
        Some(read_region(region))
    }

    /// Bytes appended by [`Effect::Capture`].
    pub fn captured(&self) -> Vec<u8> {
        self.captured.borrow().clone()
    }

    /// Current process break.
    pub fn break_addr(&self) -> usize {
        self.brk.get()
    }

    /// Address range `memop` may move the break within.
    pub fn arena(&self) -> core::ops::Range<usize> {
        let base = align_up(self.arena.as_ptr() as usize, ARENA_ALIGN);
        base..base + ARENA_SIZE
    }

    // ---- internals ----

    fn record(&self, call: Syscall) {
        trace!("fake kernel: {:?}", call);
        self.calls.borrow_mut().push(call);
    }

    fn arm(&self, primitive: Primitive, driver: DriverId, number: u32, error: KernelError) {
        self.faults.borrow_mut().insert((primitive, driver, number), error);
    }

    fn take_fault(&self, primitive: Primitive, driver: DriverId, number: u32) -> Option<isize> {
        self.faults
            .borrow_mut()
            .remove(&(primitive, driver, number))
            .map(KernelError::code)
    }

    fn run_rules(&self, trigger: Trigger) {
        let effects: Vec<Effect> = self
            .rules
            .borrow()
            .iter()
            .filter(|(t, _)| *t == trigger)
            .map(|(_, effect)| *effect)
            .collect();
        let driver = trigger.driver();
        for effect in effects {
            match effect {
                Effect::Fire { slot, upcall } => {
                    self.fire(driver, slot, upcall);
                }
                Effect::Copy { from, to } => self.copy_grant(driver, from, to),
                Effect::Capture { slot } => {
                    if let Some(bytes) = self.grant(driver, slot) {
                        self.captured.borrow_mut().extend_from_slice(&bytes);
                    }
                }
            }
        }
    }

    fn copy_grant(&self, driver: DriverId, from: u32, to: u32) {
        let Some(bytes) = self.grant(driver, from) else {
            return;
        };
        let Some(dst) = self.grants.borrow().get(&(driver, to)).copied() else {
            return;
        };
        let n = bytes.len().min(dst.len);
        // SAFETY: `dst` is lent to us and `n` is within it
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.ptr, n) };
    }

    /// Pop the next event that still has a registration.
    fn next_delivery(&self) -> Option<(Registration, Upcall)> {
        let mut fired = self.fired.borrow_mut();
        let subscriptions = self.subscriptions.borrow();
        while let Some((key, upcall)) = fired.pop_front() {
            match subscriptions.get(&key) {
                Some(registration) => return Some((*registration, upcall)),
                None => trace!("fake kernel: {} slot {} unregistered, event dropped", key.0, key.1),
            }
        }
        None
    }
}

impl Kernel for FakeKernel {
    /// Deliver the oldest queued event, if any.
    ///
    /// # Panics
    /// After many consecutive yields with nothing queued, since a real
    /// kernel would block the process forever.
    fn yield_now(&self) {
        self.record(Syscall::Yield);
        let Some((registration, upcall)) = self.next_delivery() else {
            let idle = self.idle_yields.get() + 1;
            self.idle_yields.set(idle);
            if idle >= IDLE_YIELD_LIMIT {
                panic!("fake kernel: process yields forever with no event to deliver");
            }
            return;
        };
        self.idle_yields.set(0);
        // SAFETY: The process registered this entry point and context and
        // has not cleared them; no borrow of our state is held across it.
        unsafe {
            (registration.upcall)(upcall.arg0, upcall.arg1, upcall.arg2, registration.context)
        };
    }

    unsafe fn subscribe(
        &self,
        driver: DriverId,
        slot: u32,
        upcall: Option<UpcallFn>,
        context: *mut (),
    ) -> isize {
        self.record(Syscall::Subscribe {
            driver,
            slot,
            registered: upcall.is_some(),
        });
        if let Some(code) = self.take_fault(Primitive::Subscribe, driver, slot) {
            return code;
        }
        match upcall {
            Some(upcall) => {
                self.subscriptions
                    .borrow_mut()
                    .insert((driver, slot), Registration { upcall, context });
                self.run_rules(Trigger::Subscribe { driver, slot });
            }
            None => {
                self.subscriptions.borrow_mut().remove(&(driver, slot));
            }
        }
        0
    }

    fn command(&self, driver: DriverId, opcode: u32, data: usize) -> isize {
        self.record(Syscall::Command { driver, opcode, data });
        if let Some(code) = self.take_fault(Primitive::Command, driver, opcode) {
            return code;
        }
        let raw = self
            .results
            .borrow()
            .get(&(driver, opcode))
            .copied()
            .unwrap_or(0);
        if raw >= 0 {
            self.run_rules(Trigger::Command { driver, opcode });
        }
        raw
    }

    unsafe fn allow(&self, driver: DriverId, slot: u32, ptr: *mut u8, len: usize) -> isize {
        self.record(Syscall::Allow { driver, slot, len });
        if len == 0 || ptr.is_null() {
            self.grants.borrow_mut().remove(&(driver, slot));
            return 0;
        }
        if let Some(code) = self.take_fault(Primitive::Allow, driver, slot) {
            return code;
        }
        self.grants.borrow_mut().insert((driver, slot), Region { ptr, len });
        0
    }

    fn memop(&self, op: MemOp, arg: isize) -> isize {
        self.record(Syscall::Memop { op, arg });
        let arena = self.arena();
        let old = self.brk.get();
        let new = match op {
            MemOp::Brk => arg as usize,
            MemOp::Sbrk => old.wrapping_add_signed(arg),
        };
        if new < arena.start || new > arena.end {
            return KernelError::NoMem.code();
        }
        self.brk.set(new);
        match op {
            MemOp::Brk => 0,
            MemOp::Sbrk => old as isize,
        }
    }
}

fn read_region(region: Region) -> Vec<u8> {
    // SAFETY: Lent regions stay valid until revoked, which removes them
    unsafe { core::slice::from_raw_parts(region.ptr, region.len) }.to_vec()
}

const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DRIVER: DriverId = DriverId::new(42);

    #[test]
    fn test_queue_is_bounded() {
        let fake = FakeKernel::with_queue_depth(2);
        assert!(fake.fire(DRIVER, 0, Upcall::EMPTY));
        assert!(fake.fire(DRIVER, 0, Upcall::EMPTY));
        assert!(!fake.fire(DRIVER, 0, Upcall::EMPTY));
        assert_eq!(fake.pending(), 2);
    }

    #[test]
    fn test_faults_are_one_shot() {
        let fake = FakeKernel::new();
        fake.fail_command(DRIVER, 3, KernelError::Busy);
        assert_eq!(fake.command(DRIVER, 3, 0), -2);
        assert_eq!(fake.command(DRIVER, 3, 0), 0);
    }

    #[test]
    fn test_revoke_ignores_armed_fault() {
        let fake = FakeKernel::new();
        fake.fail_allow(DRIVER, 0, KernelError::Fail);
        // SAFETY: Zero-length allow lends nothing
        assert_eq!(unsafe { fake.allow(DRIVER, 0, core::ptr::null_mut(), 0) }, 0);
        let mut buffer = [0u8; 2];
        // SAFETY: Buffer outlives the grant, which is never touched
        let raw = unsafe { fake.allow(DRIVER, 0, buffer.as_mut_ptr(), buffer.len()) };
        assert_eq!(raw, -1);
    }

    #[test]
    fn test_sbrk_returns_previous_break() {
        let fake = FakeKernel::new();
        let start = fake.break_addr();
        assert_eq!(fake.memop(MemOp::Sbrk, 128), start as isize);
        assert_eq!(fake.break_addr(), start + 128);
        assert_eq!(fake.memop(MemOp::Sbrk, ARENA_SIZE as isize), KernelError::NoMem.code());
        assert_eq!(fake.memop(MemOp::Brk, start as isize), 0);
        assert_eq!(fake.break_addr(), start);
    }

    #[test]
    fn test_failed_command_runs_no_rules() {
        let fake = FakeKernel::new();
        fake.fire_on_command(DRIVER, 1, 0, Upcall::EMPTY);
        fake.set_command_result(DRIVER, 1, -6);
        assert_eq!(fake.command(DRIVER, 1, 0), -6);
        assert_eq!(fake.pending(), 0);
    }
}
