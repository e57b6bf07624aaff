//! System Call Interface (userland side)
//!
//! The five trap primitives every PantherOS process uses to talk to
//! kernel-resident drivers.
//!
//! # ABI
//! - 0: yield() - cede control; the kernel may run one pending upcall
//! - 1: subscribe(driver, slot, upcall, context) - register an upcall
//! - 2: command(driver, opcode, data) - synchronous driver request
//! - 3: allow(driver, slot, ptr, len) - lend a buffer (len 0 revokes)
//! - 4: memop(op, arg) - process memory control
//!
//! Everything except `yield` completes immediately. `yield` is the only
//! point at which an upcall can run.
//!
//! # Design
//! - The primitives live behind the [`Kernel`] trait so the dispatch core
//!   and the driver bindings run unchanged against the real trap
//!   ([`trap::Trap`]) or the deterministic fake in [`crate::testing`]
//! - Return words are decoded by [`status::decode`], never interpreted ad hoc

mod status;
#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
pub mod trap;

pub use status::{decode, KernelError, KernelResult};

/// Trap numbers.
pub mod numbers {
    pub const YIELD: u8 = 0;
    pub const SUBSCRIBE: u8 = 1;
    pub const COMMAND: u8 = 2;
    pub const ALLOW: u8 = 3;
    pub const MEMOP: u8 = 4;
}

/// Entry point the kernel jumps to when delivering an upcall.
///
/// Arguments are the two event-specific words, the reserved word and the
/// context pointer given at subscription time.
pub type UpcallFn = unsafe extern "C" fn(usize, usize, usize, *mut ());

/// Kernel-assigned driver number.
///
/// A newtype so that driver numbers, opcodes and slots cannot be mixed up
/// at call sites.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct DriverId(u32);

impl DriverId {
    /// Console output.
    pub const CONSOLE: Self = Self(0);
    /// General purpose I/O pins.
    pub const GPIO: Self = Self(1);
    /// Alarm/timer.
    pub const TIMER: Self = Self(3);
    /// SPI master.
    pub const SPI: Self = Self(4);
    /// Serial packet transport to the radio coprocessor.
    pub const SERIAL: Self = Self(5);
    /// ISL29035 ambient light sensor.
    pub const LIGHT: Self = Self(6);

    /// Wrap a raw driver number.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw driver number.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for DriverId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "driver#{}", self.0)
    }
}

/// Memory operations understood by `memop`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum MemOp {
    /// Set the application break to `arg`. Returns 0 on success.
    Brk = 0,
    /// Move the application break by `arg` bytes. Returns the previous break.
    Sbrk = 1,
}

/// The trap-level contract with the kernel.
///
/// Return words are raw: non-negative means success (possibly carrying a
/// value), negative is a status code. Use [`decode`] to interpret them.
pub trait Kernel {
    /// Cede control. Runs at most one pending upcall before returning.
    fn yield_now(&self);

    /// Register `upcall` for `(driver, slot)`, replacing any previous one.
    /// `None` clears the slot.
    ///
    /// # Safety
    /// The kernel keeps `context` and passes it back on every delivery. It
    /// must stay valid until the slot is re-subscribed or cleared.
    unsafe fn subscribe(
        &self,
        driver: DriverId,
        slot: u32,
        upcall: Option<UpcallFn>,
        context: *mut (),
    ) -> isize;

    /// Issue a synchronous command.
    fn command(&self, driver: DriverId, opcode: u32, data: usize) -> isize;

    /// Lend `len` bytes at `ptr` to the driver. `len == 0` revokes.
    ///
    /// # Safety
    /// For `len > 0` the region must stay valid, and untouched by the
    /// caller, until it is revoked or the driver signals completion.
    unsafe fn allow(&self, driver: DriverId, slot: u32, ptr: *mut u8, len: usize) -> isize;

    /// Process memory control.
    fn memop(&self, op: MemOp, arg: isize) -> isize;
}

impl<K: Kernel + ?Sized> Kernel for &K {
    fn yield_now(&self) {
        (**self).yield_now()
    }

    unsafe fn subscribe(
        &self,
        driver: DriverId,
        slot: u32,
        upcall: Option<UpcallFn>,
        context: *mut (),
    ) -> isize {
        // SAFETY: Forwarded contract
        unsafe { (**self).subscribe(driver, slot, upcall, context) }
    }

    fn command(&self, driver: DriverId, opcode: u32, data: usize) -> isize {
        (**self).command(driver, opcode, data)
    }

    unsafe fn allow(&self, driver: DriverId, slot: u32, ptr: *mut u8, len: usize) -> isize {
        // SAFETY: Forwarded contract
        unsafe { (**self).allow(driver, slot, ptr, len) }
    }

    fn memop(&self, op: MemOp, arg: isize) -> isize {
        (**self).memop(op, arg)
    }
}
