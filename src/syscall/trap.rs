//! Supervisor-call trampoline
//!
//! [`Trap`] implements [`Kernel`] with real `svc` instructions.
//!
//! # Calling Convention
//! - ARM (Cortex-M): `svc N` where N is the trap number, arguments in
//!   r0-r3, result in r0
//! - AArch64: `svc #0` with the trap number in x8, arguments in x0-x3,
//!   result in x0
//!
//! `yield` can run an upcall on our stack before it returns, so every trap
//! clobbers the full caller-saved register set.

use core::arch::asm;

use super::{numbers, DriverId, Kernel, MemOp, UpcallFn};

/// The real kernel, reached through supervisor calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trap;

#[cfg(target_arch = "arm")]
#[inline(always)]
unsafe fn syscall4<const N: u8>(a0: usize, a1: usize, a2: usize, a3: usize) -> isize {
    let ret: usize;
    // SAFETY: Caller upholds the contract of the trap being issued.
    // Caller-saved registers are declared clobbered because upcalls may
    // run before the trap returns.
    unsafe {
        asm!(
            "svc {n}",
            n = const N,
            inlateout("r0") a0 => ret,
            inlateout("r1") a1 => _,
            inlateout("r2") a2 => _,
            inlateout("r3") a3 => _,
            clobber_abi("C"),
        );
    }
    ret as isize
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn syscall4<const N: u8>(a0: usize, a1: usize, a2: usize, a3: usize) -> isize {
    let ret: usize;
    // SAFETY: Same contract as the ARM variant; x8 carries the trap number.
    unsafe {
        asm!(
            "svc #0",
            in("x8") N as usize,
            inlateout("x0") a0 => ret,
            inlateout("x1") a1 => _,
            inlateout("x2") a2 => _,
            inlateout("x3") a3 => _,
            clobber_abi("C"),
        );
    }
    ret as isize
}

impl Kernel for Trap {
    fn yield_now(&self) {
        // SAFETY: yield takes no arguments and only runs upcalls we registered
        unsafe {
            syscall4::<{ numbers::YIELD }>(0, 0, 0, 0);
        }
    }

    unsafe fn subscribe(
        &self,
        driver: DriverId,
        slot: u32,
        upcall: Option<UpcallFn>,
        context: *mut (),
    ) -> isize {
        let entry = upcall.map_or(0, |f| f as usize);
        // SAFETY: Caller guarantees `context` outlives the registration
        unsafe {
            syscall4::<{ numbers::SUBSCRIBE }>(
                driver.as_u32() as usize,
                slot as usize,
                entry,
                context as usize,
            )
        }
    }

    fn command(&self, driver: DriverId, opcode: u32, data: usize) -> isize {
        // SAFETY: command passes plain words and never touches our memory
        unsafe {
            syscall4::<{ numbers::COMMAND }>(driver.as_u32() as usize, opcode as usize, data, 0)
        }
    }

    unsafe fn allow(&self, driver: DriverId, slot: u32, ptr: *mut u8, len: usize) -> isize {
        // SAFETY: Caller lends the region until revoke or completion
        unsafe {
            syscall4::<{ numbers::ALLOW }>(
                driver.as_u32() as usize,
                slot as usize,
                ptr as usize,
                len,
            )
        }
    }

    fn memop(&self, op: MemOp, arg: isize) -> isize {
        // SAFETY: memop only moves the process break; the allocator owns
        // everything above it
        unsafe { syscall4::<{ numbers::MEMOP }>(op as usize, arg as usize, 0, 0) }
    }
}
