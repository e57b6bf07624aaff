//! PantherOS userland
//!
//! The layer every PantherOS application links against: the five trap
//! primitives, the cooperative upcall dispatcher built on them, typed
//! bindings for the kernel's drivers and the small hosted runtime a C-style
//! toolchain expects.
//!
//! # Architecture
//! - [`syscall`]: trap numbers, status decoding and the [`Kernel`] trait
//! - [`dispatch`]: the (driver, slot) -> handler table, buffer grants and
//!   the condition bridge that turns async driver calls into blocking ones
//! - [`drivers`]: console, GPIO, timer, SPI, serial transport, light sensor
//! - [`shim`]: process/file stubs, console redirection, heap growth
//! - [`logger`]: `log` backend and print macros
//! - [`testing`]: a deterministic in-memory kernel
//!
//! # Scheduling Model
//! A process is a single cooperative thread. `yield` is the only point at
//! which anything asynchronous becomes visible, and it runs at most one
//! upcall before returning.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod dispatch;
pub mod drivers;
pub mod logger;
pub mod shim;
pub mod syscall;
pub mod testing;

pub use dispatch::{Condition, Dispatcher, Lent, Upcall};
pub use syscall::{DriverId, Kernel, KernelError, KernelResult, MemOp};
