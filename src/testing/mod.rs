//! Test support.
//!
//! Always compiled so integration tests and downstream crates can drive
//! bindings without hardware.

mod fake_kernel;

pub use fake_kernel::{Effect, FakeKernel, Syscall, Trigger, ARENA_SIZE, DEFAULT_QUEUE_DEPTH};
