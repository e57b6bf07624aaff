//! Hosted Runtime Shim
//!
//! The handful of process and file calls a C-style runtime expects, mapped
//! onto what a PantherOS process actually has: one console, a movable
//! break and nothing else.
//!
//! # Behaviour
//! - fd 0 is the only terminal; every descriptor writes to the console
//! - Opening, closing and signalling always fail
//! - Reads and seeks report nothing
//! - `exit` and `abort` stop the process for good

mod heap;

pub use heap::{ProcessHeap, HEAP_GROWTH_STEP};

use core::fmt;

use bitflags::bitflags;
use log::{debug, warn};

use crate::dispatch::Dispatcher;
use crate::drivers::Console;
use crate::syscall::{decode, Kernel, KernelError, MemOp};

/// Errors returned by the shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimError {
    /// The call has no meaning for a PantherOS process
    Unsupported,
    /// The kernel rejected the underlying syscall
    Kernel(KernelError),
}

impl From<KernelError> for ShimError {
    fn from(e: KernelError) -> Self {
        Self::Kernel(e)
    }
}

impl fmt::Display for ShimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "operation not supported"),
            Self::Kernel(e) => write!(f, "kernel error: {}", e),
        }
    }
}

bitflags! {
    /// File type bits as reported by `fstat`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct FileMode: u32 {
        /// Character device.
        const CHAR_DEVICE = 0o020000;
    }
}

/// Process and file calls for one process.
pub struct HostedRuntime<'d, 'a, K: Kernel> {
    dispatcher: &'d Dispatcher<'a, K>,
}

impl<'d, 'a, K: Kernel> HostedRuntime<'d, 'a, K> {
    pub fn new(dispatcher: &'d Dispatcher<'a, K>) -> Self {
        Self { dispatcher }
    }

    /// Only stdin counts as a terminal.
    pub fn isatty(&self, fd: i32) -> bool {
        fd == 0
    }

    pub fn open(&self, _path: &str, _flags: i32) -> Result<i32, ShimError> {
        Err(ShimError::Unsupported)
    }

    pub fn close(&self, _fd: i32) -> Result<(), ShimError> {
        Err(ShimError::Unsupported)
    }

    pub fn lseek(&self, _fd: i32, _offset: isize, _whence: i32) -> isize {
        0
    }

    /// There is no input; always reads zero bytes.
    pub fn read(&self, _fd: i32, _buf: &mut [u8]) -> usize {
        0
    }

    /// Write `buf` to the console, whatever the descriptor.
    ///
    /// # Returns
    /// Number of bytes written.
    pub fn write(&self, _fd: i32, buf: &[u8]) -> Result<usize, ShimError> {
        Ok(Console::new(self.dispatcher).write_sync(buf)?)
    }

    /// Every descriptor is the console.
    pub fn fstat(&self, _fd: i32) -> FileMode {
        FileMode::CHAR_DEVICE
    }

    pub fn getpid(&self) -> i32 {
        0
    }

    pub fn kill(&self, _pid: i32, _signal: i32) -> Result<(), ShimError> {
        Err(ShimError::Unsupported)
    }

    /// Stop the process. `status` is not reported anywhere.
    pub fn exit(&self, status: i32) -> ! {
        debug!("exit({})", status);
        halt()
    }

    pub fn abort(&self) -> ! {
        warn!("abort");
        halt()
    }

    /// Move the break by `increment` bytes.
    ///
    /// # Returns
    /// The previous break.
    pub fn sbrk(&self, increment: isize) -> Result<usize, ShimError> {
        Ok(decode(self.dispatcher.kernel().memop(MemOp::Sbrk, increment))?)
    }

    /// Set the break to `addr`.
    pub fn brk(&self, addr: usize) -> Result<(), ShimError> {
        decode(self.dispatcher.kernel().memop(MemOp::Brk, addr as isize))?;
        Ok(())
    }
}

/// Process entry.
///
/// Places the break at `stack_top`, runs `main`, then keeps yielding so
/// handlers registered by `main` go on running.
pub fn start<'a, K, F>(dispatcher: &Dispatcher<'a, K>, stack_top: usize, main: F) -> !
where
    K: Kernel,
    F: FnOnce(&Dispatcher<'a, K>),
{
    if let Err(e) = HostedRuntime::new(dispatcher).brk(stack_top) {
        warn!("initial brk({:#x}) failed: {}", stack_top, e);
    }
    main(dispatcher);
    loop {
        dispatcher.yield_now();
    }
}

/// Spin forever without yielding, so no handler runs again.
fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
