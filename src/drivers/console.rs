//! Console Output Binding
//!
//! The console prints the buffer lent on allow slot 1. Subscribing to
//! slot 1 is what starts the write; the same slot reports completion.

use core::fmt;

use crate::dispatch::{Dispatcher, Upcall};
use crate::syscall::{DriverId, Kernel, KernelResult};

/// Allow slot of the output buffer.
pub const OUTPUT_SLOT: u32 = 1;

/// Subscribe slot that starts a write and reports its completion.
pub const WRITE_DONE_SLOT: u32 = 1;

/// Console (driver 0).
pub struct Console<'d, 'a, K: Kernel> {
    dispatcher: &'d Dispatcher<'a, K>,
}

impl<'d, 'a, K: Kernel> Console<'d, 'a, K> {
    pub fn new(dispatcher: &'d Dispatcher<'a, K>) -> Self {
        Self { dispatcher }
    }

    /// Print `data` and block until the console has consumed it.
    ///
    /// # Returns
    /// Number of bytes written.
    pub fn write_sync(&self, data: &[u8]) -> KernelResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let _out = self
            .dispatcher
            .lend_scoped(DriverId::CONSOLE, OUTPUT_SLOT, data)?;
        // The subscribe inside the bridge is the trigger.
        self.dispatcher
            .bridge(DriverId::CONSOLE, WRITE_DONE_SLOT, || Ok(()))?;
        Ok(data.len())
    }

    /// Start printing `data`; `on_done` runs when it has been consumed.
    pub fn write<F>(&self, data: &'a [u8], on_done: F) -> KernelResult<()>
    where
        F: FnMut(Upcall) + 'a,
    {
        self.dispatcher
            .allow_readonly(DriverId::CONSOLE, OUTPUT_SLOT, data)?;
        self.dispatcher
            .subscribe(DriverId::CONSOLE, WRITE_DONE_SLOT, on_done)
    }
}

impl<K: Kernel> fmt::Write for Console<'_, '_, K> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_sync(s.as_bytes()).map(|_| ()).map_err(|_| fmt::Error)
    }
}
