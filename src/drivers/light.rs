//! ISL29035 Ambient Light Sensor Binding

use crate::dispatch::Dispatcher;
use crate::syscall::{DriverId, Kernel, KernelResult};

/// Command that starts one intensity reading.
const CMD_START_READING: u32 = 0;

/// Subscribe slot for finished readings. The first argument is the intensity.
pub const READING_SLOT: u32 = 0;

/// Light sensor (driver 6).
pub struct Light<'d, 'a, K: Kernel> {
    dispatcher: &'d Dispatcher<'a, K>,
}

impl<'d, 'a, K: Kernel> Light<'d, 'a, K> {
    pub fn new(dispatcher: &'d Dispatcher<'a, K>) -> Self {
        Self { dispatcher }
    }

    /// Install a handler receiving each reading's intensity.
    pub fn on_reading<F>(&self, mut handler: F) -> KernelResult<()>
    where
        F: FnMut(u32) + 'a,
    {
        self.dispatcher
            .subscribe(DriverId::LIGHT, READING_SLOT, move |upcall| {
                handler(upcall.arg0 as u32)
            })
    }

    /// Start a reading; the result arrives on [`READING_SLOT`].
    pub fn start_reading(&self) -> KernelResult<()> {
        self.dispatcher
            .command(DriverId::LIGHT, CMD_START_READING, 0)
            .map(|_| ())
    }

    /// Take one reading and block until it is ready.
    pub fn read_intensity_sync(&self) -> KernelResult<u32> {
        let upcall = self
            .dispatcher
            .bridge(DriverId::LIGHT, READING_SLOT, || self.start_reading())?;
        Ok(upcall.arg0 as u32)
    }
}
