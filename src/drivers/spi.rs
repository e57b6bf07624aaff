//! SPI Master Binding
//!
//! A transfer clocks `len` bytes out of the write buffer (allow slot 1)
//! and, when a read buffer is lent (allow slot 0), the same number of bytes
//! into it. Completion arrives on subscribe slot 0.
//!
//! # Buffer Ownership
//! - Async transfers lend buffers until [`Spi::take_read_buffer`] /
//!   [`Spi::take_write_buffer`]
//! - Sync transfers lend for the duration of the call only

use crate::dispatch::{Dispatcher, Lent, Upcall};
use crate::syscall::{DriverId, Kernel, KernelError, KernelResult};

/// Command opcodes
mod cmd {
    pub const WRITE_BYTE: u32 = 0;
    pub const TRANSFER: u32 = 1;
    pub const SET_CHIP_SELECT: u32 = 2;
    pub const GET_CHIP_SELECT: u32 = 3;
    pub const SET_RATE: u32 = 4;
    pub const GET_RATE: u32 = 5;
    pub const SET_PHASE: u32 = 6;
    pub const GET_PHASE: u32 = 7;
    pub const SET_POLARITY: u32 = 8;
    pub const GET_POLARITY: u32 = 9;
    pub const HOLD_LOW: u32 = 10;
    pub const RELEASE_LOW: u32 = 11;
}

/// Allow slots
pub mod allow {
    pub const READ: u32 = 0;
    pub const WRITE: u32 = 1;
}

/// Subscribe slot for transfer completion.
pub const COMPLETION_SLOT: u32 = 0;

/// Clock phase.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Phase {
    /// Sample on the leading clock edge.
    SampleLeading = 0,
    /// Sample on the trailing clock edge.
    SampleTrailing = 1,
}

impl TryFrom<usize> for Phase {
    type Error = KernelError;

    fn try_from(raw: usize) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::SampleLeading),
            1 => Ok(Self::SampleTrailing),
            _ => Err(KernelError::Invalid),
        }
    }
}

/// Clock polarity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Polarity {
    /// Clock idles low.
    IdleLow = 0,
    /// Clock idles high.
    IdleHigh = 1,
}

impl TryFrom<usize> for Polarity {
    type Error = KernelError;

    fn try_from(raw: usize) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::IdleLow),
            1 => Ok(Self::IdleHigh),
            _ => Err(KernelError::Invalid),
        }
    }
}

/// SPI master (driver 4).
pub struct Spi<'d, 'a, K: Kernel> {
    dispatcher: &'d Dispatcher<'a, K>,
}

impl<'d, 'a, K: Kernel> Spi<'d, 'a, K> {
    pub fn new(dispatcher: &'d Dispatcher<'a, K>) -> Self {
        Self { dispatcher }
    }

    fn command(&self, opcode: u32, data: usize) -> KernelResult<usize> {
        self.dispatcher.command(DriverId::SPI, opcode, data)
    }

    // ---- configuration ----

    /// Clock out a single byte without a buffer.
    pub fn write_byte(&self, byte: u8) -> KernelResult<()> {
        self.command(cmd::WRITE_BYTE, byte as usize).map(|_| ())
    }

    pub fn set_chip_select(&self, cs: u32) -> KernelResult<()> {
        self.command(cmd::SET_CHIP_SELECT, cs as usize).map(|_| ())
    }

    pub fn chip_select(&self) -> KernelResult<u32> {
        self.command(cmd::GET_CHIP_SELECT, 0).map(|cs| cs as u32)
    }

    /// Request a clock rate in Hz.
    ///
    /// # Returns
    /// The rate the controller actually chose.
    pub fn set_rate(&self, hz: u32) -> KernelResult<u32> {
        self.command(cmd::SET_RATE, hz as usize).map(|rate| rate as u32)
    }

    pub fn rate(&self) -> KernelResult<u32> {
        self.command(cmd::GET_RATE, 0).map(|rate| rate as u32)
    }

    pub fn set_phase(&self, phase: Phase) -> KernelResult<()> {
        self.command(cmd::SET_PHASE, phase as usize).map(|_| ())
    }

    pub fn phase(&self) -> KernelResult<Phase> {
        Phase::try_from(self.command(cmd::GET_PHASE, 0)?)
    }

    pub fn set_polarity(&self, polarity: Polarity) -> KernelResult<()> {
        self.command(cmd::SET_POLARITY, polarity as usize).map(|_| ())
    }

    pub fn polarity(&self) -> KernelResult<Polarity> {
        Polarity::try_from(self.command(cmd::GET_POLARITY, 0)?)
    }

    /// Keep chip select asserted between transfers.
    pub fn hold_low(&self) -> KernelResult<()> {
        self.command(cmd::HOLD_LOW, 0).map(|_| ())
    }

    /// Deassert chip select after each transfer (the default).
    pub fn release_low(&self) -> KernelResult<()> {
        self.command(cmd::RELEASE_LOW, 0).map(|_| ())
    }

    // ---- async transfers ----

    /// Start writing `data`; `on_done` runs on completion.
    ///
    /// `data` stays lent until [`take_write_buffer`](Self::take_write_buffer).
    ///
    /// # Errors
    /// `Busy` while an earlier write buffer has not been reclaimed.
    pub fn write<F>(&self, data: &'a [u8], on_done: F) -> KernelResult<()>
    where
        F: FnMut(Upcall) + 'a,
    {
        if self.dispatcher.is_lent(DriverId::SPI, allow::WRITE) {
            return Err(KernelError::Busy);
        }
        let len = data.len();
        self.dispatcher.allow_readonly(DriverId::SPI, allow::WRITE, data)?;
        self.dispatcher.subscribe(DriverId::SPI, COMPLETION_SLOT, on_done)?;
        self.command(cmd::TRANSFER, len).map(|_| ())
    }

    /// Start a full-duplex transfer of `write.len()` bytes.
    ///
    /// # Errors
    /// - `Size` if `read` is shorter than `write`
    /// - `Busy` while a buffer of an earlier transfer has not been reclaimed
    pub fn read_write<F>(&self, write: &'a [u8], read: &'a mut [u8], on_done: F) -> KernelResult<()>
    where
        F: FnMut(Upcall) + 'a,
    {
        if read.len() < write.len() {
            return Err(KernelError::Size);
        }
        if self.dispatcher.is_lent(DriverId::SPI, allow::READ)
            || self.dispatcher.is_lent(DriverId::SPI, allow::WRITE)
        {
            return Err(KernelError::Busy);
        }
        let len = write.len();
        self.dispatcher.allow(DriverId::SPI, allow::READ, read)?;
        self.dispatcher.allow_readonly(DriverId::SPI, allow::WRITE, write)?;
        self.dispatcher.subscribe(DriverId::SPI, COMPLETION_SLOT, on_done)?;
        self.command(cmd::TRANSFER, len).map(|_| ())
    }

    /// Reclaim the read buffer of an async transfer.
    pub fn take_read_buffer(&self) -> KernelResult<Option<&'a mut [u8]>> {
        Ok(self
            .dispatcher
            .revoke(DriverId::SPI, allow::READ)?
            .and_then(Lent::into_mut))
    }

    /// Reclaim the write buffer of an async transfer.
    pub fn take_write_buffer(&self) -> KernelResult<Option<&'a [u8]>> {
        Ok(self
            .dispatcher
            .revoke(DriverId::SPI, allow::WRITE)?
            .map(Lent::into_ref))
    }

    // ---- sync transfers ----

    /// Write `data` and block until the transfer completes.
    pub fn write_sync(&self, data: &[u8]) -> KernelResult<()> {
        let _tx = self.dispatcher.lend_scoped(DriverId::SPI, allow::WRITE, data)?;
        self.dispatcher.bridge(DriverId::SPI, COMPLETION_SLOT, || {
            self.command(cmd::TRANSFER, data.len())
        })?;
        Ok(())
    }

    /// Full-duplex transfer of `write.len()` bytes; blocks until done.
    ///
    /// # Errors
    /// `Size` if `read` is shorter than `write`.
    pub fn read_write_sync(&self, write: &[u8], read: &mut [u8]) -> KernelResult<()> {
        if read.len() < write.len() {
            return Err(KernelError::Size);
        }
        let _rx = self
            .dispatcher
            .lend_scoped_mut(DriverId::SPI, allow::READ, read)?;
        let _tx = self.dispatcher.lend_scoped(DriverId::SPI, allow::WRITE, write)?;
        self.dispatcher.bridge(DriverId::SPI, COMPLETION_SLOT, || {
            self.command(cmd::TRANSFER, write.len())
        })?;
        Ok(())
    }
}
