//! GPIO Driver Binding
//!
//! Pins are addressed by number. Input configuration and interrupt
//! configuration pack several fields into the single command word:
//!
//! ```text
//! enable-input:     pull << 8 | pin
//! enable-interrupt: edge << 16 | pull << 8 | pin
//! ```
//!
//! # Interrupts
//! The kernel has one interrupt slot for the whole process, so a single
//! handler sees every pin. [`InterruptRoutes`] fans that one handler out by
//! pin number.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use log::trace;

use crate::dispatch::{Dispatcher, Upcall};
use crate::syscall::{DriverId, Kernel, KernelError, KernelResult};

/// Command opcodes
mod cmd {
    pub const ENABLE_OUTPUT: u32 = 0;
    pub const SET: u32 = 1;
    pub const CLEAR: u32 = 2;
    pub const TOGGLE: u32 = 3;
    pub const ENABLE_INPUT: u32 = 4;
    pub const READ: u32 = 5;
    pub const ENABLE_INTERRUPT: u32 = 6;
    pub const DISABLE_INTERRUPT: u32 = 7;
    pub const DISABLE: u32 = 8;
}

/// Subscribe slot for pin interrupts.
pub const INTERRUPT_SLOT: u32 = 0;

/// Highest pin number the command encoding can carry.
pub const MAX_PIN: u32 = 0xFF;

/// Input pull resistor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum PullMode {
    Up = 0,
    Down = 1,
    None = 2,
}

/// Which transitions raise an interrupt.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum EdgeMode {
    Change = 0,
    Rising = 1,
    Falling = 2,
}

/// A pin interrupt as delivered by the kernel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PinEvent {
    pub pin: u32,
    /// Level of the pin when the interrupt was taken.
    pub high: bool,
}

impl From<Upcall> for PinEvent {
    fn from(upcall: Upcall) -> Self {
        Self {
            pin: upcall.arg0 as u32,
            high: upcall.arg1 != 0,
        }
    }
}

/// Validate a pin number before it is packed into a command word.
fn check_pin(pin: u32) -> KernelResult<usize> {
    if pin > MAX_PIN {
        return Err(KernelError::Invalid);
    }
    Ok(pin as usize)
}

/// GPIO controller (driver 1).
pub struct Gpio<'d, 'a, K: Kernel> {
    dispatcher: &'d Dispatcher<'a, K>,
}

impl<'d, 'a, K: Kernel> Gpio<'d, 'a, K> {
    pub fn new(dispatcher: &'d Dispatcher<'a, K>) -> Self {
        Self { dispatcher }
    }

    fn pin_command(&self, opcode: u32, pin: u32) -> KernelResult<usize> {
        self.dispatcher.command(DriverId::GPIO, opcode, check_pin(pin)?)
    }

    /// Configure `pin` as an output.
    pub fn enable_output(&self, pin: u32) -> KernelResult<()> {
        self.pin_command(cmd::ENABLE_OUTPUT, pin).map(|_| ())
    }

    /// Drive `pin` high.
    pub fn set(&self, pin: u32) -> KernelResult<()> {
        self.pin_command(cmd::SET, pin).map(|_| ())
    }

    /// Drive `pin` low.
    pub fn clear(&self, pin: u32) -> KernelResult<()> {
        self.pin_command(cmd::CLEAR, pin).map(|_| ())
    }

    /// Invert the output level of `pin`.
    pub fn toggle(&self, pin: u32) -> KernelResult<()> {
        self.pin_command(cmd::TOGGLE, pin).map(|_| ())
    }

    /// Configure `pin` as an input with the given pull resistor.
    pub fn enable_input(&self, pin: u32, pull: PullMode) -> KernelResult<()> {
        let word = (pull as usize) << 8 | check_pin(pin)?;
        self.dispatcher
            .command(DriverId::GPIO, cmd::ENABLE_INPUT, word)
            .map(|_| ())
    }

    /// Sample the level of `pin`.
    pub fn read(&self, pin: u32) -> KernelResult<bool> {
        self.pin_command(cmd::READ, pin).map(|level| level != 0)
    }

    /// Arm the interrupt of an input pin with the given pull resistor.
    pub fn enable_interrupt(&self, pin: u32, pull: PullMode, edge: EdgeMode) -> KernelResult<()> {
        let word = (edge as usize) << 16 | (pull as usize) << 8 | check_pin(pin)?;
        self.dispatcher
            .command(DriverId::GPIO, cmd::ENABLE_INTERRUPT, word)
            .map(|_| ())
    }

    /// Stop interrupts from `pin`.
    pub fn disable_interrupt(&self, pin: u32) -> KernelResult<()> {
        self.pin_command(cmd::DISABLE_INTERRUPT, pin).map(|_| ())
    }

    /// Return `pin` to its reset state.
    pub fn disable(&self, pin: u32) -> KernelResult<()> {
        self.pin_command(cmd::DISABLE, pin).map(|_| ())
    }

    /// Install the process-wide interrupt handler.
    pub fn on_interrupt<F>(&self, mut handler: F) -> KernelResult<()>
    where
        F: FnMut(PinEvent) + 'a,
    {
        self.dispatcher
            .subscribe(DriverId::GPIO, INTERRUPT_SLOT, move |upcall| {
                handler(PinEvent::from(upcall))
            })
    }

    /// Install `routes` as the process-wide interrupt handler.
    pub fn route_interrupts(&self, mut routes: InterruptRoutes<'a>) -> KernelResult<()> {
        self.on_interrupt(move |event| {
            if !routes.dispatch(event) {
                trace!("gpio: interrupt on unrouted pin {}", event.pin);
            }
        })
    }
}

/// Per-pin interrupt handlers sharing the single interrupt slot.
#[derive(Default)]
pub struct InterruptRoutes<'a> {
    pins: BTreeMap<u32, Box<dyn FnMut(bool) + 'a>>,
    fallback: Option<Box<dyn FnMut(PinEvent) + 'a>>,
}

impl<'a> InterruptRoutes<'a> {
    pub fn new() -> Self {
        Self {
            pins: BTreeMap::new(),
            fallback: None,
        }
    }

    /// Run `handler` with the pin level for interrupts on `pin`.
    pub fn route<F>(mut self, pin: u32, handler: F) -> Self
    where
        F: FnMut(bool) + 'a,
    {
        self.pins.insert(pin, Box::new(handler));
        self
    }

    /// Run `handler` for pins without a route.
    pub fn fallback<F>(mut self, handler: F) -> Self
    where
        F: FnMut(PinEvent) + 'a,
    {
        self.fallback = Some(Box::new(handler));
        self
    }

    /// Hand `event` to its pin's handler.
    ///
    /// # Returns
    /// `false` if nothing handled it.
    pub fn dispatch(&mut self, event: PinEvent) -> bool {
        if let Some(handler) = self.pins.get_mut(&event.pin) {
            handler(event.high);
            return true;
        }
        match self.fallback.as_mut() {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }
}
