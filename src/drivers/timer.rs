//! Timer Binding
//!
//! One alarm per process. Starting a new timer replaces the running one.

use crate::dispatch::{Dispatcher, Upcall};
use crate::syscall::{DriverId, Kernel, KernelResult};

/// Command opcodes
mod cmd {
    pub const ONESHOT: u32 = 0;
    pub const REPEATING: u32 = 1;
    pub const STOP: u32 = 2;
}

/// Subscribe slot for expiry.
pub const FIRED_SLOT: u32 = 0;

/// Timer (driver 3).
pub struct Timer<'d, 'a, K: Kernel> {
    dispatcher: &'d Dispatcher<'a, K>,
}

impl<'d, 'a, K: Kernel> Timer<'d, 'a, K> {
    pub fn new(dispatcher: &'d Dispatcher<'a, K>) -> Self {
        Self { dispatcher }
    }

    /// Install the expiry handler.
    pub fn on_fire<F>(&self, handler: F) -> KernelResult<()>
    where
        F: FnMut(Upcall) + 'a,
    {
        self.dispatcher.subscribe(DriverId::TIMER, FIRED_SLOT, handler)
    }

    /// Fire once after `ms` milliseconds.
    pub fn oneshot(&self, ms: u32) -> KernelResult<()> {
        self.dispatcher
            .command(DriverId::TIMER, cmd::ONESHOT, ms as usize)
            .map(|_| ())
    }

    /// Fire every `ms` milliseconds until stopped.
    pub fn start_repeating(&self, ms: u32) -> KernelResult<()> {
        self.dispatcher
            .command(DriverId::TIMER, cmd::REPEATING, ms as usize)
            .map(|_| ())
    }

    pub fn stop(&self) -> KernelResult<()> {
        self.dispatcher
            .command(DriverId::TIMER, cmd::STOP, 0)
            .map(|_| ())
    }

    /// Block for `ms` milliseconds.
    ///
    /// Other handlers keep running while this waits.
    pub fn delay_ms(&self, ms: u32) -> KernelResult<()> {
        self.dispatcher
            .bridge(DriverId::TIMER, FIRED_SLOT, || self.oneshot(ms))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeKernel, Syscall};
    use crate::KernelError;
    use core::cell::Cell;

    #[test]
    fn test_delay_runs_other_handlers() {
        let fake = FakeKernel::new();
        fake.fire_on_command(DriverId::TIMER, cmd::ONESHOT, FIRED_SLOT, Upcall::EMPTY);
        let presses = Cell::new(0);
        let dispatcher = Dispatcher::new(&fake);
        dispatcher
            .subscribe(DriverId::GPIO, 0, |_| presses.set(presses.get() + 1))
            .unwrap();
        fake.fire(DriverId::GPIO, 0, Upcall::EMPTY);

        Timer::new(&dispatcher).delay_ms(250).unwrap();

        assert_eq!(presses.get(), 1);
        assert_eq!(fake.count(|call| matches!(call, Syscall::Yield)), 2);
        assert!(fake.calls().contains(&Syscall::Command {
            driver: DriverId::TIMER,
            opcode: cmd::ONESHOT,
            data: 250,
        }));
    }

    #[test]
    fn test_delay_aborts_when_timer_busy() {
        let fake = FakeKernel::new();
        fake.fail_command(DriverId::TIMER, cmd::ONESHOT, KernelError::Busy);
        let dispatcher = Dispatcher::new(&fake);
        assert_eq!(Timer::new(&dispatcher).delay_ms(5), Err(KernelError::Busy));
        assert_eq!(fake.count(|call| matches!(call, Syscall::Yield)), 0);
    }

    #[test]
    fn test_repeating_handler() {
        let fake = FakeKernel::new();
        let ticks = Cell::new(0);
        let dispatcher = Dispatcher::new(&fake);
        let timer = Timer::new(&dispatcher);
        timer.on_fire(|_| ticks.set(ticks.get() + 1)).unwrap();
        timer.start_repeating(10).unwrap();
        for _ in 0..3 {
            fake.fire(DriverId::TIMER, FIRED_SLOT, Upcall::EMPTY);
            dispatcher.yield_now();
        }
        timer.stop().unwrap();
        assert_eq!(ticks.get(), 3);
    }
}
