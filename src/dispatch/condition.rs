//! Condition flags for synchronous-over-asynchronous calls.
//!
//! There is no second thread to wake anyone up, so waiting is always
//! "check the flag, then yield" until an upcall sets it.

use core::cell::Cell;

use super::Upcall;

/// A caller-owned completion flag.
///
/// Exactly one outstanding operation may target a given condition. The
/// condition also keeps the arguments of the upcall that set it.
#[derive(Debug)]
pub struct Condition {
    fired: Cell<bool>,
    upcall: Cell<Upcall>,
}

impl Condition {
    /// Create an unset condition.
    pub const fn new() -> Self {
        Self {
            fired: Cell::new(false),
            upcall: Cell::new(Upcall::EMPTY),
        }
    }

    /// Check if the condition has been signalled.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.fired.get()
    }

    /// Record `upcall` and set the flag.
    pub fn signal(&self, upcall: Upcall) {
        self.upcall.set(upcall);
        self.fired.set(true);
    }

    /// Arguments of the signalling upcall, once set.
    pub fn upcall(&self) -> Option<Upcall> {
        if self.is_set() {
            Some(self.upcall.get())
        } else {
            None
        }
    }

    /// Clear the flag so the condition can be reused.
    pub fn reset(&self) {
        self.fired.set(false);
        self.upcall.set(Upcall::EMPTY);
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}
