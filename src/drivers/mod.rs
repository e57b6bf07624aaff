//! Driver bindings for PantherOS
//!
//! Each binding is a thin typed view over a [`Dispatcher`](crate::Dispatcher):
//! one method per command, allow slot or subscribe slot of one kernel driver.
//!
//! All bindings follow these rules:
//! - Arguments are validated before trapping where possible (`Invalid` or
//!   `Size` come back without a syscall)
//! - Kernel status codes are returned as-is
//! - `*_sync` methods block through the condition bridge and abort on the
//!   first failing step without yielding
//! - A `*_sync` call replaces whatever handler the application had on the
//!   completion slot

pub mod console;
pub mod gpio;
pub mod light;
pub mod serial;
pub mod spi;
pub mod timer;

pub use console::Console;
pub use gpio::{EdgeMode, Gpio, InterruptRoutes, PinEvent, PullMode};
pub use light::Light;
pub use serial::{Serial, SerialEvent};
pub use spi::{Phase, Polarity, Spi};
pub use timer::Timer;
