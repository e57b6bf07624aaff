//! Log and print output
//!
//! Backend for the `log` facade plus the [`uprint!`] / [`uprintln!`]
//! macros. Text goes to a sink function the application installs, usually
//! one that writes to the console driver.
//!
//! # Reentrancy
//! A sink that itself logs (the console binding traces its syscalls) would
//! recurse forever, so output produced while the sink runs is dropped.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Where formatted text ends up.
pub type Sink = fn(&str);

static SINK: Mutex<Option<Sink>> = Mutex::new(None);

/// Set while the sink runs.
static IN_SINK: AtomicBool = AtomicBool::new(false);

static LOGGER: UserLogger = UserLogger;

/// Install the output sink. Replaces any previous one.
pub fn set_sink(sink: Sink) {
    *SINK.lock() = Some(sink);
}

/// Register the `log` backend and set the maximum level.
///
/// # Errors
/// Fails if another logger was registered first.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Forwards formatted pieces to the sink.
struct SinkWriter(Sink);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

/// Format `args` into the sink.
///
/// Used by the print macros; not meant to be called directly.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    // Copy the sink out so it runs without the lock held
    let Some(sink) = *SINK.lock() else {
        return;
    };
    if IN_SINK.swap(true, Ordering::Acquire) {
        return;
    }
    let _ = SinkWriter(sink).write_fmt(args);
    IN_SINK.store(false, Ordering::Release);
}

struct UserLogger;

impl Log for UserLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            _print(format_args!(
                "[{}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Print to the installed sink
#[macro_export]
macro_rules! uprint {
    ($($arg:tt)*) => {
        $crate::logger::_print(format_args!($($arg)*))
    };
}

/// Print to the installed sink, with a newline
#[macro_export]
macro_rules! uprintln {
    () => {
        $crate::uprint!("\n")
    };
    ($($arg:tt)*) => {{
        $crate::uprint!($($arg)*);
        $crate::uprint!("\n");
    }};
}
