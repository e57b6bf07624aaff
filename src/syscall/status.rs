//! Syscall Return Status
//!
//! Every primitive returns one signed word. Non-negative values mean
//! success and may carry a result; negative values are kernel status codes.
//!
//! # Error Propagation
//! - Codes are passed through verbatim, never remapped or masked
//! - Codes this crate has no name for survive as [`KernelError::Other`]

use core::fmt;

/// Result of a decoded syscall.
pub type KernelResult<T> = Result<T, KernelError>;

/// Negative status codes reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Generic failure
    Fail,
    /// An operation is already outstanding on the resource
    Busy,
    /// The requested state is already active
    Already,
    /// The resource is powered off or unavailable
    Off,
    /// Reservation conflict
    Reserve,
    /// Invalid argument
    Invalid,
    /// Size out of range
    Size,
    /// Out of memory
    NoMem,
    /// Any other negative code, kept as-is
    Other(isize),
}

impl KernelError {
    /// Map a negative return word to its status.
    pub const fn from_code(code: isize) -> Self {
        match code {
            -1 => Self::Fail,
            -2 => Self::Busy,
            -3 => Self::Already,
            -4 => Self::Off,
            -5 => Self::Reserve,
            -6 => Self::Invalid,
            -7 => Self::Size,
            -9 => Self::NoMem,
            other => Self::Other(other),
        }
    }

    /// The raw kernel code.
    pub const fn code(self) -> isize {
        match self {
            Self::Fail => -1,
            Self::Busy => -2,
            Self::Already => -3,
            Self::Off => -4,
            Self::Reserve => -5,
            Self::Invalid => -6,
            Self::Size => -7,
            Self::NoMem => -9,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => write!(f, "generic failure"),
            Self::Busy => write!(f, "resource busy"),
            Self::Already => write!(f, "already active"),
            Self::Off => write!(f, "resource off"),
            Self::Reserve => write!(f, "reservation conflict"),
            Self::Invalid => write!(f, "invalid argument"),
            Self::Size => write!(f, "size out of range"),
            Self::NoMem => write!(f, "out of memory"),
            Self::Other(code) => write!(f, "kernel status {}", code),
        }
    }
}

/// Decode a raw return word.
///
/// # Returns
/// * `Ok(value)` - for any non-negative word
/// * `Err(KernelError)` - for negative words
#[inline]
pub fn decode(raw: isize) -> KernelResult<usize> {
    if raw >= 0 {
        Ok(raw as usize)
    } else {
        Err(KernelError::from_code(raw))
    }
}
