//! Error taxonomy shared by every layer of the filesystem.

use core::fmt;

/// Result type returned by every fallible filesystem operation.
pub type FsResult<T> = Result<T, FsError>;

/// The closed set of error kinds the core can report.
///
/// Internal invariant violations (an open count going negative, a
/// deny-write count exceeding the open count, a corrupt on-disk magic
/// number) are not represented here: they are programming errors and are
/// asserted instead, never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path resolution or name lookup found nothing.
    NotFound,
    /// Empty or over-length name, duplicate name, or a write that would
    /// grow a file past the maximum representable size.
    InvalidArgument,
    /// `remove` refused: directory not empty, is the root, or has other
    /// openers.
    Busy,
    /// The free-space allocator has no sectors left.
    NoSpace,
    /// A handle or entry allocation failed.
    NoMemory,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "no such file or directory"),
            FsError::InvalidArgument => write!(f, "invalid argument"),
            FsError::Busy => write!(f, "resource busy"),
            FsError::NoSpace => write!(f, "no space left on device"),
            FsError::NoMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for FsError {}
