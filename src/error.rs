//! Errors reported while setting up a coroutine stack.

use core::fmt;
use std::io;

/// Resource errors reported when a stack cannot be set up.
///
/// These are fatal to the bind attempt that produced them and are never
/// retried internally.
#[derive(Debug)]
pub enum Error {
    /// Mapping the stack region failed.
    Map(io::Error),
    /// Revoking access to the guard page failed.
    Protect(io::Error),
    /// The global allocator could not provide a heap stack.
    Alloc {
        /// Requested size in bytes.
        size: usize,
    },
    /// The requested size cannot hold the platform's signal stack.
    StackTooSmall {
        /// Requested size in bytes.
        size: usize,
        /// Smallest accepted size in bytes.
        min: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Map(e) => write!(f, "failed to map coroutine stack: {}", e),
            Error::Protect(e) => write!(f, "failed to protect stack guard page: {}", e),
            Error::Alloc { size } => write!(f, "failed to allocate {} byte heap stack", size),
            Error::StackTooSmall { size, min } => write!(
                f,
                "stack size {} is below the minimum of {} bytes",
                size, min
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Map(e) | Error::Protect(e) => Some(e),
            Error::Alloc { .. } | Error::StackTooSmall { .. } => None,
        }
    }
}

/// Result type for stack and bind operations.
pub type Result<T> = core::result::Result<T, Error>;
