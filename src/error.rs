//! Error codes shared by every layer of the crate.

use std::fmt;
use std::io;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a storage or filesystem operation.
#[derive(Debug)]
pub enum Error {
    /// A path component or an index lookup found nothing.
    NotFound,
    /// The name to create is already taken.
    Exists,
    /// Bad argument: wrong node type, oversized name, out-of-range index.
    Invalid,
    /// The block allocator is exhausted.
    NoSpace,
    /// A block id lies beyond the container.
    Overflow,
    /// An allocation failed.
    OutOfMemory,
    /// The operation path is not implemented.
    NotSupported,
    /// The underlying container failed.
    Io(io::Error),
}

impl Error {
    /// Returns the closest matching errno value.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::Invalid => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::Overflow => libc::EOVERFLOW,
            Self::OutOfMemory => libc::ENOMEM,
            Self::NotSupported => libc::ENOSYS,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(fmt, "not found"),
            Self::Exists => write!(fmt, "already exists"),
            Self::Invalid => write!(fmt, "invalid argument"),
            Self::NoSpace => write!(fmt, "no space left in container"),
            Self::Overflow => write!(fmt, "block out of range"),
            Self::OutOfMemory => write!(fmt, "out of memory"),
            Self::NotSupported => write!(fmt, "not supported"),
            Self::Io(e) => write!(fmt, "{e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
