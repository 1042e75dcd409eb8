// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// The error types used in this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// Out of memory.
    OutOfMemory,
    /// IO error.
    IoFailed,
    /// A component was asked to do something in the wrong state.
    BadState,
    /// Invalid arguments.
    InvalidArgs,
    /// The device is in read-only mode; the operation cannot proceed.
    ReadOnly,
    /// A journal block or entry failed validation during recovery.
    CorruptJournal,
    /// No physical space left for a new data block.
    OutOfSpace,
    /// The open chapter is full; the record cannot be added.
    VolumeOverflow,
    /// A lock could not be acquired or a lock pool is exhausted.
    LockFailed,
    /// The component is busy with a conflicting operation.
    ComponentBusy,
    /// An admin operation was issued in an incompatible admin state.
    InvalidAdminState,
    /// The device or thread configuration is unacceptable.
    BadConfiguration,
    /// No worker threads are configured for a required queue.
    NoThreads,
    /// The dedupe index did not answer within the advice timeout.
    Timeout,
    /// Not found.
    NotFound,
    /// Unsupported.
    Unsupported,
}

/// The error with an error type and an error message used in this crate.
#[derive(Clone, Debug)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    /// Creates a new error with the given error type and no error message.
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    /// Creates a new error with the given error type and the error message.
    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    /// Returns the error type.
    pub fn errno(&self) -> Errno {
        self.errno
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return core::result::Result::Err($crate::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno: expr, $msg: expr) => {
        return core::result::Result::Err($crate::Error::with_msg($errno, $msg))
    };
}
