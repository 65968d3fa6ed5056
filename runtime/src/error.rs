// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use weft_fiber::StackAllocError;

/// The error type shared by all weft runtime operations.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Error {
    /// A pool or command buffer configuration violates its constraints. No
    /// side effects have taken place.
    InvalidConfig(&'static str),
    /// The allocator (or stack pool) could not satisfy a request.
    OutOfMemory,
    /// The channel or pool is shutting down.
    Closed,
    /// A deadline elapsed in a wait or sleep.
    Timeout,
    /// A futex expected-value check failed; the caller should re-examine its
    /// state and retry.
    Invalid,
    /// The operation requires a different handle kind.
    NotPermitted,
    /// A lookup by name or id found nothing.
    NotFound,
    /// The implemented ABI version does not satisfy the required one.
    VersionNotSupported,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfig(what) => write!(f, "invalid configuration: {what}"),
            Error::OutOfMemory => f.write_str("out of memory"),
            Error::Closed => f.write_str("closed"),
            Error::Timeout => f.write_str("deadline elapsed"),
            Error::Invalid => f.write_str("expected value check failed"),
            Error::NotPermitted => f.write_str("operation not permitted for this handle"),
            Error::NotFound => f.write_str("not found"),
            Error::VersionNotSupported => f.write_str("version not supported"),
        }
    }
}

impl core::error::Error for Error {}

impl From<StackAllocError> for Error {
    fn from(err: StackAllocError) -> Self {
        match err {
            StackAllocError::Exhausted | StackAllocError::Os(_) => Error::OutOfMemory,
            StackAllocError::TooLarge => Error::InvalidConfig("requested stack size too large"),
        }
    }
}

impl From<weft_futex::WaitError> for Error {
    fn from(err: weft_futex::WaitError) -> Self {
        match err {
            weft_futex::WaitError::KeyError => Error::InvalidConfig("invalid futex key"),
            weft_futex::WaitError::Invalid => Error::Invalid,
            weft_futex::WaitError::Timeout => Error::Timeout,
        }
    }
}
