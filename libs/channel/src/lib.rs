// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The lock-free channel family used by the weft task runtime.
//!
//! Three channel shapes are provided, each fixed in its producer/consumer
//! cardinality:
//!
//! - [`mpsc`] — an *intrusive* multi-producer, single-consumer channel. The
//!   link pointer lives inside the element itself, so the channel never
//!   allocates; the scheduler uses it to hand tasks to a worker.
//! - [`spmc`] — a bounded single-producer, multi-consumer channel backed by a
//!   power-of-two *sum tree* of occupancy counters, used for fan-out of ready
//!   work to many workers.
//! - [`unbounded`] — an unbounded SPMC built by chaining bounded channels and
//!   atomically swapping the active one on overflow.
//!
//! Blocking receives park on a [`weft_futex::Futex`] keyed on the channel's
//! state word, so a pool's channels all share the pool's futex. The
//! [`select`] module combines several receivers into one blocking receive
//! over all of them.

pub mod mpsc;
pub mod select;
pub mod spmc;
pub mod unbounded;

use std::fmt;

/// Error returned by `try_send`.
#[derive(Debug, Eq, PartialEq)]
pub enum TrySendError<T> {
    /// The channel is at capacity; the element is handed back.
    Full(T),
    /// The channel is closed; the element is handed back.
    Closed(T),
}

impl<T> TrySendError<T> {
    /// The element that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(inner) | TrySendError::Closed(inner) => inner,
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("channel full"),
            TrySendError::Closed(_) => f.write_str("channel closed"),
        }
    }
}

/// Error returned by `send`: the channel is closed, the element is handed
/// back.
#[derive(Debug, Eq, PartialEq)]
pub struct SendError<T>(pub T);

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("channel closed")
    }
}

/// Error returned by `try_recv`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TryRecvError {
    /// No element is currently queued.
    Empty,
    /// The channel is closed and fully drained.
    Closed,
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => f.write_str("channel empty"),
            TryRecvError::Closed => f.write_str("channel closed"),
        }
    }
}

impl core::error::Error for TryRecvError {}

/// Error returned by blocking `recv`: the channel is closed and drained.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Closed;

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl core::error::Error for Closed {}

/// Error returned by `recv_until`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RecvTimeoutError {
    /// The deadline elapsed with no element arriving.
    Timeout,
    /// The channel is closed and fully drained.
    Closed,
}

impl fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvTimeoutError::Timeout => f.write_str("deadline elapsed"),
            RecvTimeoutError::Closed => f.write_str("channel closed"),
        }
    }
}

impl core::error::Error for RecvTimeoutError {}
