// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-task call stacks for the tracing subsystem.
//!
//! A [`CallStack`] is a *logical* span stack tied to a task (or a registered
//! plain thread), distinct from the machine stack: when a worker switches
//! between tasks it switches the current call stack along, so spans opened
//! inside a task stay attached to that task across suspensions.
//!
//! This module is a thin layer over the [`tracing`] crate: frames are
//! `tracing` spans and events are `tracing` events, so the actual sinks are
//! whatever subscribers the embedding application installs.

use std::cell::{Cell, RefCell};
use std::fmt;
use tracing::{Level, Span};

/// The diagnostic severity of an [`emit`] event.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum EventLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A per-task (or per-thread) logical span stack.
pub struct CallStack {
    /// Open frames, root first. The task's root span is created eagerly so
    /// every event carries the task identity.
    frames: RefCell<Vec<Span>>,
    /// Whether the owner is currently suspended (parked or sleeping).
    blocked: Cell<bool>,
}

// Safety: a call stack is only ever touched by the thread its owner is
// currently bound to; workers switch call stacks only at dispatch boundaries.
unsafe impl Send for CallStack {}
// Safety: see above.
unsafe impl Sync for CallStack {}

// === impl CallStack ===

impl CallStack {
    /// Creates a call stack whose root span identifies a task.
    pub(crate) fn for_task(task_id: u64, label: Option<&str>) -> Self {
        let root = tracing::trace_span!("task", task.id = task_id, task.label = label);
        Self {
            frames: RefCell::new(vec![root]),
            blocked: Cell::new(false),
        }
    }

    /// Creates a call stack for a plain registered thread.
    pub(crate) fn for_thread(name: &str) -> Self {
        let root = tracing::trace_span!("thread", thread.name = name);
        Self {
            frames: RefCell::new(vec![root]),
            blocked: Cell::new(false),
        }
    }

    /// Pushes a new frame onto this call stack.
    pub fn push_span(&self, name: &str) {
        let mut frames = self.frames.borrow_mut();
        let parent = frames.last().and_then(Span::id);
        let span = tracing::trace_span!(parent: parent, "frame", frame.name = name);
        frames.push(span);
    }

    /// Pops the top frame.
    ///
    /// # Panics
    ///
    /// Panics if only the root frame is left; frame pushes and pops must be
    /// balanced.
    pub fn pop_span(&self) {
        let mut frames = self.frames.borrow_mut();
        assert!(frames.len() > 1, "call stack underflow");
        frames.pop();
    }

    /// Emits an event attached to the top frame.
    pub fn emit(&self, level: EventLevel, message: &str) {
        let frames = self.frames.borrow();
        let span = frames.last().expect("call stack always has a root");
        span.in_scope(|| match level {
            EventLevel::Trace => tracing::trace!("{message}"),
            EventLevel::Debug => tracing::debug!("{message}"),
            EventLevel::Info => tracing::info!("{message}"),
            EventLevel::Warn => tracing::warn!("{message}"),
            EventLevel::Error => tracing::error!("{message}"),
        });
    }

    /// Marks the owner suspended; `blocked` distinguishes waiting on an
    /// address from plain sleeping.
    pub(crate) fn suspend(&self, blocked: bool) {
        self.blocked.set(blocked);
    }

    /// Marks the owner runnable again.
    pub(crate) fn resume(&self) {
        self.blocked.set(false);
    }

    /// The number of open frames, the root included.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }
}

impl fmt::Debug for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStack")
            .field("depth", &self.depth())
            .field("blocked", &self.blocked.get())
            .finish()
    }
}

thread_local! {
    /// The call stack of whatever currently runs on this thread, switched by
    /// the worker at every dispatch boundary.
    static CURRENT_CALL_STACK: Cell<*const CallStack> = const { Cell::new(std::ptr::null()) };
}

/// Switches this thread's current call stack, returning the previous one.
pub(crate) fn switch_call_stack(stack: *const CallStack) -> *const CallStack {
    CURRENT_CALL_STACK.with(|cell| cell.replace(stack))
}

/// Runs `f` with the current call stack, if one is installed.
pub(crate) fn with_current<R>(f: impl FnOnce(&CallStack) -> R) -> Option<R> {
    CURRENT_CALL_STACK.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            None
        } else {
            // Safety: the installer guarantees the call stack outlives its
            // installation window (tasks outlive their dispatch).
            Some(f(unsafe { &*ptr }))
        }
    })
}

/// Pushes a span frame onto the current task's (or registered thread's) call
/// stack. No-op outside of one.
pub fn push_span(name: &str) {
    let _ = with_current(|cs| cs.push_span(name));
}

/// Pops the top span frame of the current call stack. No-op outside one.
pub fn pop_span() {
    let _ = with_current(|cs| cs.pop_span());
}

/// Emits an event on the current call stack, or as a bare `tracing` event if
/// none is installed.
pub fn emit(level: EventLevel, message: &str) {
    let emitted = with_current(|cs| cs.emit(level, message));
    if emitted.is_none() {
        match level {
            EventLevel::Trace => tracing::trace!("{message}"),
            EventLevel::Debug => tracing::debug!("{message}"),
            EventLevel::Info => tracing::info!("{message}"),
            EventLevel::Warn => tracing::warn!("{message}"),
            EventLevel::Error => tracing::error!("{message}"),
        }
    }
}

/// Registers the calling OS thread with the tracing subsystem, installing a
/// call stack for it. Returns the guard that unregisters it again.
pub fn register_thread(name: &str) -> ThreadRegistration {
    let stack = Box::new(CallStack::for_thread(name));
    let prev = switch_call_stack(&raw const *stack);
    ThreadRegistration { stack, prev }
}

/// Guard returned by [`register_thread`]; unregisters the thread on drop.
pub struct ThreadRegistration {
    stack: Box<CallStack>,
    prev: *const CallStack,
}

impl ThreadRegistration {
    /// The thread's call stack.
    #[must_use]
    pub fn call_stack(&self) -> &CallStack {
        &self.stack
    }
}

impl Drop for ThreadRegistration {
    fn drop(&mut self) {
        switch_call_stack(self.prev);
    }
}

impl fmt::Debug for ThreadRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRegistration")
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}

/// Asks the installed subscribers to flush buffered trace data.
///
/// The runtime buffers nothing itself; this is a hook for embedders whose
/// subscribers batch.
pub fn flush() {
    tracing::trace!("flush requested");
}

/// Spare mapping from [`EventLevel`] to `tracing`'s level type, for embedders
/// bridging the two.
impl From<EventLevel> for Level {
    fn from(level: EventLevel) -> Self {
        match level {
            EventLevel::Trace => Level::TRACE,
            EventLevel::Debug => Level::DEBUG,
            EventLevel::Info => Level::INFO,
            EventLevel::Warn => Level::WARN,
            EventLevel::Error => Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_balance() {
        let cs = CallStack::for_task(1, Some("test"));
        assert_eq!(cs.depth(), 1);

        cs.push_span("outer");
        cs.push_span("inner");
        assert_eq!(cs.depth(), 3);

        cs.pop_span();
        cs.pop_span();
        assert_eq!(cs.depth(), 1);
    }

    #[test]
    #[should_panic(expected = "call stack underflow")]
    fn popping_the_root_panics() {
        let cs = CallStack::for_task(2, None);
        cs.pop_span();
    }

    #[test]
    fn thread_registration_installs_current() {
        assert!(with_current(|_| ()).is_none());

        let reg = register_thread("test-thread");
        push_span("work");
        assert_eq!(reg.call_stack().depth(), 2);
        pop_span();

        drop(reg);
        assert!(with_current(|_| ()).is_none());
    }
}
