// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Command buffers: batches of tasks with a shared join/cancel fate.
//!
//! A [`CommandBuffer`] collects task entries; [`Pool::enqueue`] dispatches
//! the whole batch as a unit and returns a [`JoinHandle`]. The tasks share
//! no memory by default but share fate: cancelling the buffer marks every
//! live task as cancellation-requested (observed cooperatively at suspension
//! points via [`task::cancel_requested`]), and `join` blocks until the
//! buffer's outstanding-task counter reaches zero.
//!
//! The counter's address doubles as the buffer's futex wait key, so joiners
//! park on the pool's futex and the scheduler wakes them when the last task
//! finishes.
//!
//! [`Pool::enqueue`]: crate::pool::Pool::enqueue
//! [`task::cancel_requested`]: crate::task::cancel_requested

use crate::pool::PoolInner;
use crate::task::{self, Task};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use weft_futex::WakeFilter;

/// Options for a single task in a command buffer.
#[derive(Debug, Default)]
pub struct TaskOptions {
    /// Pin the task to a specific worker instead of letting the pool place
    /// it.
    pub affinity: Option<usize>,
    /// Requested stack size; rounded up to the pool's matching size class.
    /// `None` uses the pool's default class.
    pub stack_size: Option<usize>,
    /// Free-form label for tracing.
    pub label: Option<String>,
}

pub(crate) struct TaskSpec {
    pub(crate) entry: Box<dyn FnOnce() + Send + 'static>,
    pub(crate) options: TaskOptions,
}

/// A batch of tasks submitted to a pool as one unit.
#[derive(Default)]
pub struct CommandBuffer {
    pub(crate) label: Option<String>,
    pub(crate) specs: Vec<TaskSpec>,
}

// === impl CommandBuffer ===

impl CommandBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty command buffer with space for `capacity` tasks.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            label: None,
            specs: Vec::with_capacity(capacity),
        }
    }

    /// Sets the buffer's tracing label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Adds a task running `f`.
    pub fn spawn(&mut self, f: impl FnOnce() + Send + 'static) -> &mut Self {
        self.spawn_with(TaskOptions::default(), f)
    }

    /// Adds a task pinned to the given worker.
    pub fn spawn_pinned(&mut self, worker: usize, f: impl FnOnce() + Send + 'static) -> &mut Self {
        self.spawn_with(
            TaskOptions {
                affinity: Some(worker),
                ..TaskOptions::default()
            },
            f,
        )
    }

    /// Adds a task with explicit options.
    pub fn spawn_with(
        &mut self,
        options: TaskOptions,
        f: impl FnOnce() + Send + 'static,
    ) -> &mut Self {
        self.specs.push(TaskSpec {
            entry: Box::new(f),
            options,
        });
        self
    }

    /// The number of tasks queued in this buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("label", &self.label)
            .field("tasks", &self.specs.len())
            .finish()
    }
}

/// The lifecycle status of a submitted command buffer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum CmdBufStatus {
    /// Tasks are pending or running.
    Running = 0,
    /// Cancellation was requested; tasks are draining.
    Cancelling = 1,
    /// All tasks finished after a cancellation request.
    Cancelled = 2,
    /// All tasks finished normally.
    Completed = 3,
}

impl CmdBufStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CmdBufStatus::Running,
            1 => CmdBufStatus::Cancelling,
            2 => CmdBufStatus::Cancelled,
            3 => CmdBufStatus::Completed,
            _ => unreachable!("invalid command buffer status"),
        }
    }
}

/// The shared state of a submitted command buffer.
pub(crate) struct CmdBufInner {
    label: Option<String>,
    /// Tasks not yet finished; the address of this counter is the buffer's
    /// futex wait key.
    outstanding: AtomicU64,
    status: AtomicU8,
    /// Whether any task finished with an error (abort or panic).
    any_error: AtomicBool,
    /// The task allocations, freed when the last task finishes.
    tasks: Mutex<Vec<NonNull<Task>>>,
    pool: Arc<PoolInner>,
}

// Safety: the task pointers are only touched by the enqueue path and the
// scheduler's finalize; everything else is atomics.
unsafe impl Send for CmdBufInner {}
// Safety: see above.
unsafe impl Sync for CmdBufInner {}

// === impl CmdBufInner ===

impl CmdBufInner {
    pub(crate) fn new(label: Option<String>, task_count: usize, pool: Arc<PoolInner>) -> Self {
        Self {
            label,
            outstanding: AtomicU64::new(task_count as u64),
            status: AtomicU8::new(CmdBufStatus::Running as u8),
            any_error: AtomicBool::new(false),
            tasks: Mutex::new(Vec::with_capacity(task_count)),
            pool,
        }
    }

    pub(crate) fn pool(&self) -> &Arc<PoolInner> {
        &self.pool
    }

    pub(crate) fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub(crate) fn register_task(&self, task: NonNull<Task>) {
        self.tasks.lock().unwrap().push(task);
    }

    pub(crate) fn status(&self) -> CmdBufStatus {
        CmdBufStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn is_cancelling(&self) -> bool {
        matches!(
            self.status(),
            CmdBufStatus::Cancelling | CmdBufStatus::Cancelled
        )
    }

    pub(crate) fn cancel(&self) {
        let _ = self.status.compare_exchange(
            CmdBufStatus::Running as u8,
            CmdBufStatus::Cancelling as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Marks the buffer completed immediately; used for empty buffers that
    /// never go through the scheduler.
    pub(crate) fn complete_empty(&self) {
        self.status
            .store(CmdBufStatus::Completed as u8, Ordering::Release);
    }

    /// Called by the scheduler when one of the buffer's tasks finished.
    /// Finalizes the buffer when it was the last one.
    pub(crate) fn task_finished(self: &Arc<Self>, is_error: bool) {
        if is_error {
            self.any_error.store(true, Ordering::Release);
        }

        if self.outstanding.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        // This was the last task: transition the status word, free the task
        // allocations, and wake joiners parked on the counter address.
        let status = if self.is_cancelling() {
            CmdBufStatus::Cancelled
        } else {
            CmdBufStatus::Completed
        };
        self.status.store(status as u8, Ordering::Release);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for ptr in tasks {
            // Safety: every task is finished (parked and queued tasks count
            // as outstanding), so nothing references the allocations anymore.
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }

        self.pool.futex().wake(
            std::ptr::from_ref::<AtomicU64>(&self.outstanding).cast(),
            usize::MAX,
            WakeFilter::Any,
        );

        self.pool.buffer_completed();
    }

    /// Blocks until the outstanding counter reaches zero.
    ///
    /// From inside a task of the same pool this parks the *task*; from any
    /// other thread (or a task of a different pool) it parks the calling OS
    /// thread on the buffer's pool futex.
    fn join_blocking(&self) {
        let addr = std::ptr::from_ref::<AtomicU64>(&self.outstanding).cast::<()>();

        let same_pool = task::with_current_task(|task| {
            Arc::ptr_eq(task.cmd_buf().pool(), &self.pool)
        })
        .unwrap_or(false);

        loop {
            let outstanding = self.outstanding.load(Ordering::Acquire);
            if outstanding == 0 {
                return;
            }

            if same_pool {
                // Safety: the counter lives as long as `self`.
                let _ = unsafe { task::wait(addr, 8, outstanding, None) };
            } else {
                // Safety: as above.
                let _ = unsafe {
                    self.pool
                        .futex()
                        .wait(addr, 8, outstanding, 0, None)
                };
            }
        }
    }
}

impl fmt::Debug for CmdBufInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdBufInner")
            .field("label", &self.label)
            .field("outstanding", &self.outstanding())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// A handle to a submitted command buffer.
///
/// Dropping the handle without joining *detaches* the buffer: ownership
/// transfers to the pool, which still waits for its completion before
/// shutting down.
pub struct JoinHandle {
    inner: Arc<CmdBufInner>,
}

// === impl JoinHandle ===

impl JoinHandle {
    pub(crate) fn new(inner: Arc<CmdBufInner>) -> Self {
        Self { inner }
    }

    /// Blocks until every task of the buffer has finished, returning the
    /// buffer's final status.
    pub fn join(self) -> CmdBufStatus {
        self.inner.join_blocking();
        self.inner.status()
    }

    /// Releases the handle, transferring ownership of the buffer to the
    /// pool.
    pub fn detach(self) {
        drop(self);
    }

    /// Requests cooperative cancellation: every live task observes
    /// [`task::cancel_requested`] at its next suspension point. Running
    /// tasks are not interrupted.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Cancels the buffer and detaches the handle.
    pub fn cancel_detach(self) {
        self.inner.cancel();
        drop(self);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelling()
    }

    /// Whether every task of the buffer has finished.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.outstanding() == 0
    }

    /// Whether any task of the buffer aborted or panicked.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.inner.any_error.load(Ordering::Acquire)
    }

    /// The buffer's tracing label.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.inner.label()
    }
}

impl fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("inner", &self.inner)
            .finish()
    }
}
