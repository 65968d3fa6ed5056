// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker pool.
//!
//! A [`Pool`] owns its worker threads, the pool-wide ready queue, the futex
//! wait table, the timer wheel, and a dedicated *scheduler* thread. The
//! scheduler thread is the single consumer of the pool-wide message channel:
//! workers forward completion, sleep, and wait records there, and the
//! enqueue path routes new unpinned tasks through it so the ready queue has
//! exactly one producer.
//!
//! Shutdown runs in a fixed order: wait for every submitted command buffer
//! (detached ones included) to complete, close the scheduler channel and
//! join the scheduler (closing the ready queue with it), close each worker's
//! private queue, join the workers, then tear down the timer wheel.

use crate::cmd_buf::{CmdBufInner, CommandBuffer, JoinHandle};
use crate::error::Error;
use crate::task::{SchedMessage, Task, TaskId, TaskRef};
use crate::timer::{self, Timer, TimerKind};
use crate::trace;
use crate::worker::Worker;
use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use weft_channel::{RecvTimeoutError, mpsc, unbounded};
use weft_fiber::{StackClass, StackPool};
use weft_futex::{Futex, RawWaiter, RawWaiterVTable, WaitError, WakeFilter};

/// One stack size class of a pool, see [`PoolConfig::stacks`].
#[derive(Debug, Clone, Copy)]
pub struct PoolStackConfig {
    pub class: StackClass,
    /// Whether tasks without an explicit stack size use this class.
    pub default: bool,
}

/// Configuration for [`Pool::new`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Free-form name used in tracing output.
    pub label: Option<String>,
    /// Number of worker threads; `0` means one per CPU.
    pub worker_count: usize,
    /// Stack size classes; exactly one must be flagged as the default.
    pub stacks: Vec<PoolStackConfig>,
    /// Default inline capacity of command buffers created through
    /// [`Pool::command_buffer`].
    pub cmd_buf_capacity: usize,
    /// Load factor cap of the pool's futex table; exceeding it triggers a
    /// rehash.
    pub max_load_factor: usize,
    /// Whether the pool appears in a context's pool query.
    pub is_queryable: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            label: None,
            worker_count: 0,
            stacks: vec![PoolStackConfig {
                class: StackClass::with_size(256 * 1024),
                default: true,
            }],
            cmd_buf_capacity: 16,
            max_load_factor: Futex::DEFAULT_MAX_LOAD_FACTOR,
            is_queryable: true,
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.stacks.is_empty() {
            return Err(Error::InvalidConfig("no stack size classes configured"));
        }
        if self.stacks.iter().filter(|s| s.default).count() != 1 {
            return Err(Error::InvalidConfig(
                "exactly one stack class must be the default",
            ));
        }
        if self.max_load_factor == 0 {
            return Err(Error::InvalidConfig("max_load_factor must be non-zero"));
        }
        if self.worker_count > 4096 {
            return Err(Error::InvalidConfig("worker_count out of range"));
        }
        Ok(())
    }
}

pub(crate) struct PoolInner {
    label: Option<String>,
    futex: Arc<Futex>,
    stack_pool: StackPool,
    worker_count: usize,
    /// Senders for each worker's private queue.
    local_txs: Vec<mpsc::Sender<Task>>,
    /// Producer side of the scheduler message channel.
    sched_tx: mpsc::Sender<Task>,
    timer: Timer,
    next_task_id: AtomicU64,
    /// Command buffers submitted and not yet completed; its address is the
    /// futex key pool teardown waits on.
    live_buffers: AtomicU64,
    /// Live [`Pool`] handles; the last one to drop tears the pool down.
    handles: AtomicUsize,
    shutdown: AtomicBool,
    cmd_buf_capacity: usize,
    is_queryable: bool,
    sched_thread: Mutex<Option<thread::JoinHandle<()>>>,
    worker_threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

// === impl PoolInner ===

impl PoolInner {
    #[inline]
    pub(crate) fn futex(&self) -> &Arc<Futex> {
        &self.futex
    }

    #[inline]
    pub(crate) fn worker_count(&self) -> usize {
        self.worker_count
    }

    #[inline]
    pub(crate) fn local_sender(&self, worker: usize) -> &mpsc::Sender<Task> {
        &self.local_txs[worker]
    }

    #[inline]
    pub(crate) fn sched_sender(&self) -> &mpsc::Sender<Task> {
        &self.sched_tx
    }

    pub(crate) fn install_on_worker_thread(self: &Arc<Self>) {
        CURRENT_POOL.with(|cell| *cell.borrow_mut() = Some(Arc::clone(self)));
    }

    /// Hands a previously parked (or woken) task back to its bound worker.
    pub(crate) fn requeue(&self, task_ref: TaskRef) {
        // Safety: parked tasks are live.
        let worker = unsafe { task_ref.get() }
            .bound_worker()
            .expect("a parked task must be bound to a worker");
        self.local_txs[worker]
            .send(task_ref)
            .expect("worker queue closed with live tasks");
    }

    /// Called by a command buffer when its last task finished.
    pub(crate) fn buffer_completed(&self) {
        if self.live_buffers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.futex.wake(
                std::ptr::from_ref::<AtomicU64>(&self.live_buffers).cast(),
                usize::MAX,
                WakeFilter::Any,
            );
        }
    }
}

impl fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("label", &self.label)
            .field("worker_count", &self.worker_count)
            .field("live_buffers", &self.live_buffers.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

thread_local! {
    static CURRENT_POOL: RefCell<Option<Arc<PoolInner>>> = const { RefCell::new(None) };
}

/// The pool whose worker is executing the calling thread, if any.
#[must_use]
pub fn current_pool() -> Option<Pool> {
    CURRENT_POOL.with(|cell| {
        cell.borrow().as_ref().map(|inner| {
            inner.handles.fetch_add(1, Ordering::Relaxed);
            Pool {
                inner: Arc::clone(inner),
            }
        })
    })
}

/// A handle to a worker pool.
///
/// Handles are cheap to clone; when the last one goes away the pool shuts
/// down, implicitly joining all outstanding command buffers first.
pub struct Pool {
    inner: Arc<PoolInner>,
}

static_assertions::assert_impl_all!(Pool: Send, Sync);

// === impl Pool ===

impl Pool {
    /// Creates a pool and starts its worker and scheduler threads.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for a bad configuration,
    /// [`Error::OutOfMemory`] if stack preallocation fails.
    pub fn new(config: PoolConfig) -> Result<Self, Error> {
        config.validate()?;

        let worker_count = if config.worker_count == 0 {
            thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            config.worker_count
        };

        let default_size = config
            .stacks
            .iter()
            .find(|s| s.default)
            .expect("validated above")
            .class
            .size;
        let stack_pool = StackPool::new(
            config.stacks.iter().map(|s| s.class),
            default_size,
        )?;

        let futex = Arc::new(Futex::with_settings(
            Futex::DEFAULT_BUCKETS,
            config.max_load_factor,
        ));

        let (sched_tx, sched_rx) = mpsc::channel::<Task>(Arc::clone(&futex));
        let (global_tx, global_rx) = unbounded::channel::<TaskRef>(Arc::clone(&futex));

        let mut local_txs = Vec::with_capacity(worker_count);
        let mut local_rxs = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::channel::<Task>(Arc::clone(&futex));
            local_txs.push(tx);
            local_rxs.push(rx);
        }

        let inner = Arc::new(PoolInner {
            label: config.label,
            futex,
            stack_pool,
            worker_count,
            local_txs,
            sched_tx,
            timer: Timer::new(Instant::now()),
            next_task_id: AtomicU64::new(1),
            live_buffers: AtomicU64::new(0),
            handles: AtomicUsize::new(1),
            shutdown: AtomicBool::new(false),
            cmd_buf_capacity: config.cmd_buf_capacity,
            is_queryable: config.is_queryable,
            sched_thread: Mutex::new(None),
            worker_threads: Mutex::new(Vec::new()),
        });

        let sched_thread = thread::Builder::new()
            .name("weft-scheduler".into())
            .spawn({
                let pool = Arc::clone(&inner);
                move || scheduler_loop(&pool, &sched_rx, &global_tx)
            })
            .map_err(|_| Error::OutOfMemory)?;
        *inner.sched_thread.lock().unwrap() = Some(sched_thread);

        let mut worker_threads = Vec::with_capacity(worker_count);
        for (index, local_rx) in local_rxs.into_iter().enumerate() {
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{index}"))
                .spawn({
                    let pool = Arc::clone(&inner);
                    let global_rx = global_rx.clone();
                    move || Worker::new(index, pool, local_rx, global_rx).run()
                })
                .map_err(|_| Error::OutOfMemory)?;
            worker_threads.push(handle);
        }
        *inner.worker_threads.lock().unwrap() = worker_threads;

        Ok(Self { inner })
    }

    /// The pool's tracing label.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// The number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    /// Whether the pool appears in a context's pool query.
    #[must_use]
    pub fn is_queryable(&self) -> bool {
        self.inner.is_queryable
    }

    /// The pool's futex. Synchronization primitives built on top of the
    /// runtime key their waits on this table so that parked tasks and parked
    /// threads interoperate.
    #[must_use]
    pub fn futex(&self) -> &Futex {
        &self.inner.futex
    }

    /// Creates an empty command buffer with the pool's configured default
    /// capacity.
    #[must_use]
    pub fn command_buffer(&self) -> CommandBuffer {
        CommandBuffer::with_capacity(self.inner.cmd_buf_capacity)
    }

    /// Submits a command buffer: allocates a task (descriptor, stack,
    /// context) for every entry and dispatches the batch as a unit.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] when the pool is shutting down,
    /// [`Error::InvalidConfig`] for an out-of-range affinity,
    /// [`Error::OutOfMemory`] when stack allocation fails (no tasks are
    /// dispatched in that case).
    pub fn enqueue(&self, buffer: CommandBuffer) -> Result<JoinHandle, Error> {
        let inner = &self.inner;

        if inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        for spec in &buffer.specs {
            if let Some(worker) = spec.options.affinity
                && worker >= inner.worker_count
            {
                return Err(Error::InvalidConfig("task affinity out of range"));
            }
        }

        let buf = Arc::new(CmdBufInner::new(
            buffer.label,
            buffer.specs.len(),
            Arc::clone(inner),
        ));

        if buffer.specs.is_empty() {
            buf.complete_empty();
            return Ok(JoinHandle::new(buf));
        }

        // Allocate everything up front so a failure mid-way dispatches
        // nothing.
        let mut created: Vec<(NonNull<Task>, Option<usize>)> =
            Vec::with_capacity(buffer.specs.len());
        for spec in buffer.specs {
            let stack = match spec.options.stack_size {
                Some(size) => inner.stack_pool.allocate(size),
                None => inner.stack_pool.allocate_default(),
            };
            let stack = match stack {
                Ok(stack) => stack,
                Err(err) => {
                    for (ptr, _) in created {
                        // Safety: never dispatched; we are the only owner.
                        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
                    }
                    return Err(err.into());
                }
            };

            let id = TaskId::from_u64(inner.next_task_id.fetch_add(1, Ordering::Relaxed));
            let task = Task::new(
                id,
                Arc::clone(&buf),
                spec.options.affinity,
                stack,
                spec.entry,
                spec.options.label.as_deref(),
            );
            created.push((NonNull::from(Box::leak(task)), spec.options.affinity));
        }

        inner.live_buffers.fetch_add(1, Ordering::AcqRel);

        for (ptr, affinity) in created {
            buf.register_task(ptr);
            let task_ref = TaskRef::new(ptr);
            match affinity {
                // pinned tasks go straight to their worker's private queue
                Some(worker) => inner.local_txs[worker]
                    .send(task_ref)
                    .expect("enqueue raced pool shutdown"),
                // unpinned tasks reach the ready queue through the scheduler,
                // its single producer
                None => {
                    // Safety: freshly created tasks are live.
                    unsafe { task_ref.get() }.set_sched_msg(SchedMessage::NewTask);
                    inner
                        .sched_tx
                        .send(task_ref)
                        .expect("enqueue raced pool shutdown");
                }
            }
        }

        Ok(JoinHandle::new(buf))
    }
}

impl Clone for Pool {
    fn clone(&self) -> Self {
        self.inner.handles.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.inner.handles.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        shutdown_and_join(&self.inner);
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

/// Tears the pool down: waits for all submitted command buffers, then stops
/// the scheduler and the workers in order.
fn shutdown_and_join(inner: &Arc<PoolInner>) {
    let on_own_worker = CURRENT_POOL
        .with(|cell| cell.borrow().as_ref().is_some_and(|p| Arc::ptr_eq(p, inner)));
    assert!(
        !on_own_worker,
        "cannot tear down a pool from one of its own workers"
    );

    if inner.shutdown.swap(true, Ordering::AcqRel) {
        return;
    }

    // Outstanding work completes before destruction, detached buffers
    // included.
    let addr = std::ptr::from_ref::<AtomicU64>(&inner.live_buffers).cast::<()>();
    loop {
        let live = inner.live_buffers.load(Ordering::Acquire);
        if live == 0 {
            break;
        }
        // Safety: the counter outlives the wait; spurious and Invalid
        // returns just re-check.
        let _ = unsafe { inner.futex.wait(addr, 8, live, 0, None) };
    }

    // Stop the scheduler; its exit closes the global ready queue.
    inner.sched_tx.close();
    if let Some(handle) = inner.sched_thread.lock().unwrap().take() {
        let _ = handle.join();
    }

    // Now drain the workers.
    for tx in &inner.local_txs {
        tx.close();
    }
    for handle in inner.worker_threads.lock().unwrap().drain(..) {
        let _ = handle.join();
    }

    inner.timer.drain();
}

/// The wakeup vtable the scheduler registers for parked tasks: `data` is the
/// task pointer, waking requeues it on its bound worker.
unsafe fn wake_parked_task(data: *const ()) {
    // Safety: the scheduler registered a live parked task; parked tasks keep
    // their command buffer outstanding, so the pool is live too.
    let task = unsafe { &*data.cast::<Task>() };
    let pool = Arc::clone(task.cmd_buf().pool());
    pool.requeue(TaskRef::new(NonNull::from(task)));
}

static TASK_WAITER_VTABLE: RawWaiterVTable = RawWaiterVTable::new(wake_parked_task);

/// The pool's message loop, run by the dedicated scheduler thread: the
/// single consumer of the pool MPSC and the single producer of the ready
/// queue.
fn scheduler_loop(
    pool: &Arc<PoolInner>,
    sched_rx: &mpsc::Receiver<Task>,
    global_tx: &unbounded::Sender<TaskRef>,
) {
    let _span = tracing::debug_span!("scheduler loop", pool = ?pool.label).entered();
    let _registration = trace::register_thread("scheduler");

    loop {
        // Deliver expirations before blocking again.
        let (expired, next_deadline) = pool.timer.advance();
        for entry in expired {
            fire_timer_entry(pool, &entry);
        }

        let msg = match next_deadline {
            Some(deadline) => sched_rx.recv_until(deadline),
            None => sched_rx.recv().map_err(|_| RecvTimeoutError::Closed),
        };

        match msg {
            Ok(task_ref) => handle_message(pool, global_tx, task_ref),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Closed) => break,
        }
    }

    tracing::debug!("scheduler channel closed, shutting down");
    // dropping `global_tx` on return closes the ready queue
}

fn handle_message(pool: &Arc<PoolInner>, global_tx: &unbounded::Sender<TaskRef>, task_ref: TaskRef) {
    // Safety: queued tasks are live.
    let task = unsafe { task_ref.get() };

    match task.take_sched_msg() {
        SchedMessage::NewTask => {
            debug_assert!(task.affinity().is_none(), "pinned tasks bypass the scheduler");
            global_tx
                .send(task_ref)
                .expect("ready queue closed while the scheduler runs");
        }
        SchedMessage::Complete { is_error } => {
            tracing::trace!(task.id = task.id().as_u64(), is_error, "task finished");
            let buf = Arc::clone(task.cmd_buf());
            // may free the task (and the whole buffer), so `task` must not be
            // touched afterwards
            buf.task_finished(is_error);
        }
        SchedMessage::Sleep { deadline } => {
            pool.timer.insert(deadline, TimerKind::Sleep, task_ref);
        }
        SchedMessage::Wait {
            addr,
            size,
            expected,
            deadline,
        } => {
            let waiter = RawWaiter::new(
                task_ref.as_ptr().as_ptr().cast_const().cast(),
                &TASK_WAITER_VTABLE,
            );
            // Safety: the waiting task validated the key; the task pointer
            // stays valid while the task is parked.
            match unsafe { pool.futex.wait_raw(addr as *const (), size, expected, 0, waiter) } {
                Ok(id) => {
                    if let Some(deadline) = deadline {
                        pool.timer.insert(deadline, TimerKind::Wait { id }, task_ref);
                    }
                }
                Err(WaitError::Invalid) => {
                    // the expected value is already gone; no spurious park
                    task.set_timed_out(false);
                    pool.requeue(task_ref);
                }
                Err(WaitError::KeyError | WaitError::Timeout) => {
                    unreachable!("key was validated at the wait call site")
                }
            }
        }
        SchedMessage::None => unreachable!("task reached the scheduler without a message"),
    }
}

fn fire_timer_entry(pool: &Arc<PoolInner>, entry: &timer::Entry) {
    match entry.kind {
        TimerKind::Sleep => pool.requeue(entry.task),
        TimerKind::Wait { id } => {
            // Cancel the futex entry; when the task was already woken the
            // timer loses the race and this is a no-op.
            if let Some(waiter) = pool.futex.cancel(id) {
                // Safety: cancellation succeeded, so the task is still parked
                // and live.
                let task = unsafe { &*waiter.data().cast::<Task>() };
                task.set_timed_out(true);
                pool.requeue(TaskRef::new(NonNull::from(task)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task;
    use std::sync::atomic::AtomicUsize;

    fn small_pool(workers: usize) -> Pool {
        Pool::new(PoolConfig {
            worker_count: workers,
            stacks: vec![PoolStackConfig {
                class: StackClass::with_size(64 * 1024),
                default: true,
            }],
            ..PoolConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn empty_buffer_completes_immediately() {
        let pool = small_pool(1);
        let handle = pool.enqueue(CommandBuffer::new()).unwrap();
        assert!(handle.is_completed());
        assert_eq!(handle.join(), crate::CmdBufStatus::Completed);
    }

    #[test]
    fn single_task_runs() {
        let pool = small_pool(1);
        let ran = Arc::new(AtomicBool::new(false));

        let mut buf = pool.command_buffer();
        buf.spawn({
            let ran = Arc::clone(&ran);
            move || ran.store(true, Ordering::Release)
        });

        pool.enqueue(buf).unwrap().join();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn tasks_fan_out_over_workers() {
        let pool = small_pool(4);
        let count = Arc::new(AtomicUsize::new(0));

        let mut buf = pool.command_buffer();
        for _ in 0..64 {
            let count = Arc::clone(&count);
            buf.spawn(move || {
                task::yield_now();
                count.fetch_add(1, Ordering::AcqRel);
            });
        }

        pool.enqueue(buf).unwrap().join();
        assert_eq!(count.load(Ordering::Acquire), 64);
    }

    #[test]
    fn pinned_tasks_run_on_their_worker() {
        let pool = small_pool(3);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut buf = pool.command_buffer();
        for worker in 0..3 {
            let seen = Arc::clone(&seen);
            buf.spawn_pinned(worker, move || {
                seen.lock()
                    .unwrap()
                    .push((worker, task::current_worker().unwrap()));
            });
        }

        pool.enqueue(buf).unwrap().join();

        for (requested, actual) in seen.lock().unwrap().iter() {
            assert_eq!(requested, actual);
        }
    }

    #[test]
    fn affinity_out_of_range_is_rejected() {
        let pool = small_pool(2);
        let mut buf = CommandBuffer::new();
        buf.spawn_pinned(7, || {});
        assert_eq!(
            pool.enqueue(buf).unwrap_err(),
            Error::InvalidConfig("task affinity out of range")
        );
    }

    #[test]
    fn detached_buffers_finish_before_pool_teardown() {
        let pool = small_pool(2);
        let count = Arc::new(AtomicUsize::new(0));

        let mut buf = pool.command_buffer();
        for _ in 0..8 {
            let count = Arc::clone(&count);
            buf.spawn(move || {
                task::sleep(std::time::Duration::from_millis(20));
                count.fetch_add(1, Ordering::AcqRel);
            });
        }
        pool.enqueue(buf).unwrap().detach();

        // dropping the pool joins the detached work first
        drop(pool);
        assert_eq!(count.load(Ordering::Acquire), 8);
    }
}
