// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks: cooperatively scheduled units of work with their own stacks.
//!
//! A [`Task`] owns a pooled fiber stack and a saved register context; a
//! worker runs it by switching into that context and the task hands control
//! back by switching out with a [`TaskMessage`] placed on its own stack. The
//! message tells the worker whether the task completed, yielded, wants to
//! sleep, or wants to park on a futex address.
//!
//! The free functions in this module ([`yield_now`], [`sleep`], [`wait`],
//! [`abort`], [`cancel_requested`], the task-local storage accessors) are the
//! API code running *inside* a task uses to talk to its scheduler. They are
//! backed by a thread-local current-task cell maintained by the worker; most
//! of them panic when called from a thread that is not currently executing a
//! task.

use crate::cmd_buf::CmdBufInner;
use crate::error::Error;
use crate::trace::CallStack;
use std::cell::{Cell, UnsafeCell};
use std::collections::HashMap;
use std::fmt;
use std::mem::offset_of;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use weft_channel::mpsc::{Linked, Links};
use weft_fiber::{Context, PooledStack, Transfer};

/// An opaque ID that uniquely identifies a task within its process for as
/// long as the task is live.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn from_u64(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A task's lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TaskState {
    /// Created but never scheduled.
    Init = 0,
    /// Runnable or running on its worker.
    Running = 1,
    /// Suspended in a sleep or an address wait.
    Parked = 2,
    /// Ran to completion.
    Completed = 3,
    /// Ended early through [`abort`] or a panic.
    Aborted = 4,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Init,
            1 => TaskState::Running,
            2 => TaskState::Parked,
            3 => TaskState::Completed,
            4 => TaskState::Aborted,
            _ => unreachable!("invalid task state"),
        }
    }
}

/// The message a task leaves on its stack when yielding back to its worker.
#[derive(Debug)]
pub(crate) enum TaskMessage {
    /// The task is done; `is_error` distinguishes abort/panic from normal
    /// completion.
    Complete { is_error: bool },
    /// Reschedule at the back of the worker's queue.
    Yield,
    /// Park until the deadline.
    Sleep { deadline: Instant },
    /// Park on a futex address until woken or timed out.
    Wait {
        addr: usize,
        size: usize,
        expected: u64,
        deadline: Option<Instant>,
    },
}

/// A record the worker leaves in the task before forwarding it to the pool's
/// scheduler channel.
#[derive(Debug)]
pub(crate) enum SchedMessage {
    /// Nothing pending (the task is not on the scheduler channel).
    None,
    /// Freshly enqueued; dispatch it.
    NewTask,
    Complete {
        is_error: bool,
    },
    Sleep {
        deadline: Instant,
    },
    Wait {
        addr: usize,
        size: usize,
        expected: u64,
        deadline: Option<Instant>,
    },
}

/// A cooperatively scheduled unit of work.
///
/// # Access discipline
///
/// The `UnsafeCell` fields are only ever touched by the party that currently
/// *owns* the task: the enqueuing thread before dispatch, the bound worker
/// while the task runs or is being switched, and the scheduler thread while
/// the task is parked or being torn down. Handoffs between these parties go
/// through channels or the futex, which provide the necessary ordering.
pub(crate) struct Task {
    id: TaskId,
    /// Intrusive link used while queued on a worker's channel or the
    /// scheduler channel (never both at once).
    links: Links<Task>,
    state: AtomicU8,
    /// The owning command buffer; tasks share its cancellation fate.
    cmd_buf: Arc<CmdBufInner>,
    /// Requested worker pinning, if any.
    affinity: Option<usize>,
    /// The worker this task is bound to once first dispatched.
    bound_worker: AtomicUsize,
    stack: UnsafeCell<Option<PooledStack>>,
    /// The saved register context while the task is suspended.
    context: UnsafeCell<Option<Context>>,
    /// The entry closure; taken at first dispatch.
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
    locals: UnsafeCell<TaskLocals>,
    call_stack: CallStack,
    /// The task's local result slot for its most recent error.
    result: UnsafeCell<Option<Error>>,
    /// See [`SchedMessage`].
    sched_msg: UnsafeCell<SchedMessage>,
    /// Set by the scheduler when a wait or sleep ended via its deadline;
    /// consumed by the task when it resumes.
    timed_out: AtomicBool,
}

pub(crate) const UNBOUND: usize = usize::MAX;

// Safety: see the access discipline note on `Task`.
unsafe impl Send for Task {}
// Safety: see the access discipline note on `Task`.
unsafe impl Sync for Task {}

// === impl Task ===

impl Task {
    pub(crate) fn new(
        id: TaskId,
        cmd_buf: Arc<CmdBufInner>,
        affinity: Option<usize>,
        stack: PooledStack,
        entry: Box<dyn FnOnce() + Send + 'static>,
        label: Option<&str>,
    ) -> Box<Self> {
        // Safety: the stack was freshly allocated for this task and stays
        // alive (owned by the task) for the context's entire lifetime.
        let context = unsafe { Context::init_on_stack(stack.top(), task_entry_trampoline) };

        Box::new(Self {
            id,
            links: Links::new(),
            state: AtomicU8::new(TaskState::Init as u8),
            cmd_buf,
            affinity,
            bound_worker: AtomicUsize::new(UNBOUND),
            stack: UnsafeCell::new(Some(stack)),
            context: UnsafeCell::new(Some(context)),
            entry: UnsafeCell::new(Some(entry)),
            locals: UnsafeCell::new(TaskLocals::default()),
            call_stack: CallStack::for_task(id.as_u64(), label),
            result: UnsafeCell::new(None),
            sched_msg: UnsafeCell::new(SchedMessage::None),
            timed_out: AtomicBool::new(false),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn cmd_buf(&self) -> &Arc<CmdBufInner> {
        &self.cmd_buf
    }

    #[inline]
    pub(crate) fn affinity(&self) -> Option<usize> {
        self.affinity
    }

    #[inline]
    pub(crate) fn call_stack(&self) -> &CallStack {
        &self.call_stack
    }

    /// Binds the task to `worker` if it is not bound yet; returns the worker
    /// the task is bound to afterwards.
    pub(crate) fn bind_worker(&self, worker: usize) -> usize {
        match self.bound_worker.compare_exchange(
            UNBOUND,
            worker,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => worker,
            Err(bound) => bound,
        }
    }

    #[inline]
    pub(crate) fn bound_worker(&self) -> Option<usize> {
        match self.bound_worker.load(Ordering::Acquire) {
            UNBOUND => None,
            worker => Some(worker),
        }
    }

    /// Takes the saved context for a switch. Caller must be the owning
    /// worker.
    pub(crate) fn take_context(&self) -> Context {
        // Safety: access discipline, see `Task`.
        unsafe { (*self.context.get()).take() }.expect("task has no saved context")
    }

    /// Stores the context saved by the task's most recent switch-out.
    pub(crate) fn store_context(&self, context: Context) {
        // Safety: access discipline, see `Task`.
        unsafe { *self.context.get() = Some(context) };
    }

    /// Releases the task's stack back to its pool. Called after completion,
    /// when the suspended context is dead.
    pub(crate) fn release_stack(&self) {
        // Safety: access discipline, see `Task`; the context was consumed by
        // the final switch.
        unsafe {
            *self.context.get() = None;
            *self.stack.get() = None;
        }
    }

    pub(crate) fn set_sched_msg(&self, msg: SchedMessage) {
        // Safety: access discipline, see `Task`.
        unsafe { *self.sched_msg.get() = msg };
    }

    pub(crate) fn take_sched_msg(&self) -> SchedMessage {
        // Safety: access discipline, see `Task`.
        unsafe { std::mem::replace(&mut *self.sched_msg.get(), SchedMessage::None) }
    }

    pub(crate) fn set_timed_out(&self, timed_out: bool) {
        self.timed_out.store(timed_out, Ordering::Release);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("bound_worker", &self.bound_worker())
            .finish_non_exhaustive()
    }
}

/// A non-owning reference to a task flowing through the scheduler's queues.
/// The task allocation is owned by its command buffer and outlives every
/// `TaskRef` (parked or queued tasks always count as outstanding).
#[derive(Clone, Copy, Eq, PartialEq)]
pub(crate) struct TaskRef(NonNull<Task>);

// Safety: tasks are Sync and the referent outlives the reference, see above.
unsafe impl Send for TaskRef {}

impl TaskRef {
    pub(crate) fn new(ptr: NonNull<Task>) -> Self {
        Self(ptr)
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> NonNull<Task> {
        self.0
    }

    /// # Safety
    ///
    /// The task must still be live (queued, parked, or running tasks always
    /// are).
    #[inline]
    pub(crate) unsafe fn get(&self) -> &Task {
        // Safety: ensured by caller.
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskRef({:p})", self.0)
    }
}

// Safety: `links` is an intrusive link field; tasks are heap-allocated and
// never move while queued. A task is on at most one channel at a time
// (worker queue or scheduler queue), so the single link field suffices.
unsafe impl Linked for Task {
    type Handle = TaskRef;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r.0
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        TaskRef(ptr)
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}

/// Task-local storage: a mapping from opaque key address to a value pointer
/// plus an optional destructor, owned by the task and torn down with it.
#[derive(Default)]
pub(crate) struct TaskLocals {
    slots: HashMap<usize, LocalSlot>,
}

struct LocalSlot {
    value: *mut (),
    dtor: Option<Dtor>,
}

/// A task-local destructor; the ABI registers `extern "C"` ones.
#[derive(Clone, Copy)]
pub(crate) enum Dtor {
    Rust(unsafe fn(*mut ())),
    Extern(unsafe extern "C" fn(*mut std::ffi::c_void)),
}

impl Dtor {
    unsafe fn run(self, value: *mut ()) {
        // Safety: the registrar supplied a destructor matching the value.
        unsafe {
            match self {
                Dtor::Rust(f) => f(value),
                Dtor::Extern(f) => f(value.cast()),
            }
        }
    }
}

impl TaskLocals {
    fn set(&mut self, key: usize, value: *mut (), dtor: Option<Dtor>) {
        if let Some(prev) = self.slots.insert(key, LocalSlot { value, dtor }) {
            prev.run_dtor();
        }
    }

    fn get(&self, key: usize) -> Option<*mut ()> {
        self.slots.get(&key).map(|slot| slot.value)
    }

    fn clear(&mut self, key: usize) {
        if let Some(slot) = self.slots.remove(&key) {
            slot.run_dtor();
        }
    }

    fn run_destructors(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.run_dtor();
        }
    }
}

impl LocalSlot {
    fn run_dtor(self) {
        if let Some(dtor) = self.dtor {
            // Safety: the registrar supplied a destructor matching the value
            // pointer.
            unsafe { dtor.run(self.value) };
        }
    }
}

/// An identity key for task-local storage. Declare as a `static` and pass by
/// reference; the key's *address* is the identity.
#[derive(Debug, Default)]
pub struct LocalKey {
    _anchor: u8,
}

impl LocalKey {
    #[must_use]
    pub const fn new() -> Self {
        Self { _anchor: 0 }
    }

    fn addr(&'static self) -> usize {
        std::ptr::from_ref(self) as usize
    }
}

/// The thread-local cell workers use to expose the currently running task to
/// the in-task API.
pub(crate) struct CurrentCell {
    task: Cell<*const Task>,
    /// The worker's suspended context, for switching back on a yield.
    return_to: Cell<Option<Context>>,
    /// This thread's worker index, if it is a pool worker.
    worker: Cell<Option<usize>>,
}

thread_local! {
    pub(crate) static CURRENT: CurrentCell = const {
        CurrentCell {
            task: Cell::new(std::ptr::null()),
            return_to: Cell::new(None),
            worker: Cell::new(None),
        }
    };
}

impl CurrentCell {
    pub(crate) fn set_worker(&self, index: Option<usize>) {
        self.worker.set(index);
    }

    pub(crate) fn set_task(&self, task: *const Task) {
        self.task.set(task);
    }

    pub(crate) fn set_return_to(&self, context: Option<Context>) {
        self.return_to.set(context);
    }

    pub(crate) fn take_return_to(&self) -> Option<Context> {
        self.return_to.take()
    }
}

/// Runs `f` with the currently running task, if the calling thread is a
/// worker mid-dispatch.
pub(crate) fn with_current_task<R>(f: impl FnOnce(&Task) -> R) -> Option<R> {
    CURRENT.with(|cur| {
        let ptr = cur.task.get();
        if ptr.is_null() {
            None
        } else {
            // Safety: the worker keeps the task alive for the duration of
            // the dispatch.
            Some(f(unsafe { &*ptr }))
        }
    })
}

fn expect_current_task<R>(op: &str, f: impl FnOnce(&Task) -> R) -> R {
    with_current_task(f)
        .unwrap_or_else(|| panic!("`{op}` must be called from within a weft task"))
}

/// The fiber entry point of every task.
///
/// The first switch into a fresh task context lands here; `transfer` carries
/// the worker's suspended context and a pointer to the task itself.
pub(crate) extern "C" fn task_entry_trampoline(transfer: Transfer) -> ! {
    let task_ptr = transfer.data as *const Task;
    CURRENT.with(|cur| {
        cur.set_return_to(Some(transfer.context));
    });

    // Safety: the worker that switched to us keeps the task alive.
    let task = unsafe { &*task_ptr };

    // Safety: the entry closure is taken exactly once, here.
    let entry = unsafe { (*task.entry.get()).take() }.expect("task entry already taken");

    let outcome = panic::catch_unwind(AssertUnwindSafe(entry));
    let is_error = match outcome {
        Ok(()) => false,
        Err(payload) => {
            if !payload.is::<AbortTask>() {
                tracing::warn!(task.id = task.id().as_u64(), "task panicked");
            }
            true
        }
    };

    // Tear down task-local storage on the task's own stack, while the
    // destructors can still observe a task environment.
    // Safety: the task is exclusively ours until the final switch below.
    unsafe { (*task.locals.get()).run_destructors() };

    let msg = TaskMessage::Complete { is_error };
    let worker = CURRENT.with(CurrentCell::take_return_to).expect("worker context missing");
    // Safety: the worker context is live; it parked exactly to run us.
    let _ = unsafe { worker.switch(&raw const msg as usize) };

    // A completed task must never be switched to again.
    std::process::abort();
}

/// The panic payload used to implement [`abort`].
struct AbortTask;

/// Suspends the calling task, leaving `msg` for its worker.
fn suspend_with(msg: &TaskMessage) {
    CURRENT.with(|cur| {
        let worker = cur
            .take_return_to()
            .expect("task suspension outside of a task");
        // Safety: the worker context is live (it is parked in its dispatch
        // loop waiting for exactly this switch), and `msg` lives on our
        // suspended stack.
        let transfer = unsafe { worker.switch(std::ptr::from_ref(msg) as usize) };
        cur.set_return_to(Some(transfer.context));
    });
}

/// The id of the currently running task, or `None` outside of one.
#[must_use]
pub fn current_task_id() -> Option<TaskId> {
    with_current_task(Task::id)
}

/// The index of the worker executing the current thread, or `None` if the
/// calling thread is not a pool worker.
#[must_use]
pub fn current_worker() -> Option<usize> {
    CURRENT.with(|cur| cur.worker.get())
}

/// Yields the calling task back to its worker, rescheduling it at the back
/// of the worker's queue.
///
/// # Panics
///
/// Panics when called from outside a task.
pub fn yield_now() {
    expect_current_task("yield_now", |_| ());
    suspend_with(&TaskMessage::Yield);
}

/// Parks the calling task for at least `duration`.
///
/// # Panics
///
/// Panics when called from outside a task.
pub fn sleep(duration: Duration) {
    sleep_until(Instant::now() + duration);
}

/// Parks the calling task until at least `deadline`.
///
/// # Panics
///
/// Panics when called from outside a task.
pub fn sleep_until(deadline: Instant) {
    expect_current_task("sleep", |_| ());
    suspend_with(&TaskMessage::Sleep { deadline });
    let _ = with_current_task(|task| task.timed_out.store(false, Ordering::Relaxed));
}

/// Parks the calling task on an address until the pool's futex wakes it or
/// the deadline elapses.
///
/// If `*addr` no longer holds `expected` when the scheduler processes the
/// park request, the task is rescheduled immediately and the call returns
/// `Ok(())`; like any futex wait, the caller re-examines its predicate in a
/// loop.
///
/// # Errors
///
/// [`Error::Timeout`] if the deadline elapsed, [`Error::InvalidConfig`] for
/// a bad key size or alignment.
///
/// # Panics
///
/// Panics when called from outside a task.
///
/// # Safety
///
/// `addr` must point to `size` bytes of memory that stay valid until the
/// task resumes and are only mutated through atomic operations.
pub unsafe fn wait(
    addr: *const (),
    size: usize,
    expected: u64,
    deadline: Option<Instant>,
) -> Result<(), Error> {
    if !matches!(size, 1 | 2 | 4 | 8) || (addr as usize) % size != 0 {
        return Err(Error::InvalidConfig("invalid futex key"));
    }
    expect_current_task("wait", |_| ());

    suspend_with(&TaskMessage::Wait {
        addr: addr as usize,
        size,
        expected,
        deadline,
    });

    let timed_out =
        with_current_task(|task| task.timed_out.swap(false, Ordering::AcqRel)).unwrap();
    if timed_out { Err(Error::Timeout) } else { Ok(()) }
}

/// Aborts the calling task: unwinds its stack, runs task-local destructors,
/// and reports the task as aborted.
///
/// # Panics
///
/// Panics when called from outside a task (and unwinds deliberately inside
/// one).
pub fn abort() -> ! {
    expect_current_task("abort", |_| ());
    panic::resume_unwind(Box::new(AbortTask));
}

/// Aborts the calling task, recording `error` in its result slot first.
pub fn abort_with(error: Error) -> ! {
    set_result(error);
    abort();
}

/// Whether cancellation has been requested for the calling task's command
/// buffer. Well-behaved tasks poll this at their suspension points and
/// return early when it is set.
///
/// Returns `false` outside of a task.
#[must_use]
pub fn cancel_requested() -> bool {
    with_current_task(|task| task.cmd_buf.is_cancelling()).unwrap_or(false)
}

/// Stores `error` in the calling task's local result slot, returning the
/// previous value.
///
/// # Panics
///
/// Panics when called from outside a task.
pub fn set_result(error: Error) -> Option<Error> {
    expect_current_task("set_result", |task| {
        // Safety: the result slot is only touched from the task itself.
        unsafe { (*task.result.get()).replace(error) }
    })
}

/// Takes the calling task's most recent error, if any.
///
/// # Panics
///
/// Panics when called from outside a task.
pub fn take_result() -> Option<Error> {
    expect_current_task("take_result", |task| {
        // Safety: the result slot is only touched from the task itself.
        unsafe { (*task.result.get()).take() }
    })
}

/// Associates `value` (and an optional destructor) with `key` in the calling
/// task's local storage, replacing (and destroying) any previous value.
///
/// # Panics
///
/// Panics when called from outside a task.
pub fn local_set(key: &'static LocalKey, value: *mut (), dtor: Option<unsafe fn(*mut ())>) {
    local_set_raw(key.addr(), value, dtor.map(Dtor::Rust));
}

/// Reads the value associated with `key`, if any.
///
/// # Panics
///
/// Panics when called from outside a task.
#[must_use]
pub fn local_get(key: &'static LocalKey) -> Option<*mut ()> {
    local_get_raw(key.addr())
}

/// Removes the value associated with `key`, running its destructor.
///
/// # Panics
///
/// Panics when called from outside a task.
pub fn local_clear(key: &'static LocalKey) {
    local_clear_raw(key.addr());
}

pub(crate) fn local_set_raw(key: usize, value: *mut (), dtor: Option<Dtor>) {
    expect_current_task("local_set", |task| {
        // Safety: task locals are only touched from the task itself.
        unsafe { (*task.locals.get()).set(key, value, dtor) };
    });
}

pub(crate) fn local_get_raw(key: usize) -> Option<*mut ()> {
    expect_current_task("local_get", |task| {
        // Safety: task locals are only touched from the task itself.
        unsafe { (*task.locals.get()).get(key) }
    })
}

pub(crate) fn local_clear_raw(key: usize) {
    expect_current_task("local_clear", |task| {
        // Safety: task locals are only touched from the task itself.
        unsafe { (*task.locals.get()).clear(key) };
    });
}
