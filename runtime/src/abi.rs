// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The C-compatible ABI surface of the context object.
//!
//! Stability contract: the first word of the context is its reference count
//! and the first slot of [`ContextVTable`] is `check_version`; everything
//! else may change between major versions, which `check_version` is there to
//! reject. The operation groups mirror the public Rust API — core
//! (acquire/release/version), tracing call stacks, pool queries and task
//! operations, command buffers, and the futex — and delegate to it.
//!
//! Handles crossing the boundary (`AbiPool`, `AbiCommandBuffer`, …) are
//! opaque boxed objects owned by the consumer, released through the matching
//! destroy/consume slot. Deadlines are nanoseconds from now, with `u64::MAX`
//! meaning "no deadline".

use crate::context::{Context, ContextHeader, Version};
use crate::error::Error;
use crate::pool::{Pool, PoolConfig, PoolStackConfig};
use crate::task::{self, Dtor};
use crate::trace::{self, CallStack, EventLevel, ThreadRegistration};
use crate::{CmdBufStatus, CommandBuffer, JoinHandle, TaskOptions};
use std::ffi::{CStr, c_char, c_void};
use std::time::{Duration, Instant};
use weft_fiber::StackClass;
use weft_futex::{KeyExpect, WakeFilter};

/// Status codes returned by fallible ABI operations.
#[repr(i32)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AbiStatus {
    Ok = 0,
    InvalidConfig = 1,
    OutOfMemory = 2,
    Closed = 3,
    Timeout = 4,
    Invalid = 5,
    NotPermitted = 6,
    NotFound = 7,
    VersionNotSupported = 8,
}

impl From<Error> for AbiStatus {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidConfig(_) => AbiStatus::InvalidConfig,
            Error::OutOfMemory => AbiStatus::OutOfMemory,
            Error::Closed => AbiStatus::Closed,
            Error::Timeout => AbiStatus::Timeout,
            Error::Invalid => AbiStatus::Invalid,
            Error::NotPermitted => AbiStatus::NotPermitted,
            Error::NotFound => AbiStatus::NotFound,
            Error::VersionNotSupported => AbiStatus::VersionNotSupported,
        }
    }
}

fn status_of(result: Result<(), Error>) -> AbiStatus {
    match result {
        Ok(()) => AbiStatus::Ok,
        Err(err) => err.into(),
    }
}

/// No deadline, as a nanosecond delay.
pub const NO_DEADLINE: u64 = u64::MAX;

fn deadline_from_nanos(nanos: u64) -> Option<Instant> {
    (nanos != NO_DEADLINE).then(|| Instant::now() + Duration::from_nanos(nanos))
}

/// Event severities across the ABI.
#[repr(i32)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AbiEventLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl From<AbiEventLevel> for EventLevel {
    fn from(level: AbiEventLevel) -> Self {
        match level {
            AbiEventLevel::Trace => EventLevel::Trace,
            AbiEventLevel::Debug => EventLevel::Debug,
            AbiEventLevel::Info => EventLevel::Info,
            AbiEventLevel::Warn => EventLevel::Warn,
            AbiEventLevel::Error => EventLevel::Error,
        }
    }
}

/// One stack size class in an [`AbiPoolConfig`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AbiStackConfig {
    pub size: usize,
    pub preallocated: usize,
    pub cold: usize,
    pub hot: usize,
    pub max_allocated: usize,
    /// Non-zero marks this class as the default.
    pub is_default: u8,
}

/// Pool creation parameters across the ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AbiPoolConfig {
    /// Optional nul-terminated label; may be null.
    pub label: *const c_char,
    /// `0` means one worker per CPU.
    pub worker_count: usize,
    /// Stack size classes; null means the built-in default.
    pub stacks: *const AbiStackConfig,
    pub stacks_len: usize,
    pub cmd_buf_capacity: usize,
    pub max_load_factor: usize,
    /// Non-zero lists the pool in `query_pools`.
    pub is_queryable: u8,
}

/// Opaque pool handle; owned by the consumer, released with `pool.destroy`.
pub struct AbiPool {
    pool: Pool,
}

/// Opaque command buffer under construction.
pub struct AbiCommandBuffer {
    buffer: CommandBuffer,
}

/// Opaque handle to a submitted command buffer.
pub struct AbiJoinHandle {
    handle: JoinHandle,
}

/// One key of an ABI multi-key wait; layout-compatible with [`KeyExpect`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AbiKeyExpect {
    pub addr: *const c_void,
    pub size: usize,
    pub expected: u64,
}

/// The root vtable of the context ABI.
#[repr(C)]
pub struct ContextVTable {
    /// ABI contract: the first slot. Consumers call this before anything
    /// else and back off on [`AbiStatus::VersionNotSupported`].
    pub check_version:
        unsafe extern "C" fn(ctx: *const ContextHeader, required: *const Version) -> AbiStatus,
    pub core: &'static CoreVTable,
    pub tracing: &'static TracingVTable,
    pub pool: &'static PoolVTable,
    pub cmd_buf: &'static CmdBufVTable,
    pub futex: &'static FutexVTable,
}

#[repr(C)]
pub struct CoreVTable {
    pub acquire: unsafe extern "C" fn(ctx: *const ContextHeader),
    pub release: unsafe extern "C" fn(ctx: *const ContextHeader),
}

#[repr(C)]
pub struct TracingVTable {
    pub create_call_stack:
        unsafe extern "C" fn(ctx: *const ContextHeader, label: *const c_char) -> *mut CallStack,
    pub destroy_call_stack: unsafe extern "C" fn(ctx: *const ContextHeader, stack: *mut CallStack),
    pub switch_call_stack: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        stack: *const CallStack,
    ) -> *const CallStack,
    pub suspend_current: unsafe extern "C" fn(ctx: *const ContextHeader, blocked: u8),
    pub resume_current: unsafe extern "C" fn(ctx: *const ContextHeader),
    pub push_span: unsafe extern "C" fn(ctx: *const ContextHeader, name: *const c_char),
    pub pop_span: unsafe extern "C" fn(ctx: *const ContextHeader),
    pub emit_event: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        level: AbiEventLevel,
        message: *const c_char,
    ),
    pub register_thread: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        name: *const c_char,
    ) -> *mut ThreadRegistration,
    pub unregister_thread:
        unsafe extern "C" fn(ctx: *const ContextHeader, registration: *mut ThreadRegistration),
    pub flush: unsafe extern "C" fn(ctx: *const ContextHeader),
}

#[repr(C)]
pub struct PoolVTable {
    /// Writes the calling task's id; `NotFound` outside a task.
    pub current_task_id:
        unsafe extern "C" fn(ctx: *const ContextHeader, out: *mut u64) -> AbiStatus,
    /// Writes the calling worker's index; `NotFound` off the workers.
    pub current_worker:
        unsafe extern "C" fn(ctx: *const ContextHeader, out: *mut usize) -> AbiStatus,
    /// The pool whose worker executes the calling thread, or null.
    pub current_pool: unsafe extern "C" fn(ctx: *const ContextHeader) -> *mut AbiPool,
    pub create_pool: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        config: *const AbiPoolConfig,
        out: *mut *mut AbiPool,
    ) -> AbiStatus,
    /// Writes up to `cap` handles of the context's queryable pools; the full
    /// count goes to `len`.
    pub query_pools: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        out: *mut *mut AbiPool,
        cap: usize,
        len: *mut usize,
    ) -> AbiStatus,
    pub destroy_pool: unsafe extern "C" fn(ctx: *const ContextHeader, pool: *mut AbiPool),
    pub yield_now: unsafe extern "C" fn(ctx: *const ContextHeader),
    pub abort: unsafe extern "C-unwind" fn(ctx: *const ContextHeader) -> !,
    pub sleep: unsafe extern "C" fn(ctx: *const ContextHeader, nanos: u64),
    pub task_local_set: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        key: *const c_void,
        value: *mut c_void,
        dtor: Option<unsafe extern "C" fn(*mut c_void)>,
    ),
    pub task_local_get: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        key: *const c_void,
    ) -> *mut c_void,
    pub task_local_clear: unsafe extern "C" fn(ctx: *const ContextHeader, key: *const c_void),
}

#[repr(C)]
pub struct CmdBufVTable {
    pub create: unsafe extern "C" fn(ctx: *const ContextHeader) -> *mut AbiCommandBuffer,
    pub destroy: unsafe extern "C" fn(ctx: *const ContextHeader, buf: *mut AbiCommandBuffer),
    /// Adds a task calling `entry(arg)`; `affinity < 0` leaves placement to
    /// the pool.
    pub spawn: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        buf: *mut AbiCommandBuffer,
        entry: unsafe extern "C" fn(*mut c_void),
        arg: *mut c_void,
        affinity: isize,
    ),
    /// Consumes the buffer and dispatches it on `pool`.
    pub enqueue: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        pool: *const AbiPool,
        buf: *mut AbiCommandBuffer,
        out: *mut *mut AbiJoinHandle,
    ) -> AbiStatus,
    /// Consumes the handle, blocking until the buffer is done. `Ok` for a
    /// normal completion, `Closed` for a cancelled one.
    pub join:
        unsafe extern "C" fn(ctx: *const ContextHeader, handle: *mut AbiJoinHandle) -> AbiStatus,
    pub detach: unsafe extern "C" fn(ctx: *const ContextHeader, handle: *mut AbiJoinHandle),
    pub cancel: unsafe extern "C" fn(ctx: *const ContextHeader, handle: *const AbiJoinHandle),
    pub cancel_detach:
        unsafe extern "C" fn(ctx: *const ContextHeader, handle: *mut AbiJoinHandle),
    /// Whether the calling task's buffer was cancelled.
    pub cancel_requested: unsafe extern "C" fn(ctx: *const ContextHeader) -> u8,
}

#[repr(C)]
pub struct FutexVTable {
    /// Parks the calling *task* on the key (the calling OS thread outside a
    /// task).
    pub wait: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        pool: *const AbiPool,
        addr: *const c_void,
        size: usize,
        expected: u64,
        token: usize,
        deadline_nanos: u64,
    ) -> AbiStatus,
    /// Multi-key thread-level wait; writes the fired index to `out_index`.
    pub wait_v: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        pool: *const AbiPool,
        keys: *const AbiKeyExpect,
        keys_len: usize,
        token: usize,
        deadline_nanos: u64,
        out_index: *mut usize,
    ) -> AbiStatus,
    pub wake: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        pool: *const AbiPool,
        addr: *const c_void,
        max: usize,
        filter_token: *const usize,
    ) -> usize,
    pub requeue: unsafe extern "C" fn(
        ctx: *const ContextHeader,
        pool: *const AbiPool,
        from: *const c_void,
        to: *const c_void,
        size: usize,
        expected: u64,
        max_wakes: usize,
        max_requeues: usize,
        filter_token: *const usize,
        out_woken: *mut usize,
        out_requeued: *mut usize,
    ) -> AbiStatus,
}

/// The vtable installed in every context created by this crate.
pub static CONTEXT_VTABLE: ContextVTable = ContextVTable {
    check_version: abi_check_version,
    core: &CoreVTable {
        acquire: abi_acquire,
        release: abi_release,
    },
    tracing: &TracingVTable {
        create_call_stack: abi_create_call_stack,
        destroy_call_stack: abi_destroy_call_stack,
        switch_call_stack: abi_switch_call_stack,
        suspend_current: abi_suspend_current,
        resume_current: abi_resume_current,
        push_span: abi_push_span,
        pop_span: abi_pop_span,
        emit_event: abi_emit_event,
        register_thread: abi_register_thread,
        unregister_thread: abi_unregister_thread,
        flush: abi_flush,
    },
    pool: &PoolVTable {
        current_task_id: abi_current_task_id,
        current_worker: abi_current_worker,
        current_pool: abi_current_pool,
        create_pool: abi_create_pool,
        query_pools: abi_query_pools,
        destroy_pool: abi_destroy_pool,
        yield_now: abi_yield_now,
        abort: abi_abort,
        sleep: abi_sleep,
        task_local_set: abi_task_local_set,
        task_local_get: abi_task_local_get,
        task_local_clear: abi_task_local_clear,
    },
    cmd_buf: &CmdBufVTable {
        create: abi_cmd_buf_create,
        destroy: abi_cmd_buf_destroy,
        spawn: abi_cmd_buf_spawn,
        enqueue: abi_cmd_buf_enqueue,
        join: abi_cmd_buf_join,
        detach: abi_cmd_buf_detach,
        cancel: abi_cmd_buf_cancel,
        cancel_detach: abi_cmd_buf_cancel_detach,
        cancel_requested: abi_cmd_buf_cancel_requested,
    },
    futex: &FutexVTable {
        wait: abi_futex_wait,
        wait_v: abi_futex_wait_v,
        wake: abi_futex_wake,
        requeue: abi_futex_requeue,
    },
};

unsafe fn cstr_opt<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // Safety: the caller passed a nul-terminated string.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

// === core ===

unsafe extern "C" fn abi_check_version(
    _ctx: *const ContextHeader,
    required: *const Version,
) -> AbiStatus {
    // Safety: the caller passed a valid version struct.
    let required = unsafe { *required };
    if crate::context::VERSION.satisfies(required) {
        AbiStatus::Ok
    } else {
        AbiStatus::VersionNotSupported
    }
}

unsafe extern "C" fn abi_acquire(ctx: *const ContextHeader) {
    Context::acquire_raw(ctx);
}

unsafe extern "C" fn abi_release(ctx: *const ContextHeader) {
    // Safety: the caller owns the reference being released.
    unsafe { Context::release_raw(ctx) };
}

// === tracing ===

unsafe extern "C" fn abi_create_call_stack(
    _ctx: *const ContextHeader,
    label: *const c_char,
) -> *mut CallStack {
    // Safety: label contract, see cstr_opt.
    let label = unsafe { cstr_opt(label) }.unwrap_or("call-stack");
    Box::into_raw(Box::new(CallStack::for_thread(label)))
}

unsafe extern "C" fn abi_destroy_call_stack(_ctx: *const ContextHeader, stack: *mut CallStack) {
    if !stack.is_null() {
        // Safety: created by abi_create_call_stack.
        drop(unsafe { Box::from_raw(stack) });
    }
}

unsafe extern "C" fn abi_switch_call_stack(
    _ctx: *const ContextHeader,
    stack: *const CallStack,
) -> *const CallStack {
    trace::switch_call_stack(stack)
}

unsafe extern "C" fn abi_suspend_current(_ctx: *const ContextHeader, blocked: u8) {
    let _ = trace::with_current(|cs| cs.suspend(blocked != 0));
}

unsafe extern "C" fn abi_resume_current(_ctx: *const ContextHeader) {
    let _ = trace::with_current(CallStack::resume);
}

unsafe extern "C" fn abi_push_span(_ctx: *const ContextHeader, name: *const c_char) {
    // Safety: name contract, see cstr_opt.
    if let Some(name) = unsafe { cstr_opt(name) } {
        trace::push_span(name);
    }
}

unsafe extern "C" fn abi_pop_span(_ctx: *const ContextHeader) {
    trace::pop_span();
}

unsafe extern "C" fn abi_emit_event(
    _ctx: *const ContextHeader,
    level: AbiEventLevel,
    message: *const c_char,
) {
    // Safety: message contract, see cstr_opt.
    if let Some(message) = unsafe { cstr_opt(message) } {
        trace::emit(level.into(), message);
    }
}

unsafe extern "C" fn abi_register_thread(
    _ctx: *const ContextHeader,
    name: *const c_char,
) -> *mut ThreadRegistration {
    // Safety: name contract, see cstr_opt.
    let name = unsafe { cstr_opt(name) }.unwrap_or("registered-thread");
    Box::into_raw(Box::new(trace::register_thread(name)))
}

unsafe extern "C" fn abi_unregister_thread(
    _ctx: *const ContextHeader,
    registration: *mut ThreadRegistration,
) {
    if !registration.is_null() {
        // Safety: created by abi_register_thread.
        drop(unsafe { Box::from_raw(registration) });
    }
}

unsafe extern "C" fn abi_flush(_ctx: *const ContextHeader) {
    trace::flush();
}

// === pool ===

unsafe extern "C" fn abi_current_task_id(
    _ctx: *const ContextHeader,
    out: *mut u64,
) -> AbiStatus {
    match task::current_task_id() {
        Some(id) => {
            // Safety: the caller passed a valid out pointer.
            unsafe { *out = id.as_u64() };
            AbiStatus::Ok
        }
        None => AbiStatus::NotFound,
    }
}

unsafe extern "C" fn abi_current_worker(
    _ctx: *const ContextHeader,
    out: *mut usize,
) -> AbiStatus {
    match task::current_worker() {
        Some(worker) => {
            // Safety: the caller passed a valid out pointer.
            unsafe { *out = worker };
            AbiStatus::Ok
        }
        None => AbiStatus::NotFound,
    }
}

unsafe extern "C" fn abi_current_pool(_ctx: *const ContextHeader) -> *mut AbiPool {
    match crate::pool::current_pool() {
        Some(pool) => Box::into_raw(Box::new(AbiPool { pool })),
        None => std::ptr::null_mut(),
    }
}

unsafe extern "C" fn abi_create_pool(
    ctx: *const ContextHeader,
    config: *const AbiPoolConfig,
    out: *mut *mut AbiPool,
) -> AbiStatus {
    // Safety: the caller passed a valid config.
    let raw = unsafe { *config };

    let mut pool_config = PoolConfig {
        // Safety: label contract, see cstr_opt.
        label: unsafe { cstr_opt(raw.label) }.map(str::to_owned),
        worker_count: raw.worker_count,
        cmd_buf_capacity: raw.cmd_buf_capacity.max(1),
        max_load_factor: raw.max_load_factor,
        is_queryable: raw.is_queryable != 0,
        ..PoolConfig::default()
    };
    if !raw.stacks.is_null() {
        // Safety: the caller passed `stacks_len` valid entries.
        let stacks = unsafe { std::slice::from_raw_parts(raw.stacks, raw.stacks_len) };
        pool_config.stacks = stacks
            .iter()
            .map(|s| PoolStackConfig {
                class: StackClass {
                    size: s.size,
                    preallocated: s.preallocated,
                    cold: s.cold,
                    hot: s.hot,
                    max_allocated: s.max_allocated,
                },
                default: s.is_default != 0,
            })
            .collect();
    }

    // Safety: ctx is a live context header.
    let context = std::mem::ManuallyDrop::new(unsafe { Context::from_header(ctx) });
    match context.create_pool(pool_config) {
        Ok(pool) => {
            // Safety: the caller passed a valid out pointer.
            unsafe { *out = Box::into_raw(Box::new(AbiPool { pool })) };
            AbiStatus::Ok
        }
        Err(err) => err.into(),
    }
}

unsafe extern "C" fn abi_query_pools(
    ctx: *const ContextHeader,
    out: *mut *mut AbiPool,
    cap: usize,
    len: *mut usize,
) -> AbiStatus {
    // Safety: ctx is a live context header.
    let context = std::mem::ManuallyDrop::new(unsafe { Context::from_header(ctx) });
    let pools = context.query_pools();

    // Safety: the caller passed a valid out pointer.
    unsafe { *len = pools.len() };
    for (i, pool) in pools.into_iter().take(cap).enumerate() {
        // Safety: the caller passed `cap` writable slots.
        unsafe { *out.add(i) = Box::into_raw(Box::new(AbiPool { pool })) };
    }
    AbiStatus::Ok
}

unsafe extern "C" fn abi_destroy_pool(_ctx: *const ContextHeader, pool: *mut AbiPool) {
    if !pool.is_null() {
        // Safety: created by one of the pool-returning slots.
        drop(unsafe { Box::from_raw(pool) });
    }
}

unsafe extern "C" fn abi_yield_now(_ctx: *const ContextHeader) {
    task::yield_now();
}

unsafe extern "C-unwind" fn abi_abort(_ctx: *const ContextHeader) -> ! {
    task::abort();
}

unsafe extern "C" fn abi_sleep(_ctx: *const ContextHeader, nanos: u64) {
    task::sleep(Duration::from_nanos(nanos));
}

unsafe extern "C" fn abi_task_local_set(
    _ctx: *const ContextHeader,
    key: *const c_void,
    value: *mut c_void,
    dtor: Option<unsafe extern "C" fn(*mut c_void)>,
) {
    task::local_set_raw(key as usize, value.cast(), dtor.map(Dtor::Extern));
}

unsafe extern "C" fn abi_task_local_get(
    _ctx: *const ContextHeader,
    key: *const c_void,
) -> *mut c_void {
    task::local_get_raw(key as usize)
        .map_or(std::ptr::null_mut(), |value| value.cast())
}

unsafe extern "C" fn abi_task_local_clear(_ctx: *const ContextHeader, key: *const c_void) {
    task::local_clear_raw(key as usize);
}

// === command buffer ===

unsafe extern "C" fn abi_cmd_buf_create(_ctx: *const ContextHeader) -> *mut AbiCommandBuffer {
    Box::into_raw(Box::new(AbiCommandBuffer {
        buffer: CommandBuffer::new(),
    }))
}

unsafe extern "C" fn abi_cmd_buf_destroy(_ctx: *const ContextHeader, buf: *mut AbiCommandBuffer) {
    if !buf.is_null() {
        // Safety: created by abi_cmd_buf_create.
        drop(unsafe { Box::from_raw(buf) });
    }
}

unsafe extern "C" fn abi_cmd_buf_spawn(
    _ctx: *const ContextHeader,
    buf: *mut AbiCommandBuffer,
    entry: unsafe extern "C" fn(*mut c_void),
    arg: *mut c_void,
    affinity: isize,
) {
    struct SendPtr(*mut c_void);
    // Safety: the ABI contract requires `arg` to be sendable to the worker.
    unsafe impl Send for SendPtr {}

    // Safety: buf was created by abi_cmd_buf_create and not yet consumed.
    let buf = unsafe { &mut *buf };
    let arg = SendPtr(arg);
    buf.buffer.spawn_with(
        TaskOptions {
            affinity: usize::try_from(affinity).ok(),
            ..TaskOptions::default()
        },
        move || {
            let arg = arg;
            // Safety: the consumer's entry/arg contract.
            unsafe { entry(arg.0) }
        },
    );
}

unsafe extern "C" fn abi_cmd_buf_enqueue(
    _ctx: *const ContextHeader,
    pool: *const AbiPool,
    buf: *mut AbiCommandBuffer,
    out: *mut *mut AbiJoinHandle,
) -> AbiStatus {
    // Safety: handles are live per the ABI ownership contract; the buffer is
    // consumed here.
    let (pool, buffer) = unsafe { (&(*pool).pool, Box::from_raw(buf)) };
    match pool.enqueue(buffer.buffer) {
        Ok(handle) => {
            // Safety: the caller passed a valid out pointer.
            unsafe { *out = Box::into_raw(Box::new(AbiJoinHandle { handle })) };
            AbiStatus::Ok
        }
        Err(err) => err.into(),
    }
}

unsafe extern "C" fn abi_cmd_buf_join(
    _ctx: *const ContextHeader,
    handle: *mut AbiJoinHandle,
) -> AbiStatus {
    // Safety: the handle is consumed here, per the ABI ownership contract.
    let handle = unsafe { Box::from_raw(handle) };
    match handle.handle.join() {
        CmdBufStatus::Completed => AbiStatus::Ok,
        _ => AbiStatus::Closed,
    }
}

unsafe extern "C" fn abi_cmd_buf_detach(_ctx: *const ContextHeader, handle: *mut AbiJoinHandle) {
    // Safety: the handle is consumed here.
    let handle = unsafe { Box::from_raw(handle) };
    handle.handle.detach();
}

unsafe extern "C" fn abi_cmd_buf_cancel(
    _ctx: *const ContextHeader,
    handle: *const AbiJoinHandle,
) {
    // Safety: the handle stays owned by the caller.
    unsafe { &(*handle).handle }.cancel();
}

unsafe extern "C" fn abi_cmd_buf_cancel_detach(
    _ctx: *const ContextHeader,
    handle: *mut AbiJoinHandle,
) {
    // Safety: the handle is consumed here.
    let handle = unsafe { Box::from_raw(handle) };
    handle.handle.cancel_detach();
}

unsafe extern "C" fn abi_cmd_buf_cancel_requested(_ctx: *const ContextHeader) -> u8 {
    u8::from(task::cancel_requested())
}

// === futex ===

fn filter_from(token: *const usize) -> WakeFilter {
    if token.is_null() {
        WakeFilter::Any
    } else {
        // Safety: non-null filter tokens point to a valid usize.
        WakeFilter::Token(unsafe { *token })
    }
}

unsafe extern "C" fn abi_futex_wait(
    _ctx: *const ContextHeader,
    pool: *const AbiPool,
    addr: *const c_void,
    size: usize,
    expected: u64,
    token: usize,
    deadline_nanos: u64,
) -> AbiStatus {
    let deadline = deadline_from_nanos(deadline_nanos);
    // Safety: handles are live per the ABI ownership contract.
    let pool = unsafe { &(*pool).pool };

    if task::current_task_id().is_some() {
        // a task parks cooperatively through its own scheduler
        // Safety: key contract forwarded to the consumer.
        status_of(unsafe { task::wait(addr.cast(), size, expected, deadline) })
    } else {
        // Safety: key contract forwarded to the consumer.
        match unsafe { pool.futex().wait(addr.cast(), size, expected, token, deadline) } {
            Ok(()) => AbiStatus::Ok,
            Err(err) => Error::from(err).into(),
        }
    }
}

unsafe extern "C" fn abi_futex_wait_v(
    _ctx: *const ContextHeader,
    pool: *const AbiPool,
    keys: *const AbiKeyExpect,
    keys_len: usize,
    token: usize,
    deadline_nanos: u64,
    out_index: *mut usize,
) -> AbiStatus {
    let deadline = deadline_from_nanos(deadline_nanos);
    // Safety: handles are live per the ABI ownership contract; the caller
    // passed `keys_len` valid keys.
    let (pool, keys) = unsafe { (&(*pool).pool, std::slice::from_raw_parts(keys, keys_len)) };

    let keys: Vec<KeyExpect> = keys
        .iter()
        .map(|key| KeyExpect {
            addr: key.addr.cast(),
            size: key.size,
            expected: key.expected,
        })
        .collect();

    // Safety: key contract forwarded to the consumer.
    match unsafe { pool.futex().wait_v(&keys, token, deadline) } {
        Ok(index) => {
            // Safety: the caller passed a valid out pointer.
            unsafe { *out_index = index };
            AbiStatus::Ok
        }
        Err(err) => Error::from(err).into(),
    }
}

unsafe extern "C" fn abi_futex_wake(
    _ctx: *const ContextHeader,
    pool: *const AbiPool,
    addr: *const c_void,
    max: usize,
    filter_token: *const usize,
) -> usize {
    // Safety: handles are live per the ABI ownership contract.
    let pool = unsafe { &(*pool).pool };
    pool.futex().wake(addr.cast(), max, filter_from(filter_token))
}

unsafe extern "C" fn abi_futex_requeue(
    _ctx: *const ContextHeader,
    pool: *const AbiPool,
    from: *const c_void,
    to: *const c_void,
    size: usize,
    expected: u64,
    max_wakes: usize,
    max_requeues: usize,
    filter_token: *const usize,
    out_woken: *mut usize,
    out_requeued: *mut usize,
) -> AbiStatus {
    // Safety: handles are live per the ABI ownership contract.
    let pool = unsafe { &(*pool).pool };
    // Safety: key contract forwarded to the consumer.
    match unsafe {
        pool.futex().requeue(
            from.cast(),
            to.cast(),
            size,
            expected,
            max_wakes,
            max_requeues,
            filter_from(filter_token),
        )
    } {
        Ok(requeued) => {
            // Safety: the caller passed valid out pointers.
            unsafe {
                *out_woken = requeued.woken;
                *out_requeued = requeued.requeued;
            }
            AbiStatus::Ok
        }
        Err(err) => Error::from(err).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VERSION;

    #[test]
    fn vtable_version_gate() {
        let ctx = Context::new();
        let header = ctx.header();
        // Safety: the header is live and the vtable was installed by us.
        let vtable = unsafe { (*header).vtable };

        let ok = VERSION;
        // Safety: valid header + version pointers.
        assert_eq!(
            unsafe { (vtable.check_version)(header, &raw const ok) },
            AbiStatus::Ok
        );

        let too_new = Version::new(VERSION.major + 1, 0, 0);
        // Safety: as above.
        assert_eq!(
            unsafe { (vtable.check_version)(header, &raw const too_new) },
            AbiStatus::VersionNotSupported
        );
    }

    #[test]
    fn refcount_through_the_vtable() {
        let ctx = Context::new();
        let header = ctx.header();
        // Safety: the header is live.
        let vtable = unsafe { (*header).vtable };

        // Safety: acquire/release are balanced below.
        unsafe {
            (vtable.core.acquire)(header);
            assert_eq!(ctx.refcount(), 2);
            (vtable.core.release)(header);
        }
        assert_eq!(ctx.refcount(), 1);
    }

    #[test]
    fn end_to_end_through_the_vtable() {
        use std::sync::atomic::{AtomicU32, Ordering};

        static COUNTER: AtomicU32 = AtomicU32::new(0);

        unsafe extern "C" fn bump(arg: *mut c_void) {
            // Safety: arg points at COUNTER.
            let counter = unsafe { &*arg.cast::<AtomicU32>() };
            counter.fetch_add(1, Ordering::AcqRel);
        }

        let ctx = Context::new();
        let header = ctx.header();
        // Safety: the header is live; every handle below follows the
        // ownership contract of its slot.
        unsafe {
            let vtable = (*header).vtable;

            let config = AbiPoolConfig {
                label: c"abi-pool".as_ptr(),
                worker_count: 2,
                stacks: std::ptr::null(),
                stacks_len: 0,
                cmd_buf_capacity: 8,
                max_load_factor: 4,
                is_queryable: 1,
            };
            let mut pool: *mut AbiPool = std::ptr::null_mut();
            assert_eq!(
                (vtable.pool.create_pool)(header, &raw const config, &raw mut pool),
                AbiStatus::Ok
            );

            let buf = (vtable.cmd_buf.create)(header);
            for _ in 0..4 {
                (vtable.cmd_buf.spawn)(
                    header,
                    buf,
                    bump,
                    std::ptr::from_ref(&COUNTER).cast_mut().cast(),
                    -1,
                );
            }

            let mut handle: *mut AbiJoinHandle = std::ptr::null_mut();
            assert_eq!(
                (vtable.cmd_buf.enqueue)(header, pool, buf, &raw mut handle),
                AbiStatus::Ok
            );
            assert_eq!((vtable.cmd_buf.join)(header, handle), AbiStatus::Ok);
            assert_eq!(COUNTER.load(Ordering::Acquire), 4);

            (vtable.pool.destroy_pool)(header, pool);
        }
    }
}
