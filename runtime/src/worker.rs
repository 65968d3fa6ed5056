// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker event loop.
//!
//! Each worker alternates between two things: receiving the next runnable
//! task from a multi-source over its private queue and the pool-wide ready
//! queue, and interpreting the [`TaskMessage`] the task leaves behind when it
//! switches back.
//!
//! The per-poll preference between the private and the shared queue follows
//! a load-balancing rule: when the shared queue holds more than a worker's
//! fair share (`global / worker_count > local`), the shared queue is
//! consulted first; otherwise the private queue wins. This keeps fan-out
//! balanced without any central dispatcher.

use crate::pool::PoolInner;
use crate::task::{CURRENT, SchedMessage, Task, TaskMessage, TaskRef, TaskState};
use crate::trace;
use std::sync::Arc;
use std::time::Instant;
use weft_channel::select::{MultiReceiver2, Select2};
use weft_channel::{Closed, mpsc, unbounded};

pub(crate) struct Worker {
    index: usize,
    pool: Arc<PoolInner>,
    /// This worker's private queue; other workers and the scheduler push
    /// woken and pinned tasks here.
    local_rx: mpsc::Receiver<Task>,
    /// The pool-wide queue of unpinned ready tasks.
    global_rx: unbounded::Receiver<TaskRef>,
}

// === impl Worker ===

impl Worker {
    pub(crate) fn new(
        index: usize,
        pool: Arc<PoolInner>,
        local_rx: mpsc::Receiver<Task>,
        global_rx: unbounded::Receiver<TaskRef>,
    ) -> Self {
        global_rx.set_seed(u64::try_from(index).unwrap());
        Self {
            index,
            pool,
            local_rx,
            global_rx,
        }
    }

    pub(crate) fn run(&self) {
        let _span =
            tracing::debug_span!("worker main loop", worker = self.index).entered();
        let _registration = trace::register_thread(&format!("worker-{}", self.index));

        CURRENT.with(|cur| cur.set_worker(Some(self.index)));
        self.pool.install_on_worker_thread();

        let multi = MultiReceiver2::new(self.pool.futex(), &self.local_rx, &self.global_rx);

        loop {
            // Load-balancing skew: prefer the shared queue while it holds
            // more than our fair share of the pending work.
            let fair_share = self.global_rx.len() / self.pool.worker_count();
            let first = usize::from(fair_share > self.local_rx.len());

            let task = match multi.recv_from(first) {
                Ok(Select2::First(task) | Select2::Second(task)) => task,
                Err(Closed) => break,
            };

            self.dispatch(task);
        }

        tracing::debug!(worker = self.index, "queues closed, shutting down");
        CURRENT.with(|cur| cur.set_worker(None));
    }

    /// Runs `task` until it switches back, then interprets its message.
    fn dispatch(&self, task_ref: TaskRef) {
        // Safety: queued tasks are live.
        let task = unsafe { task_ref.get() };

        let bound = task.bind_worker(self.index);
        debug_assert_eq!(
            bound, self.index,
            "a task bound to another worker ended up on this queue"
        );

        let first_run = task.state() == TaskState::Init;
        task.set_state(TaskState::Running);
        task.call_stack().resume();

        tracing::trace!(task.id = task.id().as_u64(), first_run, "dispatching");

        // Make the task visible to the in-task API and switch the tracing
        // call stack for the duration of the dispatch.
        let prev_stack = trace::switch_call_stack(std::ptr::from_ref(task.call_stack()));
        CURRENT.with(|cur| cur.set_task(task_ref.as_ptr().as_ptr()));

        let context = task.take_context();
        let data = if first_run {
            task_ref.as_ptr().as_ptr() as usize
        } else {
            0
        };
        // Safety: the context was saved by this task's most recent suspension
        // (or freshly initialized); its stack is owned by the task.
        let transfer = unsafe { context.switch(data) };

        CURRENT.with(|cur| cur.set_task(std::ptr::null()));
        trace::switch_call_stack(prev_stack);

        // The task switched back, leaving a message on its (still suspended)
        // stack.
        // Safety: the message outlives the switch; it lives in the frame that
        // performed it.
        let msg = unsafe { &*(transfer.data as *const TaskMessage) };

        match *msg {
            TaskMessage::Complete { is_error } => {
                task.set_state(if is_error {
                    TaskState::Aborted
                } else {
                    TaskState::Completed
                });
                // After-exit: the suspended context is dead, the stack can go
                // back to its pool. (`msg` is read out above and not touched
                // again.)
                drop(transfer.context);
                task.release_stack();

                task.set_sched_msg(SchedMessage::Complete { is_error });
                self.forward_to_scheduler(task_ref);
            }
            TaskMessage::Yield => {
                task.store_context(transfer.context);
                self.push_local(task_ref);
            }
            TaskMessage::Sleep { deadline } => {
                task.store_context(transfer.context);
                if deadline <= Instant::now() {
                    // already due; equivalent to a yield
                    self.push_local(task_ref);
                } else {
                    task.set_state(TaskState::Parked);
                    task.call_stack().suspend(false);
                    task.set_sched_msg(SchedMessage::Sleep { deadline });
                    self.forward_to_scheduler(task_ref);
                }
            }
            TaskMessage::Wait {
                addr,
                size,
                expected,
                deadline,
            } => {
                task.store_context(transfer.context);
                if deadline.is_some_and(|deadline| deadline <= Instant::now()) {
                    task.set_timed_out(true);
                    self.push_local(task_ref);
                } else {
                    task.set_state(TaskState::Parked);
                    task.call_stack().suspend(true);
                    task.set_sched_msg(SchedMessage::Wait {
                        addr,
                        size,
                        expected,
                        deadline,
                    });
                    self.forward_to_scheduler(task_ref);
                }
            }
        }
    }

    /// Requeues a task at the back of this worker's own queue.
    fn push_local(&self, task_ref: TaskRef) {
        self.pool
            .local_sender(self.index)
            .send(task_ref)
            .expect("worker queue closed while the worker still runs");
    }

    fn forward_to_scheduler(&self, task_ref: TaskRef) {
        self.pool
            .sched_sender()
            .send(task_ref)
            .expect("scheduler channel closed while workers still run");
    }
}
