// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! weft — a user-space cooperative task runtime.
//!
//! weft multiplexes stackful, cooperatively scheduled [tasks](task) onto a
//! [`Pool`] of OS worker threads. Tasks are submitted in batches
//! ([`CommandBuffer`]) that share a join/cancel fate, suspend themselves
//! explicitly (`yield_now`, `sleep`, `wait`), and communicate through the
//! pool's address-keyed futex and a family of lock-free channels.
//!
//! ```
//! use weft::{CommandBuffer, Pool, PoolConfig};
//!
//! let pool = Pool::new(PoolConfig {
//!     worker_count: 2,
//!     ..PoolConfig::default()
//! })
//! .unwrap();
//!
//! let mut buf = pool.command_buffer();
//! for i in 0..4 {
//!     buf.spawn(move || {
//!         weft::task::yield_now();
//!         println!("hello from task {i}");
//!     });
//! }
//!
//! pool.enqueue(buf).unwrap().join();
//! ```
//!
//! The runtime can be embedded behind a reference-counted [`Context`] object
//! with a stable C [`abi`], so multiple independent runtimes can coexist in
//! one process; there is no global state outside the context.

pub mod abi;
mod cmd_buf;
mod context;
mod error;
mod pool;
pub mod task;
mod timer;
pub mod trace;
mod worker;

pub use cmd_buf::{CmdBufStatus, CommandBuffer, JoinHandle, TaskOptions};
pub use context::{Context, ContextHeader, VERSION, Version};
pub use error::Error;
pub use pool::{Pool, PoolConfig, PoolStackConfig, current_pool};
pub use task::{LocalKey, TaskId, TaskState};

// Channel and futex primitives are part of the public surface; higher layers
// build their own synchronization on them.
pub use weft_channel as channel;
pub use weft_fiber::{MAX_STACK_SIZE, MIN_STACK_SIZE, StackClass};
pub use weft_futex::{Futex, KeyExpect, RawWaiter, RawWaiterVTable, WaitError, WakeFilter};
