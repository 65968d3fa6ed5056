// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A virtual function pointer table (vtable) that specifies the behavior of a
/// [`RawWaiter`].
///
/// The pointer passed to the function inside the vtable is the `data` pointer
/// from the enclosing [`RawWaiter`] object.
///
/// # Thread safety
///
/// The `wake` function must be thread-safe: it will be invoked from whatever
/// thread performs the matching [`wake`](crate::Futex::wake) or
/// [`requeue`](crate::Futex::requeue) call, concurrently with anything else
/// the registering party is doing.
pub struct RawWaiterVTable {
    wake: unsafe fn(*const ()),
}

impl RawWaiterVTable {
    #[must_use]
    pub const fn new(wake: unsafe fn(*const ())) -> Self {
        Self { wake }
    }
}

impl fmt::Debug for RawWaiterVTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawWaiterVTable").finish_non_exhaustive()
    }
}

/// A type-erased wakeup target for [`Futex::wait_raw`](crate::Futex::wait_raw):
/// a `data` pointer plus a vtable, in the style of `core::task::RawWaker`.
///
/// The task runtime uses this to park tasks on a futex key: `data` points at
/// the parked task and `wake` hands it back to its worker.
#[derive(Clone, Copy, Debug)]
pub struct RawWaiter {
    data: *const (),
    vtable: &'static RawWaiterVTable,
}

// Safety: as part of the safety contract of `RawWaiterVTable`, the registrar
// promised `wake` is thread-safe and `data` may cross threads.
unsafe impl Send for RawWaiter {}
// Safety: see above.
unsafe impl Sync for RawWaiter {}

impl RawWaiter {
    #[must_use]
    pub const fn new(data: *const (), vtable: &'static RawWaiterVTable) -> Self {
        Self { data, vtable }
    }

    /// The `data` pointer this waiter was created with.
    #[must_use]
    pub fn data(&self) -> *const () {
        self.data
    }

    /// Delivers the wakeup.
    ///
    /// # Safety
    ///
    /// May be called at most once; the registrar's `data` contract must still
    /// hold.
    pub unsafe fn wake(self) {
        // Safety: ensured by caller.
        unsafe { (self.vtable.wake)(self.data) }
    }
}

/// An opaque identifier for a registered [`RawWaiter`] entry, used to cancel
/// it before it is woken.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct WaitId(u64);

impl WaitId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}
