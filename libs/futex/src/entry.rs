// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::raw::{RawWaiter, WaitId};
use cordyceps::{Linked, list};
use std::marker::PhantomPinned;
use std::mem::offset_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::thread::Thread;

/// A wait entry in a futex bucket queue.
///
/// Thread entries live on the waiting thread's stack for the duration of the
/// wait call; raw entries are boxed and owned by the queue until woken or
/// cancelled. All linking and unlinking happens under the bucket lock; the
/// `linked` flag lets the owning side detect concurrent dequeues without
/// touching the list.
pub(crate) struct Entry {
    links: list::Links<Entry>,
    /// The entry's current key address; rewritten by requeue.
    addr: AtomicUsize,
    token: usize,
    linked: AtomicBool,
    id: Option<WaitId>,
    waiter: Waiter,
    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

pub(crate) enum Waiter {
    Thread {
        thread: Thread,
        /// Shared resolution cell of the (possibly multi-key) wait call.
        fired: NonNull<FireCell>,
        /// This entry's index in the wait call's key list.
        index: isize,
    },
    Raw(RawWaiter),
}

/// The wakeup produced by successfully firing an entry.
pub(crate) enum Fired {
    Thread(Thread),
    Raw(RawWaiter),
}

/// Resolution cell shared by all entries of one thread wait call: holds -1
/// while pending, or the index of the key that fired.
pub(crate) struct FireCell {
    which: AtomicIsize,
}

// === impl Entry ===

impl Entry {
    pub(crate) fn new(addr: usize, token: usize, waiter: Waiter) -> Self {
        Self {
            links: list::Links::new(),
            addr: AtomicUsize::new(addr),
            token,
            linked: AtomicBool::new(false),
            id: None,
            waiter,
            _pin: PhantomPinned,
        }
    }

    pub(crate) fn with_id(addr: usize, token: usize, waiter: Waiter, id: WaitId) -> Self {
        Self {
            id: Some(id),
            ..Self::new(addr, token, waiter)
        }
    }

    #[inline]
    pub(crate) fn addr(&self) -> usize {
        self.addr.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_addr(&self, addr: usize) {
        self.addr.store(addr, Ordering::Release);
    }

    #[inline]
    pub(crate) fn token(&self) -> usize {
        self.token
    }

    #[inline]
    pub(crate) fn id(&self) -> Option<WaitId> {
        self.id
    }

    #[inline]
    pub(crate) fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn mark_linked(&self) {
        self.linked.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn mark_unlinked(&self) {
        self.linked.store(false, Ordering::Release);
    }

    /// Whether this entry belongs to a multi-key wait that has already been
    /// resolved through a sibling entry.
    pub(crate) fn is_dead(&self) -> bool {
        match &self.waiter {
            // Safety: the cell outlives all entries that point at it.
            Waiter::Thread { fired, .. } => unsafe { fired.as_ref() }.fired(),
            Waiter::Raw(_) => false,
        }
    }

    /// Attempts to resolve this entry's wait, claiming the right to wake it.
    ///
    /// Fails when the wait was already resolved through a sibling entry; the
    /// entry is then dead weight and may be discarded by the caller.
    pub(crate) fn try_fire(&self) -> Result<Fired, ()> {
        match &self.waiter {
            Waiter::Thread {
                thread,
                fired,
                index,
            } => {
                // Safety: the cell outlives all entries that point at it.
                if unsafe { fired.as_ref() }.try_fire(*index) {
                    Ok(Fired::Thread(thread.clone()))
                } else {
                    Err(())
                }
            }
            Waiter::Raw(waiter) => Ok(Fired::Raw(*waiter)),
        }
    }

    pub(crate) fn into_waiter(self) -> Waiter {
        self.waiter
    }
}

// Safety: entries move between threads through the bucket queues; every
// mutation of shared state goes through atomics or happens under the bucket
// lock, and the `fired` pointer is only dereferenced while the referenced
// wait call is still running (guaranteed by the unlink protocol).
unsafe impl Send for Entry {}
// Safety: see above.
unsafe impl Sync for Entry {}

// Safety: `links` is the first-class intrusive link field of `Entry`;
// entries are pinned while linked (stack entries via `Pin`, raw entries by
// being boxed and never moved out while linked).
unsafe impl Linked<list::Links<Entry>> for Entry {
    type Handle = NonNull<Self>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}

// === impl FireCell ===

impl FireCell {
    pub(crate) fn new() -> Self {
        Self {
            which: AtomicIsize::new(-1),
        }
    }

    #[inline]
    pub(crate) fn fired(&self) -> bool {
        self.which.load(Ordering::Acquire) >= 0
    }

    /// The index of the key that fired, if any.
    pub(crate) fn index(&self) -> Option<usize> {
        usize::try_from(self.which.load(Ordering::Acquire)).ok()
    }

    /// Claims the resolution for key `index`. Only the first claim wins.
    pub(crate) fn try_fire(&self, index: isize) -> bool {
        self.which
            .compare_exchange(-1, index, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
