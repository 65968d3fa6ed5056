// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An address-keyed wait/wake primitive ("futex") for weft.
//!
//! A [`Futex`] lets any number of waiters block on an arbitrary memory
//! address until another party changes the value stored there and wakes them.
//! The key is a byte address plus a key size (1, 2, 4 or 8 bytes) and an
//! expected value: [`Futex::wait`] atomically re-checks `*key == expected`
//! before parking, so a waker that publishes its state change with a release
//! store *before* calling [`Futex::wake`] can never be missed.
//!
//! Waiters attach an opaque `usize` *token* to their wait entry; wakers can
//! filter on it ([`WakeFilter`]), which lets multi-queue primitives (such as
//! reader/writer locks) selectively wake one class of waiters.
//! [`Futex::requeue`] relocates waiters from one address to another without
//! waking them, the classic condvar-to-mutex optimization.
//!
//! Internally the futex is a hash table of wait queues: the key address
//! hashes to one of a power-of-two number of buckets, each guarded by its own
//! mutex and holding an intrusive queue of wait entries. Thread waiters park
//! on their own stack entry; the runtime parks *tasks* through the type-erased
//! [`RawWaiter`] callback interface instead, so a task wait never blocks an
//! OS thread.

mod entry;
mod raw;

pub use raw::{RawWaiter, RawWaiterVTable, WaitId};

use cordyceps::List;
use entry::{Entry, FireCell, Waiter};
use std::fmt;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread;
use std::time::Instant;
use weft_util::CachePadded;

/// Errors returned by the wait family of operations.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitError {
    /// The key size is not one of 1, 2, 4, 8, or the address is not aligned
    /// to it. Nothing was registered.
    KeyError,
    /// The expected-value check failed; the caller should re-examine its
    /// state and retry. Nothing was registered.
    Invalid,
    /// The deadline elapsed before a matching wake arrived.
    Timeout,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::KeyError => f.write_str("invalid key size or alignment"),
            WaitError::Invalid => f.write_str("expected value check failed"),
            WaitError::Timeout => f.write_str("deadline elapsed"),
        }
    }
}

impl core::error::Error for WaitError {}

/// Selects which wait entries a [`Futex::wake`] or [`Futex::requeue`] call
/// applies to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WakeFilter {
    /// Match every entry on the key.
    Any,
    /// Match only entries whose token equals the given value.
    Token(usize),
}

impl WakeFilter {
    #[inline]
    fn matches(&self, token: usize) -> bool {
        match *self {
            WakeFilter::Any => true,
            WakeFilter::Token(t) => t == token,
        }
    }
}

/// One key of a multi-key [`Futex::wait_v`] call.
#[derive(Debug, Clone, Copy)]
pub struct KeyExpect {
    /// Byte address of the key.
    pub addr: *const (),
    /// Key size in bytes; one of 1, 2, 4, 8.
    pub size: usize,
    /// The value `*addr` must still hold for the wait to be registered.
    pub expected: u64,
}

/// The outcome of a [`Futex::requeue`] call.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Requeued {
    /// Entries woken from the source key.
    pub woken: usize,
    /// Entries relocated to the destination key.
    pub requeued: usize,
}

struct Bucket {
    queue: Mutex<List<Entry>>,
}

struct Table {
    buckets: Box<[Bucket]>,
}

/// An address-keyed wait/wake table. See the [crate docs](crate) for an
/// overview.
pub struct Futex {
    table: RwLock<Table>,
    /// Number of currently linked wait entries, across all buckets. Updated
    /// by every registration and wake, so it gets its own cache line.
    len: CachePadded<AtomicUsize>,
    /// Maximum average number of waiters per bucket before the table grows.
    max_load_factor: usize,
}

/// A wakeup harvested from a bucket, performed after the lock is released.
enum Wakeup {
    Thread(thread::Thread),
    Raw(RawWaiter, NonNull<Entry>),
}

// === impl Table ===

impl Table {
    fn with_buckets(n: usize) -> Self {
        let buckets = (0..n)
            .map(|_| Bucket {
                queue: Mutex::new(List::new()),
            })
            .collect();
        Self { buckets }
    }

    /// Maps a key address to its bucket index.
    #[inline]
    fn bucket_index(&self, addr: usize) -> usize {
        // Fibonacci hashing; the low bits of raw addresses are poorly
        // distributed because of alignment.
        let hash = addr.wrapping_mul(0x9E37_79B9_7F4A_7C15_usize);
        (hash >> 7) & (self.buckets.len() - 1)
    }

    #[inline]
    fn bucket_for(&self, addr: usize) -> &Bucket {
        &self.buckets[self.bucket_index(addr)]
    }
}

// === impl Futex ===

impl Default for Futex {
    fn default() -> Self {
        Self::new()
    }
}

impl Futex {
    pub const DEFAULT_BUCKETS: usize = 64;
    pub const DEFAULT_MAX_LOAD_FACTOR: usize = 4;
    const MAX_BUCKETS: usize = 1 << 16;

    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(Self::DEFAULT_BUCKETS, Self::DEFAULT_MAX_LOAD_FACTOR)
    }

    /// Creates a futex with the given initial bucket count (rounded up to a
    /// power of two) and load factor cap.
    ///
    /// # Panics
    ///
    /// Panics if `max_load_factor` is zero.
    #[must_use]
    pub fn with_settings(initial_buckets: usize, max_load_factor: usize) -> Self {
        assert!(max_load_factor > 0, "max_load_factor must be non-zero");
        let n = initial_buckets
            .clamp(1, Self::MAX_BUCKETS)
            .next_power_of_two();
        Self {
            table: RwLock::new(Table::with_buckets(n)),
            len: CachePadded(AtomicUsize::new(0)),
            max_load_factor,
        }
    }

    /// The number of currently registered wait entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks the calling thread until the key is woken, the deadline
    /// expires, or the expected-value check fails.
    ///
    /// Atomically (with respect to wakers of the same key) checks
    /// `*addr == expected` under the bucket lock: on mismatch the call
    /// returns [`WaitError::Invalid`] without parking. Otherwise the entry is
    /// registered with `token` and the thread parks until a matching
    /// [`wake`](Self::wake) or [`requeue`](Self::requeue) dequeues it.
    ///
    /// # Errors
    ///
    /// [`WaitError::KeyError`] for a bad size/alignment, [`WaitError::Invalid`]
    /// when the check fails, [`WaitError::Timeout`] when `deadline` elapses.
    ///
    /// # Safety
    ///
    /// `addr` must point to `size` bytes of memory that remain valid for the
    /// duration of the call and are only mutated through atomic operations.
    pub unsafe fn wait(
        &self,
        addr: *const (),
        size: usize,
        expected: u64,
        token: usize,
        deadline: Option<Instant>,
    ) -> Result<(), WaitError> {
        check_key(addr, size)?;

        let fired = FireCell::new();
        let mut entry = Entry::new(
            addr as usize,
            token,
            Waiter::Thread {
                thread: thread::current(),
                fired: NonNull::from(&fired),
                index: 0,
            },
        );
        // Safety: `entry` is not moved again until it has been unlinked.
        let entry = unsafe { Pin::new_unchecked(&mut entry) };

        {
            let table = self.table.read().unwrap();
            let bucket = table.bucket_for(addr as usize);
            let mut queue = bucket.queue.lock().unwrap();

            // Safety: caller promised the key memory is valid; we hold the
            // bucket lock, so a waker that stored a new value before locking
            // this bucket is observed here.
            if unsafe { load_key(addr as usize, size) } != expected {
                return Err(WaitError::Invalid);
            }

            // Safety: the entry is pinned for the duration of the wait.
            unsafe { self.link(&mut queue, entry.as_ref().get_ref().into()) };
        }

        self.maybe_grow();

        if park_until(&fired, deadline) {
            return Ok(());
        }

        // Timed out (or a spurious deadline race): remove ourselves. If a
        // waker got to the entry first it is already unlinked and the wait
        // counts as woken.
        self.unregister(entry.as_ref().get_ref().into());

        if fired.fired() { Ok(()) } else { Err(WaitError::Timeout) }
    }

    /// Blocks on several keys at once; the first matching wake resolves the
    /// call with the index of the key that fired.
    ///
    /// Registration is all-or-none: a bad size or alignment anywhere fails
    /// the whole call with [`WaitError::KeyError`] before anything is
    /// registered, and a failed expected-value check unregisters everything
    /// registered so far and returns [`WaitError::Invalid`] without parking.
    ///
    /// # Errors
    ///
    /// See [`Futex::wait`]; on success, returns the index into `keys` of the
    /// key that was woken.
    ///
    /// # Safety
    ///
    /// Every key must satisfy the conditions of [`Futex::wait`].
    pub unsafe fn wait_v(
        &self,
        keys: &[KeyExpect],
        token: usize,
        deadline: Option<Instant>,
    ) -> Result<usize, WaitError> {
        for key in keys {
            check_key(key.addr, key.size)?;
        }
        if keys.is_empty() {
            return Err(WaitError::KeyError);
        }

        let fired = FireCell::new();
        let me = thread::current();

        let entries: Box<[Entry]> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                Entry::new(
                    key.addr as usize,
                    token,
                    Waiter::Thread {
                        thread: me.clone(),
                        fired: NonNull::from(&fired),
                        index: isize::try_from(i).unwrap(),
                    },
                )
            })
            .collect();

        // Register one key at a time; roll back on the first failed check.
        for (i, key) in keys.iter().enumerate() {
            let table = self.table.read().unwrap();
            let bucket = table.bucket_for(key.addr as usize);
            let mut queue = bucket.queue.lock().unwrap();

            // Safety: caller promised the key memory is valid.
            if unsafe { load_key(key.addr as usize, key.size) } != key.expected {
                drop(queue);
                drop(table);
                for entry in &entries[..i] {
                    self.unregister(entry.into());
                }
                return Err(WaitError::Invalid);
            }

            // Safety: the entries box is not moved until all are unlinked.
            unsafe { self.link(&mut queue, NonNull::from(&entries[i])) };
        }

        self.maybe_grow();

        let fired_now = park_until(&fired, deadline);

        // Unregister whatever is still linked; entries the wakers already
        // dequeued are skipped. This must happen even on the happy path since
        // only the fired entry was dequeued by the waker.
        for entry in &entries[..] {
            self.unregister(entry.into());
        }

        match fired.index() {
            Some(index) => Ok(index),
            None => {
                debug_assert!(!fired_now);
                Err(WaitError::Timeout)
            }
        }
    }

    /// Registers a non-blocking wait entry whose wakeup is delivered through
    /// `waiter`'s vtable instead of parking the calling thread.
    ///
    /// Used by the task runtime to park *tasks* on a key: the returned
    /// [`WaitId`] can later be passed to [`Futex::cancel`] (e.g. from a timer)
    /// to withdraw the entry if it has not been woken yet.
    ///
    /// # Errors
    ///
    /// [`WaitError::KeyError`] / [`WaitError::Invalid`] exactly like
    /// [`Futex::wait`]; nothing is registered on error.
    ///
    /// # Safety
    ///
    /// `addr` must satisfy the conditions of [`Futex::wait`] and `waiter`'s
    /// data pointer must stay valid until the waiter is woken or cancelled.
    pub unsafe fn wait_raw(
        &self,
        addr: *const (),
        size: usize,
        expected: u64,
        token: usize,
        waiter: RawWaiter,
    ) -> Result<WaitId, WaitError> {
        check_key(addr, size)?;

        let id = WaitId::next();
        let entry = Box::new(Entry::with_id(
            addr as usize,
            token,
            Waiter::Raw(waiter),
            id,
        ));

        {
            let table = self.table.read().unwrap();
            let bucket = table.bucket_for(addr as usize);
            let mut queue = bucket.queue.lock().unwrap();

            // Safety: caller promised the key memory is valid.
            if unsafe { load_key(addr as usize, size) } != expected {
                return Err(WaitError::Invalid);
            }

            // Safety: the box is leaked below; the queue owns it until the
            // entry is woken or cancelled.
            unsafe { self.link(&mut queue, NonNull::from(Box::leak(entry))) };
        }

        self.maybe_grow();
        Ok(id)
    }

    /// Withdraws a [`wait_raw`](Self::wait_raw) entry that has not been woken
    /// yet, returning its waiter. Returns `None` if the entry was already
    /// woken (or never existed); the race between a wake and a cancel is
    /// resolved by whoever dequeues the entry first.
    pub fn cancel(&self, id: WaitId) -> Option<RawWaiter> {
        let table = self.table.read().unwrap();
        for bucket in &table.buckets {
            let mut queue = bucket.queue.lock().unwrap();
            let mut found = None;

            let mut kept = List::new();
            while let Some(ptr) = queue.pop_front() {
                // Safety: entries are valid while linked.
                let entry = unsafe { ptr.as_ref() };
                if found.is_none() && entry.id() == Some(id) {
                    found = Some(ptr);
                } else {
                    kept.push_back(ptr);
                }
            }
            *queue = kept;
            drop(queue);

            if let Some(ptr) = found {
                self.len.fetch_sub(1, Ordering::Release);
                // Safety: raw entries are boxed; we just unlinked it, so we
                // own it now.
                let entry = unsafe { Box::from_raw(ptr.as_ptr()) };
                match entry.into_waiter() {
                    Waiter::Raw(waiter) => return Some(waiter),
                    Waiter::Thread { .. } => unreachable!("thread entries carry no id"),
                }
            }
        }
        None
    }

    /// Wakes up to `max` entries waiting on `addr` whose tokens satisfy
    /// `filter`, returning the number actually woken.
    pub fn wake(&self, addr: *const (), max: usize, filter: WakeFilter) -> usize {
        let mut wakeups = Vec::new();

        {
            let table = self.table.read().unwrap();
            let bucket = table.bucket_for(addr as usize);
            let mut queue = bucket.queue.lock().unwrap();

            self.collect_wakeups(&mut queue, addr as usize, max, filter, &mut wakeups);
        }

        // Wake outside the lock so woken threads don't immediately contend on
        // the bucket.
        let woken = wakeups.len();
        for wakeup in wakeups {
            wakeup.fire();
        }
        woken
    }

    /// Re-checks `*from == expected`, wakes up to `max_wakes` matching
    /// entries on `from`, then relocates up to `max_requeues` further
    /// matching entries onto `to` (adjusting their key) without waking them.
    ///
    /// # Errors
    ///
    /// [`WaitError::KeyError`] for a bad size/alignment,
    /// [`WaitError::Invalid`] when the expected-value check fails (nothing is
    /// woken or moved).
    ///
    /// # Safety
    ///
    /// `from` must satisfy the conditions of [`Futex::wait`].
    pub unsafe fn requeue(
        &self,
        from: *const (),
        to: *const (),
        size: usize,
        expected: u64,
        max_wakes: usize,
        max_requeues: usize,
        filter: WakeFilter,
    ) -> Result<Requeued, WaitError> {
        check_key(from, size)?;
        check_key(to, size)?;

        let mut wakeups = Vec::new();
        let mut result = Requeued::default();

        {
            let table = self.table.read().unwrap();
            let from_idx = table.bucket_index(from as usize);
            let to_idx = table.bucket_index(to as usize);

            // Lock both buckets in address order; this is the only place two
            // bucket locks are held at once.
            let (from_queue, to_queue) = if from_idx == to_idx {
                (table.buckets[from_idx].queue.lock().unwrap(), None)
            } else {
                let (first, second) = if from_idx < to_idx {
                    (from_idx, to_idx)
                } else {
                    (to_idx, from_idx)
                };
                let first_guard = table.buckets[first].queue.lock().unwrap();
                let second_guard = table.buckets[second].queue.lock().unwrap();
                if from_idx < to_idx {
                    (first_guard, Some(second_guard))
                } else {
                    (second_guard, Some(first_guard))
                }
            };
            let mut from_queue = from_queue;

            // Safety: caller promised the key memory is valid.
            if unsafe { load_key(from as usize, size) } != expected {
                return Err(WaitError::Invalid);
            }

            result.woken = self.collect_wakeups(
                &mut from_queue,
                from as usize,
                max_wakes,
                filter,
                &mut wakeups,
            );

            // Relocate the remaining matches.
            let mut kept = List::new();
            let mut to_guard = to_queue;
            while let Some(ptr) = from_queue.pop_front() {
                // Safety: entries are valid while linked.
                let entry = unsafe { ptr.as_ref() };
                let matches = entry.addr() == from as usize
                    && filter.matches(entry.token())
                    && result.requeued < max_requeues
                    && !entry.is_dead();
                if matches {
                    entry.set_addr(to as usize);
                    match to_guard.as_mut() {
                        Some(to_queue) => to_queue.push_back(ptr),
                        None => kept.push_back(ptr),
                    }
                    result.requeued += 1;
                } else {
                    kept.push_back(ptr);
                }
            }
            *from_queue = kept;
        }

        debug_assert_eq!(result.woken, wakeups.len());
        for wakeup in wakeups {
            wakeup.fire();
        }
        Ok(result)
    }

    /// Scans `queue` for up to `max` live entries matching `addr`/`filter`,
    /// unlinking them and pushing their wakeups. Dead entries (multi-key
    /// siblings whose wait already fired) are unlinked for free without
    /// counting. Returns the number of wakeups collected.
    fn collect_wakeups(
        &self,
        queue: &mut List<Entry>,
        addr: usize,
        max: usize,
        filter: WakeFilter,
        wakeups: &mut Vec<Wakeup>,
    ) -> usize {
        let mut woken = 0;
        let mut kept = List::new();

        while let Some(ptr) = queue.pop_front() {
            // Safety: entries are valid while linked.
            let entry = unsafe { ptr.as_ref() };

            if entry.addr() != addr || !filter.matches(entry.token()) || woken >= max {
                kept.push_back(ptr);
                continue;
            }

            match entry.try_fire() {
                Ok(fired) => {
                    entry.mark_unlinked();
                    self.len.fetch_sub(1, Ordering::Release);
                    wakeups.push(match fired {
                        entry::Fired::Thread(thread) => Wakeup::Thread(thread),
                        entry::Fired::Raw(waiter) => Wakeup::Raw(waiter, ptr),
                    });
                    woken += 1;
                }
                Err(()) => {
                    // A sibling entry of an already-fired multi-key wait;
                    // drop it from the queue without counting it.
                    entry.mark_unlinked();
                    self.len.fetch_sub(1, Ordering::Release);
                }
            }
        }

        *queue = kept;
        woken
    }

    /// Links an entry into a locked bucket queue.
    ///
    /// # Safety
    ///
    /// The entry must stay pinned until it is unlinked again.
    unsafe fn link(&self, queue: &mut List<Entry>, entry: NonNull<Entry>) {
        // Safety: ensured by caller.
        unsafe { entry.as_ref() }.mark_linked();
        queue.push_back(entry);
        self.len.fetch_add(1, Ordering::Release);
    }

    /// Unlinks `entry` if it is still linked, walking it down through
    /// concurrent requeues. No-op if a waker already dequeued it.
    fn unregister(&self, entry: NonNull<Entry>) {
        // Safety: the entry outlives the wait call this is part of.
        let entry_ref = unsafe { entry.as_ref() };

        loop {
            if !entry_ref.is_linked() {
                return;
            }
            let addr = entry_ref.addr();

            let table = self.table.read().unwrap();
            let bucket = table.bucket_for(addr);
            let mut queue = bucket.queue.lock().unwrap();

            if !entry_ref.is_linked() {
                return;
            }
            if entry_ref.addr() != addr {
                // Requeued to a different key while we were acquiring the
                // lock; retry against the new bucket.
                continue;
            }

            // The entry is linked and its key hashes to the bucket we hold.
            // Safety: linked entries are members of exactly this list.
            let removed = unsafe { queue.remove(entry) };
            debug_assert!(removed.is_some());
            entry_ref.mark_unlinked();
            self.len.fetch_sub(1, Ordering::Release);
            return;
        }
    }

    /// Doubles the bucket array when the load factor cap is exceeded.
    fn maybe_grow(&self) {
        let len = self.len.load(Ordering::Acquire);
        {
            let table = self.table.read().unwrap();
            if table.buckets.len() >= Self::MAX_BUCKETS
                || len <= table.buckets.len() * self.max_load_factor
            {
                return;
            }
        }

        let mut table = self.table.write().unwrap();
        let len = self.len.load(Ordering::Acquire);
        if table.buckets.len() >= Self::MAX_BUCKETS
            || len <= table.buckets.len() * self.max_load_factor
        {
            return;
        }

        let mut new_table = Table::with_buckets(table.buckets.len() * 2);
        for bucket in &table.buckets {
            let mut queue = bucket.queue.lock().unwrap();
            while let Some(ptr) = queue.pop_front() {
                // Safety: entries are valid while linked.
                let addr = unsafe { ptr.as_ref() }.addr();
                let idx = new_table.bucket_index(addr);
                new_table.buckets[idx].queue.get_mut().unwrap().push_back(ptr);
            }
        }
        *table = new_table;
    }
}

impl Drop for Futex {
    fn drop(&mut self) {
        // Any remaining entries are raw entries whose owner went away without
        // cancelling; thread entries cannot outlive their (borrowing) wait
        // call. Free the boxes so shutdown doesn't leak.
        let table = self.table.get_mut().unwrap();
        for bucket in &mut table.buckets {
            let queue = bucket.queue.get_mut().unwrap();
            while let Some(ptr) = queue.pop_front() {
                // Safety: raw entries are boxed and owned by the queue.
                let entry = unsafe { Box::from_raw(ptr.as_ptr()) };
                debug_assert!(
                    entry.id().is_some(),
                    "thread wait entry leaked into futex drop"
                );
            }
        }
    }
}

impl fmt::Debug for Futex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Futex")
            .field("len", &self.len())
            .field("max_load_factor", &self.max_load_factor)
            .finish_non_exhaustive()
    }
}

// === impl Wakeup ===

impl Wakeup {
    fn fire(self) {
        match self {
            Wakeup::Thread(thread) => thread.unpark(),
            Wakeup::Raw(waiter, ptr) => {
                // Safety: the raw entry was unlinked by us; we own the box.
                drop(unsafe { Box::from_raw(ptr.as_ptr()) });
                // Safety: the registrar promised the data pointer stays valid
                // until the waiter is woken or cancelled.
                unsafe { waiter.wake() };
            }
        }
    }
}

/// Validates a key's size and alignment.
fn check_key(addr: *const (), size: usize) -> Result<(), WaitError> {
    if !matches!(size, 1 | 2 | 4 | 8) || (addr as usize) % size != 0 {
        return Err(WaitError::KeyError);
    }
    Ok(())
}

/// Loads a key value of the given size, widened to `u64`.
///
/// # Safety
///
/// `addr` must point to `size` bytes of valid memory only mutated atomically,
/// and must be aligned to `size`.
unsafe fn load_key(addr: usize, size: usize) -> u64 {
    // Safety: ensured by caller.
    unsafe {
        match size {
            1 => u64::from((*(addr as *const AtomicU8)).load(Ordering::Acquire)),
            2 => u64::from((*(addr as *const AtomicU16)).load(Ordering::Acquire)),
            4 => u64::from((*(addr as *const AtomicU32)).load(Ordering::Acquire)),
            8 => (*(addr as *const AtomicU64)).load(Ordering::Acquire),
            _ => unreachable!("key size was validated"),
        }
    }
}

/// Parks the calling thread until `fired` resolves or `deadline` elapses.
/// Returns whether the cell fired.
fn park_until(fired: &FireCell, deadline: Option<Instant>) -> bool {
    loop {
        if fired.fired() {
            return true;
        }
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return fired.fired();
                }
                thread::park_timeout(deadline - now);
            }
            None => thread::park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::time::Duration;

    fn key_of<T>(val: &T) -> *const () {
        core::ptr::from_ref(val).cast()
    }

    /// Spin until `futex` holds exactly `n` registered waiters.
    fn wait_for_waiters(futex: &Futex, n: usize) {
        while futex.len() != n {
            std::thread::yield_now();
        }
    }

    #[test]
    fn wait_invalid_without_parking() {
        let futex = Futex::new();
        let key = AtomicU32::new(1);

        let res = unsafe { futex.wait(key_of(&key), 4, 0, 0, None) };
        assert_eq!(res, Err(WaitError::Invalid));
        assert!(futex.is_empty());
    }

    #[test]
    fn wait_rejects_bad_keys() {
        let futex = Futex::new();
        let key = AtomicU32::new(0);

        let res = unsafe { futex.wait(key_of(&key), 3, 0, 0, None) };
        assert_eq!(res, Err(WaitError::KeyError));

        // misaligned for an 8-byte key
        let addr = (key_of(&key) as usize + 4) as *const ();
        let res = unsafe { futex.wait(addr, 8, 0, 0, None) };
        assert_eq!(res, Err(WaitError::KeyError));
    }

    #[test]
    fn wake_unblocks_waiter() {
        let futex = Arc::new(Futex::new());
        let key = Arc::new(AtomicU32::new(0));

        let handle = std::thread::spawn({
            let futex = Arc::clone(&futex);
            let key = Arc::clone(&key);
            move || unsafe { futex.wait(key_of(&*key), 4, 0, 0, None) }
        });

        wait_for_waiters(&futex, 1);
        key.store(1, Ordering::Release);
        assert_eq!(futex.wake(key_of(&*key), 1, WakeFilter::Any), 1);

        assert_eq!(handle.join().unwrap(), Ok(()));
        assert!(futex.is_empty());
    }

    #[test]
    fn wait_times_out() {
        let futex = Futex::new();
        let key = AtomicU32::new(0);

        let start = std::time::Instant::now();
        let deadline = start + Duration::from_millis(50);
        let res = unsafe { futex.wait(key_of(&key), 4, 0, 0, Some(deadline)) };

        assert_eq!(res, Err(WaitError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(futex.is_empty());
    }

    #[test]
    fn token_filter_selects_waiters() {
        let futex = Arc::new(Futex::new());
        let key = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::channel();

        let handles: Vec<_> = [1_usize, 2]
            .into_iter()
            .map(|token| {
                let futex = Arc::clone(&futex);
                let key = Arc::clone(&key);
                let tx = tx.clone();
                std::thread::spawn(move || {
                    let res = unsafe { futex.wait(key_of(&*key), 4, 0, token, None) };
                    assert_eq!(res, Ok(()));
                    tx.send(token).unwrap();
                })
            })
            .collect();

        wait_for_waiters(&futex, 2);

        assert_eq!(
            futex.wake(key_of(&*key), usize::MAX, WakeFilter::Token(2)),
            1
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);

        assert_eq!(futex.wake(key_of(&*key), usize::MAX, WakeFilter::Any), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn wait_v_resolves_with_fired_index() {
        let futex = Arc::new(Futex::new());
        let key_a = Arc::new(AtomicU32::new(0));
        let key_b = Arc::new(AtomicU64::new(0));

        let handle = std::thread::spawn({
            let futex = Arc::clone(&futex);
            let key_a = Arc::clone(&key_a);
            let key_b = Arc::clone(&key_b);
            move || {
                let keys = [
                    KeyExpect {
                        addr: key_of(&*key_a),
                        size: 4,
                        expected: 0,
                    },
                    KeyExpect {
                        addr: key_of(&*key_b),
                        size: 8,
                        expected: 0,
                    },
                ];
                unsafe { futex.wait_v(&keys, 0, None) }
            }
        });

        wait_for_waiters(&futex, 2);
        key_b.store(7, Ordering::Release);
        assert_eq!(futex.wake(key_of(&*key_b), 1, WakeFilter::Any), 1);

        assert_eq!(handle.join().unwrap(), Ok(1));
        // the sibling entry on key_a was unregistered on the way out
        assert!(futex.is_empty());
    }

    #[test]
    fn wait_v_bad_size_registers_nothing() {
        let futex = Futex::new();
        let key_a = AtomicU32::new(0);
        let key_b = AtomicU32::new(0);

        let keys = [
            KeyExpect {
                addr: key_of(&key_a),
                size: 4,
                expected: 0,
            },
            KeyExpect {
                addr: key_of(&key_b),
                size: 3,
                expected: 0,
            },
        ];
        let res = unsafe { futex.wait_v(&keys, 0, None) };
        assert_eq!(res, Err(WaitError::KeyError));
        assert!(futex.is_empty());
    }

    #[test]
    fn wait_v_failed_check_rolls_back() {
        let futex = Futex::new();
        let key_a = AtomicU32::new(0);
        let key_b = AtomicU32::new(9);

        let keys = [
            KeyExpect {
                addr: key_of(&key_a),
                size: 4,
                expected: 0,
            },
            KeyExpect {
                addr: key_of(&key_b),
                size: 4,
                expected: 0,
            },
        ];
        let res = unsafe { futex.wait_v(&keys, 0, None) };
        assert_eq!(res, Err(WaitError::Invalid));
        assert!(futex.is_empty());
    }

    #[test]
    fn requeue_moves_waiters() {
        const WAITERS: usize = 10;

        let futex = Arc::new(Futex::new());
        let cv = Arc::new(AtomicU32::new(0));
        let mtx = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                let futex = Arc::clone(&futex);
                let cv = Arc::clone(&cv);
                std::thread::spawn(move || unsafe { futex.wait(key_of(&*cv), 4, 0, 0, None) })
            })
            .collect();

        wait_for_waiters(&futex, WAITERS);

        let res = unsafe {
            futex.requeue(
                key_of(&*cv),
                key_of(&*mtx),
                4,
                0,
                1,
                usize::MAX,
                WakeFilter::Any,
            )
        };
        assert_eq!(
            res,
            Ok(Requeued {
                woken: 1,
                requeued: WAITERS - 1,
            })
        );

        // the requeued waiters now respond to the destination key
        wait_for_waiters(&futex, WAITERS - 1);
        assert_eq!(futex.wake(key_of(&*cv), usize::MAX, WakeFilter::Any), 0);
        assert_eq!(
            futex.wake(key_of(&*mtx), usize::MAX, WakeFilter::Any),
            WAITERS - 1
        );

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
    }

    #[test]
    fn requeue_invalid_when_check_fails() {
        let futex = Futex::new();
        let cv = AtomicU32::new(1);
        let mtx = AtomicU32::new(0);

        let res = unsafe {
            futex.requeue(
                key_of(&cv),
                key_of(&mtx),
                4,
                0,
                1,
                usize::MAX,
                WakeFilter::Any,
            )
        };
        assert_eq!(res, Err(WaitError::Invalid));
    }

    unsafe fn wake_flag(data: *const ()) {
        // Safety: test passes a pointer to a live AtomicU32.
        unsafe { (*data.cast::<AtomicU32>()).store(1, Ordering::Release) }
    }

    static FLAG_VTABLE: RawWaiterVTable = RawWaiterVTable::new(wake_flag);

    #[test]
    fn raw_waiter_is_woken() {
        let futex = Futex::new();
        let key = AtomicU32::new(0);
        let flag = AtomicU32::new(0);

        let waiter = RawWaiter::new(key_of(&flag), &FLAG_VTABLE);
        let id = unsafe { futex.wait_raw(key_of(&key), 4, 0, 0, waiter) }.unwrap();

        key.store(1, Ordering::Release);
        assert_eq!(futex.wake(key_of(&key), 1, WakeFilter::Any), 1);
        assert_eq!(flag.load(Ordering::Acquire), 1);

        // already woken; cancelling is a no-op
        assert!(futex.cancel(id).is_none());
        assert!(futex.is_empty());
    }

    #[test]
    fn raw_waiter_cancel() {
        let futex = Futex::new();
        let key = AtomicU32::new(0);
        let flag = AtomicU32::new(0);

        let waiter = RawWaiter::new(key_of(&flag), &FLAG_VTABLE);
        let id = unsafe { futex.wait_raw(key_of(&key), 4, 0, 0, waiter) }.unwrap();

        let cancelled = futex.cancel(id).expect("entry should still be queued");
        assert_eq!(cancelled.data(), key_of(&flag));
        // a cancelled waiter is never woken by the futex
        assert_eq!(futex.wake(key_of(&key), usize::MAX, WakeFilter::Any), 0);
        assert_eq!(flag.load(Ordering::Acquire), 0);
        assert!(futex.is_empty());
    }

    #[test]
    fn table_grows_without_losing_waiters() {
        const WAITERS: usize = 32;

        let futex = Arc::new(Futex::with_settings(1, 1));
        let keys: Arc<Vec<AtomicU32>> =
            Arc::new((0..WAITERS).map(|_| AtomicU32::new(0)).collect());

        let handles: Vec<_> = (0..WAITERS)
            .map(|i| {
                let futex = Arc::clone(&futex);
                let keys = Arc::clone(&keys);
                std::thread::spawn(move || unsafe {
                    futex.wait(key_of(&keys[i]), 4, 0, 0, None)
                })
            })
            .collect();

        wait_for_waiters(&futex, WAITERS);

        for key in keys.iter() {
            key.store(1, Ordering::Release);
            assert_eq!(futex.wake(key_of(key), 1, WakeFilter::Any), 1);
        }

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
    }
}
