// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bounded single-producer, multi-consumer channel backed by a sum tree.
//!
//! The channel owns a power-of-two array of element slots plus a binary tree
//! of `2 * capacity - 1` occupancy counters: each inner node holds the number
//! of filled slots beneath it, the root holds the total. Two flag bits are
//! embedded in the root counter: `closed` (top bit) and `waiting` (the bit
//! below it); consumers park on the root counter's address through the
//! pool's futex.
//!
//! The producer inserts by descending from the root towards a non-full
//! subtree, writing the slot, then incrementing every counter on the path
//! back up to the root (root last, with release ordering). Consumers extract
//! by first reserving one element at the root with a CAS decrement, then
//! descending and decrementing one counter per level; the root reservation
//! guarantees a filled slot exists in some subtree, so the descent can only
//! ever be delayed, never lost. Which child a descent prefers is steered by
//! the bits of a caller-supplied *seed*, consumed LSB-first, which lets
//! callers spread contention across the tree without any per-slot locking.

use crate::{Closed, RecvTimeoutError, TryRecvError, TrySendError};
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use weft_futex::{Futex, KeyExpect, WaitError, WakeFilter};
use weft_util::Backoff;

const CLOSED: u64 = 1 << 63;
const WAITING: u64 = 1 << 62;
const COUNT_MASK: u64 = WAITING - 1;

struct Slot<T> {
    /// Paired with the leaf counter: set after the value is written, cleared
    /// after it is read.
    filled: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// The shared channel state. Exposed within the crate so the unbounded
/// channel can chain cores directly.
pub(crate) struct Core<T> {
    /// `2 * capacity - 1` occupancy counters; `tree[0]` is the root and
    /// carries the flag bits, the last `capacity` nodes are the leaves.
    tree: Box<[AtomicU64]>,
    slots: Box<[Slot<T>]>,
    capacity: usize,
    futex: Arc<Futex>,
}

// Safety: slot access is mediated by the counter tree and `filled` flags;
// a value moves from the single producer to exactly one consumer.
unsafe impl<T: Send> Send for Core<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Core<T> {}

// === impl Core ===

impl<T> Core<T> {
    /// The largest supported capacity; counts must stay below the flag bits.
    pub(crate) const MAX_CAPACITY: usize = 1 << 31;

    pub(crate) fn new(capacity: usize, futex: Arc<Futex>) -> Self {
        assert!(capacity <= Self::MAX_CAPACITY, "channel capacity too large");
        let capacity = if capacity == 0 {
            0
        } else {
            capacity.next_power_of_two()
        };

        let nodes = if capacity == 0 { 1 } else { 2 * capacity - 1 };
        let tree = (0..nodes).map(|_| AtomicU64::new(0)).collect();
        let slots = (0..capacity)
            .map(|_| Slot {
                filled: AtomicBool::new(false),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            tree,
            slots,
            capacity,
            futex,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        usize::try_from(self.tree[0].load(Ordering::Acquire) & COUNT_MASK).unwrap()
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.tree[0].load(Ordering::Acquire) & CLOSED != 0
    }

    /// Inserts a value. Must only be called from the single producer.
    pub(crate) fn try_push(&self, value: T, seed: u64) -> Result<(), TrySendError<T>> {
        let root = self.tree[0].load(Ordering::Acquire);
        if root & CLOSED != 0 {
            return Err(TrySendError::Closed(value));
        }
        if self.capacity == 0 || root & COUNT_MASK == self.capacity as u64 {
            return Err(TrySendError::Full(value));
        }

        // Descend towards a non-full subtree. We are the only inserter, so a
        // subtree observed below capacity can only drain further; extractors
        // in the middle of their top-down decrement can make both children
        // look momentarily full, in which case we wait them out.
        let mut idx = 0;
        let mut sub = self.capacity;
        let mut seed = seed;
        let mut boff = Backoff::new();
        while sub > 1 {
            let half = sub / 2;
            let left = 2 * idx + 1;
            let (first, second) = if seed & 1 == 0 {
                (left, left + 1)
            } else {
                (left + 1, left)
            };
            seed >>= 1;

            idx = loop {
                if self.count_at(first) < half as u64 {
                    break first;
                }
                if self.count_at(second) < half as u64 {
                    break second;
                }
                boff.spin();
            };
            sub = half;
        }

        let slot = &self.slots[idx - (self.capacity - 1)];

        // A consumer that reserved this slot may not have cleared it yet.
        let mut boff = Backoff::new();
        while slot.filled.load(Ordering::Acquire) {
            boff.spin();
        }

        // Safety: `filled == false` plus the descent reservation argument
        // above makes the slot exclusively ours.
        unsafe { (*slot.value.get()).write(value) };
        slot.filled.store(true, Ordering::Release);

        // Publish bottom-up; the root increment is what extractors reserve
        // against, so it must come last.
        let mut node = idx;
        loop {
            let prev = self.tree[node].fetch_add(1, Ordering::Release);
            if node == 0 {
                if prev & WAITING != 0 {
                    self.tree[0].fetch_and(!WAITING, Ordering::AcqRel);
                    self.wake_all();
                }
                break;
            }
            node = (node - 1) / 2;
        }

        Ok(())
    }

    /// Extracts a value. Safe to call from any number of consumers.
    pub(crate) fn try_pop(&self, seed: u64) -> Result<T, TryRecvError> {
        // Reserve one element at the root.
        let mut root = self.tree[0].load(Ordering::Acquire);
        loop {
            if root & COUNT_MASK == 0 {
                return Err(if root & CLOSED != 0 {
                    TryRecvError::Closed
                } else {
                    TryRecvError::Empty
                });
            }
            match self.tree[0].compare_exchange_weak(
                root,
                root - 1,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => root = actual,
            }
        }

        // Descend, reserving one counter per level. The root reservation
        // guarantees some subtree holds an element for us; transient zero
        // reads happen when a racing extractor has decremented a node but not
        // yet its child, or an inserter has filled a leaf but not yet
        // propagated to this level, so losing both children just means retry.
        let mut idx = 0;
        let mut sub = self.capacity;
        let mut seed = seed;
        let mut boff = Backoff::new();
        while sub > 1 {
            let left = 2 * idx + 1;
            let (first, second) = if seed & 1 == 0 {
                (left, left + 1)
            } else {
                (left + 1, left)
            };
            seed >>= 1;

            idx = loop {
                if let Some(idx) = self.try_reserve(first) {
                    break idx;
                }
                if let Some(idx) = self.try_reserve(second) {
                    break idx;
                }
                boff.spin();
            };
            sub /= 2;
        }

        let slot = &self.slots[idx - (self.capacity - 1)];
        debug_assert!(
            slot.filled.load(Ordering::Acquire),
            "leaf counter was reserved but slot is not filled"
        );

        // Safety: the leaf reservation synchronized with the inserter's
        // release increment, so the slot value is visible and ours.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.filled.store(false, Ordering::Release);
        Ok(value)
    }

    /// CAS-decrements the counter at `idx`, claiming one element from its
    /// subtree.
    fn try_reserve(&self, idx: usize) -> Option<usize> {
        let mut cur = self.tree[idx].load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return None;
            }
            match self.tree[idx].compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(idx),
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn close(&self) {
        let prev = self.tree[0].fetch_or(CLOSED, Ordering::AcqRel);
        if prev & CLOSED == 0 && prev & WAITING != 0 {
            self.wake_all();
        }
    }

    /// Announces intent to park and returns the root-counter futex key,
    /// expected to still read "empty, waiting, not closed".
    pub(crate) fn park_key(&self) -> KeyExpect {
        self.tree[0].fetch_or(WAITING, Ordering::AcqRel);
        KeyExpect {
            addr: ptr::from_ref::<AtomicU64>(&self.tree[0]).cast(),
            size: size_of::<u64>(),
            expected: WAITING,
        }
    }

    pub(crate) fn futex(&self) -> &Arc<Futex> {
        &self.futex
    }

    fn wake_all(&self) {
        self.futex.wake(
            ptr::from_ref::<AtomicU64>(&self.tree[0]).cast(),
            usize::MAX,
            WakeFilter::Any,
        );
    }

    #[inline]
    fn count_at(&self, idx: usize) -> u64 {
        let val = self.tree[idx].load(Ordering::Acquire);
        if idx == 0 { val & COUNT_MASK } else { val }
    }
}

impl<T> Drop for Core<T> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if *slot.filled.get_mut() {
                // Safety: filled slots hold initialized values; with `&mut
                // self` nobody else can claim them.
                unsafe { (*slot.value.get()).assume_init_drop() };
            }
        }
    }
}

impl<T> fmt::Debug for Core<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("spmc::Core")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Creates a bounded SPMC channel of (at least) the given capacity, parked on
/// `futex`. The capacity is rounded up to a power of two; a capacity of zero
/// produces a channel that rejects every send with
/// [`TrySendError::Full`].
pub fn channel<T>(capacity: usize, futex: Arc<Futex>) -> (Sender<T>, Receiver<T>) {
    let core = Arc::new(Core::new(capacity, futex));
    (
        Sender {
            core: Arc::clone(&core),
            seed: Cell::new(0),
        },
        Receiver {
            core,
            seed: Cell::new(0),
        },
    )
}

/// The producing half of a bounded SPMC channel. There is exactly one.
pub struct Sender<T> {
    core: Arc<Core<T>>,
    seed: Cell<u64>,
}

/// A consuming handle of a bounded SPMC channel. Cloneable.
pub struct Receiver<T> {
    core: Arc<Core<T>>,
    seed: Cell<u64>,
}

// === impl Sender ===

impl<T> Sender<T> {
    /// Inserts a value if the channel has a free slot.
    ///
    /// # Errors
    ///
    /// Hands the value back with [`TrySendError::Full`] or
    /// [`TrySendError::Closed`].
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.core.try_push(value, self.seed.get())
    }

    /// Inserts a value, spinning and yielding while the channel is full.
    ///
    /// # Errors
    ///
    /// Hands the value back if the channel is closed.
    pub fn send(&self, mut value: T) -> Result<(), crate::SendError<T>> {
        let mut boff = Backoff::new();
        loop {
            match self.try_send(value) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(value)) => return Err(crate::SendError(value)),
                Err(TrySendError::Full(returned)) => {
                    value = returned;
                    boff.spin();
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Sets the seed steering this sender's tree descents.
    pub fn set_seed(&self, seed: u64) {
        self.seed.set(seed);
    }

    pub fn close(&self) {
        self.core.close();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.core.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // the single producer going away means no further elements can arrive
        self.core.close();
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("spmc::Sender")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

// === impl Receiver ===

impl<T> Receiver<T> {
    /// Extracts a value if one is immediately available.
    ///
    /// # Errors
    ///
    /// [`TryRecvError::Empty`] if no element is queued,
    /// [`TryRecvError::Closed`] once the channel is closed *and* drained.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.core.try_pop(self.seed.get())
    }

    /// Extracts a value, parking on the channel's futex while it is empty.
    ///
    /// # Errors
    ///
    /// [`Closed`] once the channel is closed and drained.
    pub fn recv(&self) -> Result<T, Closed> {
        match self.recv_inner(None) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Closed) => Err(Closed),
            Err(RecvTimeoutError::Timeout) => unreachable!("no deadline was given"),
        }
    }

    /// Like [`recv`](Self::recv), but gives up at `deadline`.
    ///
    /// # Errors
    ///
    /// [`RecvTimeoutError::Timeout`] when the deadline elapses first,
    /// [`RecvTimeoutError::Closed`] once the channel is closed and drained.
    pub fn recv_until(&self, deadline: Instant) -> Result<T, RecvTimeoutError> {
        self.recv_inner(Some(deadline))
    }

    fn recv_inner(&self, deadline: Option<Instant>) -> Result<T, RecvTimeoutError> {
        loop {
            match self.try_recv() {
                Ok(value) => return Ok(value),
                Err(TryRecvError::Closed) => return Err(RecvTimeoutError::Closed),
                Err(TryRecvError::Empty) => {}
            }

            let key = self.core.park_key();
            // Safety: the key addresses the root counter, which lives as long
            // as `core`.
            match unsafe {
                self.core
                    .futex()
                    .wait(key.addr, key.size, key.expected, 0, deadline)
            } {
                Ok(()) | Err(WaitError::Invalid) => {}
                Err(WaitError::Timeout) => return Err(RecvTimeoutError::Timeout),
                Err(WaitError::KeyError) => unreachable!("root counter is a valid key"),
            }
        }
    }

    /// Sets the seed steering this receiver's tree descents.
    pub fn set_seed(&self, seed: u64) {
        self.seed.set(seed);
    }

    /// Returns a new receiving handle whose descents are steered by `seed`.
    #[must_use]
    pub fn with_seed(&self, seed: u64) -> Self {
        Self {
            core: Arc::clone(&self.core),
            seed: Cell::new(seed),
        }
    }

    pub fn close(&self) {
        self.core.close();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.core.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The futex key this receiver parks on, for multi-source receives.
    pub(crate) fn park_key(&self) -> KeyExpect {
        self.core.park_key()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            seed: Cell::new(self.seed.get()),
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("spmc::Receiver")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::thread;
    use std::time::Duration;

    fn test_channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
        channel(capacity, Arc::new(Futex::new()))
    }

    #[test]
    fn capacity_zero_rejects_every_send() {
        let (tx, rx) = test_channel::<u32>(0);
        for i in 0..4 {
            assert_eq!(tx.try_send(i), Err(TrySendError::Full(i)));
        }
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn fills_up_to_capacity() {
        let (tx, rx) = test_channel(4);

        for i in 0..4 {
            tx.try_send(i).unwrap();
        }
        assert_eq!(tx.try_send(4), Err(TrySendError::Full(4)));
        assert_eq!(tx.len(), 4);

        let got: BTreeSet<i32> = (0..4).map(|_| rx.try_recv().unwrap()).collect();
        assert_eq!(got, BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let (tx, rx) = test_channel(8);

        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        tx.close();

        assert_eq!(tx.try_send(3), Err(TrySendError::Closed(3)));
        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        assert_eq!(BTreeSet::from([a, b]), BTreeSet::from([1, 2]));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn wraparound_reuses_slots() {
        let (tx, rx) = test_channel(2);

        for i in 0..100 {
            tx.try_send(i).unwrap();
            assert_eq!(rx.try_recv().unwrap(), i);
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn seeded_descent_spreads_but_preserves_elements() {
        let (tx, rx) = test_channel(16);
        tx.set_seed(0b1010_1010);

        for i in 0..16 {
            tx.try_send(i).unwrap();
        }

        let mut got = BTreeSet::new();
        for seed in 0..16 {
            let rx = rx.with_seed(seed);
            got.insert(rx.try_recv().unwrap());
        }
        assert_eq!(got, (0..16).collect::<BTreeSet<i32>>());
    }

    #[test]
    fn recv_blocks_until_send() {
        let (tx, rx) = test_channel(4);

        let consumer = thread::spawn(move || rx.recv());
        thread::sleep(Duration::from_millis(20));
        tx.try_send(9).unwrap();

        assert_eq!(consumer.join().unwrap(), Ok(9));
    }

    #[test]
    fn close_wakes_blocked_receivers() {
        let (tx, rx) = test_channel::<u32>(4);

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let rx = rx.clone();
                thread::spawn(move || rx.recv())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        tx.close();

        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), Err(Closed));
        }
    }

    #[test]
    fn fan_out_no_loss_no_duplicates() {
        const CONSUMERS: usize = if cfg!(miri) { 4 } else { 16 };
        const VALUES: i32 = if cfg!(miri) { 50 } else { 1000 };

        let (tx, rx) = test_channel(16);

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|i| {
                let rx = rx.with_seed(u64::try_from(i).unwrap());
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Ok(value) = rx.recv() {
                        got.push(value);
                    }
                    got
                })
            })
            .collect();

        for i in 0..VALUES {
            tx.send(i).unwrap();
        }
        drop(tx); // closes

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.join().unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..VALUES).collect::<Vec<i32>>());
    }
}
