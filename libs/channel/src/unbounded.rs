// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An unbounded single-producer, multi-consumer channel.
//!
//! Built by chaining bounded [sum-tree channels](crate::spmc): the channel
//! holds an atomic pointer to the currently *active* bounded channel (with a
//! `closed` flag bit in the pointer word). When a send hits `Full`, the
//! producer allocates a new bounded channel of twice the capacity, swaps it
//! in as active, closes the old one, and drains the old channel's residual
//! elements into the new one. Consumers that observe the old channel as
//! closed simply re-read the active pointer and retry there; the retired
//! channels stay chained behind the active one until the channel itself is
//! dropped, so no reclamation races exist.
//!
//! Receivers park on the *active* channel's root counter and re-observe the
//! active pointer after every wake, which resolves the park-during-grow race:
//! closing the old channel broadcasts on its root, and a parked receiver's
//! expected-value check fails against a closed root.

use crate::spmc::Core;
use crate::{Closed, RecvTimeoutError, SendError, TryRecvError, TrySendError};
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use weft_futex::{Futex, WaitError};

const CLOSED: usize = 0b1;
const PTR_MASK: usize = !0b1;

/// Capacity of the first bounded channel in the chain.
const INITIAL_CAPACITY: usize = 8;

struct Node<T> {
    core: Core<T>,
    /// The previously active channel; retired, kept for deallocation only.
    prev: Option<NonNull<Node<T>>>,
}

struct Inner<T> {
    /// Pointer to the active node, tagged with the `closed` bit.
    active: AtomicUsize,
    futex: Arc<Futex>,
    _marker: std::marker::PhantomData<Node<T>>,
}

// Safety: nodes are only deallocated when the channel itself is dropped;
// element handoff safety is inherited from the bounded core.
unsafe impl<T: Send> Send for Inner<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Inner<T> {}

/// Creates an unbounded SPMC channel parked on `futex`.
pub fn channel<T>(futex: Arc<Futex>) -> (Sender<T>, Receiver<T>) {
    let node = Box::new(Node {
        core: Core::<T>::new(INITIAL_CAPACITY, Arc::clone(&futex)),
        prev: None,
    });

    let inner = Arc::new(Inner {
        active: AtomicUsize::new(Box::into_raw(node) as usize),
        futex,
        _marker: std::marker::PhantomData,
    });

    (
        Sender {
            inner: Arc::clone(&inner),
            seed: Cell::new(0),
        },
        Receiver {
            inner,
            seed: Cell::new(0),
        },
    )
}

/// The producing half of an unbounded SPMC channel. There is exactly one;
/// sends never block, the channel grows instead.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
    seed: Cell<u64>,
}

/// A consuming handle of an unbounded SPMC channel. Cloneable.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
    seed: Cell<u64>,
}

// === impl Inner ===

impl<T> Inner<T> {
    /// Loads the active node and the channel-closed flag.
    fn active(&self) -> (NonNull<Node<T>>, bool) {
        let word = self.active.load(Ordering::Acquire);
        let ptr = (word & PTR_MASK) as *mut Node<T>;
        // Safety: the pointer part is never null; nodes live until drop.
        (unsafe { NonNull::new_unchecked(ptr) }, word & CLOSED != 0)
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let word = *self.active.get_mut();
        let mut cur = NonNull::new((word & PTR_MASK) as *mut Node<T>);
        while let Some(node) = cur {
            // Safety: we are the last owner; nobody can observe the chain
            // anymore.
            let node = unsafe { Box::from_raw(node.as_ptr()) };
            cur = node.prev;
        }
    }
}

// === impl Sender ===

impl<T> Sender<T> {
    /// Enqueues a value, growing the channel if the active segment is full.
    ///
    /// # Errors
    ///
    /// Hands the value back if the channel is closed.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let seed = self.seed.get();
        let (active, closed) = self.inner.active();
        if closed {
            return Err(SendError(value));
        }

        // Safety: nodes live until the channel is dropped.
        let core = unsafe { &active.as_ref().core };
        match core.try_push(value, seed) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(value)) => self.grow_and_send(active, value, seed),
            // The active core is only ever closed by grow (which we, the
            // single producer, are not running) or by a channel close that
            // raced us.
            Err(TrySendError::Closed(value)) => Err(SendError(value)),
        }
    }

    /// Grows the chain by a channel of twice the capacity, then re-sends.
    #[cold]
    fn grow_and_send(
        &self,
        old: NonNull<Node<T>>,
        value: T,
        seed: u64,
    ) -> Result<(), SendError<T>> {
        // Safety: nodes live until the channel is dropped.
        let old_core = unsafe { &old.as_ref().core };
        let new_capacity = old_core.capacity() * 2;

        let node = Box::into_raw(Box::new(Node {
            core: Core::new(new_capacity, Arc::clone(&self.inner.futex)),
            prev: Some(old),
        }));

        // Swap the new channel in as active. Only a concurrent close can
        // change the word under us; in that case back out.
        if self
            .inner
            .active
            .compare_exchange(
                old.as_ptr() as usize,
                node as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Safety: the node was never published.
            drop(unsafe { Box::from_raw(node) });
            return Err(SendError(value));
        }

        // Retire the old channel: new sends already go to the new one, and
        // closing wakes any receivers still parked on the old root so they
        // re-observe the active pointer.
        old_core.close();

        // Safety: `node` was just published; nodes live until channel drop.
        let new_core = unsafe { &(*node).core };

        // Drain residual elements into the new channel. Consumers may be
        // draining the old channel concurrently, which only shrinks the
        // residue; the new channel has strictly more free slots than the old
        // one had elements, so these pushes cannot fail.
        let mut drain_seed = seed;
        while let Ok(residual) = old_core.try_pop(drain_seed) {
            drain_seed = drain_seed.wrapping_add(1);
            match new_core.try_push(residual, drain_seed) {
                Ok(()) => {}
                Err(_) => unreachable!("grown channel cannot be full while draining"),
            }
        }

        match new_core.try_push(value, seed) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                unreachable!("grown channel cannot be full immediately after growing")
            }
            // a close raced us; the value is surfaced back to the caller
            Err(TrySendError::Closed(value)) => Err(SendError(value)),
        }
    }

    /// Sets the seed steering this sender's tree descents.
    pub fn set_seed(&self, seed: u64) {
        self.seed.set(seed);
    }

    /// Closes the channel: subsequent sends fail, parked receivers wake and
    /// observe [`Closed`] once every segment is drained.
    pub fn close(&self) {
        close_inner(&self.inner);
    }

    /// Elements currently queued in the active segment.
    #[must_use]
    pub fn len(&self) -> usize {
        let (active, _) = self.inner.active();
        // Safety: nodes live until the channel is dropped.
        unsafe { active.as_ref() }.core.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        close_inner(&self.inner);
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("unbounded::Sender")
            .field("len", &self.len())
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
    /// [`TryRecvError::Closed`] once the channel is closed and every segment
    /// is drained.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let seed = self.seed.get();
        loop {
            let (active, channel_closed) = self.inner.active();
            // Safety: nodes live until the channel is dropped.
            let core = unsafe { &active.as_ref().core };

            match core.try_pop(seed) {
                Ok(value) => return Ok(value),
                Err(TryRecvError::Empty) => return Err(TryRecvError::Empty),
                Err(TryRecvError::Closed) => {
                    let (now_active, now_closed) = self.inner.active();
                    if now_active != active {
                        // the channel grew under us; retry on the new segment
                        continue;
                    }
                    if channel_closed || now_closed {
                        return Err(TryRecvError::Closed);
                    }
                    // A grow is mid-flight: the core is closed but the active
                    // pointer has not moved yet from our point of view.
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Extracts a value, parking on the active segment's root counter while
    /// the channel is empty.
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

            // Park on the active segment's root. If the channel grows (or
            // closes) between here and the wait, the expected-value check
            // fails and we just retry.
            let (active, _) = self.inner.active();
            // Safety: nodes live until the channel is dropped.
            let key = unsafe { active.as_ref() }.core.park_key();
            // Safety: the key addresses the active segment's root counter.
            match unsafe {
                self.inner
                    .futex
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
            inner: Arc::clone(&self.inner),
            seed: Cell::new(seed),
        }
    }

    /// Elements currently queued in the active segment.
    #[must_use]
    pub fn len(&self) -> usize {
        let (active, _) = self.inner.active();
        // Safety: nodes live until the channel is dropped.
        unsafe { active.as_ref() }.core.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The futex key this receiver parks on, for multi-source receives.
    pub(crate) fn park_key(&self) -> weft_futex::KeyExpect {
        let (active, _) = self.inner.active();
        // Safety: nodes live until the channel is dropped.
        unsafe { active.as_ref() }.core.park_key()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            seed: Cell::new(self.seed.get()),
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("unbounded::Receiver")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Marks the channel closed and closes the active segment (retired segments
/// are already closed).
fn close_inner<T>(inner: &Inner<T>) {
    let prev = inner.active.fetch_or(CLOSED, Ordering::AcqRel);
    if prev & CLOSED != 0 {
        return;
    }
    let ptr = (prev & PTR_MASK) as *mut Node<T>;
    // Safety: nodes live until the channel is dropped.
    unsafe { (*ptr).core.close() };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn test_channel<T>() -> (Sender<T>, Receiver<T>) {
        channel(Arc::new(Futex::new()))
    }

    #[test]
    fn grows_past_initial_capacity() {
        let (tx, rx) = test_channel();

        for i in 0..1000 {
            tx.send(i).unwrap();
        }

        let mut got: Vec<i32> = (0..1000).map(|_| rx.try_recv().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (0..1000).collect::<Vec<i32>>());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn send_after_close_fails() {
        let (tx, rx) = test_channel();
        tx.send(1).unwrap();
        tx.close();

        assert_eq!(tx.send(2), Err(SendError(2)));
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn recv_blocks_until_send() {
        let (tx, rx) = test_channel();

        let consumer = thread::spawn(move || rx.recv());
        thread::sleep(Duration::from_millis(20));
        tx.send(11).unwrap();

        assert_eq!(consumer.join().unwrap(), Ok(11));
    }

    #[test]
    fn recv_until_times_out() {
        let (_tx, rx) = test_channel::<u32>();
        let res = rx.recv_until(Instant::now() + Duration::from_millis(30));
        assert_eq!(res.unwrap_err(), RecvTimeoutError::Timeout);
    }

    #[test]
    fn grow_under_contention_loses_nothing() {
        const CONSUMERS: usize = if cfg!(miri) { 2 } else { 8 };
        const VALUES: i64 = if cfg!(miri) { 100 } else { 20_000 };

        let (tx, rx) = test_channel();

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
        assert_eq!(all.len(), usize::try_from(VALUES).unwrap());
        assert_eq!(all, (0..VALUES).collect::<Vec<i64>>());
    }
}
