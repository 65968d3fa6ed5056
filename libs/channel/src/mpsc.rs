// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An intrusive multi-producer, single-consumer channel.
//!
//! Elements supply their own link field, so the channel never allocates: a
//! producer hands over an owning [`Handle`] and the element strings itself
//! onto a lock-free LIFO *push list*. The single consumer drains the push
//! list in one atomic swap, reverses it in `O(n)` into its private *pop
//! list*, and pops from there, which makes the overall order FIFO per
//! producer.
//!
//! Two flag bits live in the low bits of the push-list head word: `closed`
//! and `waiting`. The consumer parks on the head word itself through the
//! pool's futex; a producer that observes the `waiting` bit wakes it.
//!
//! [`Handle`]: Linked::Handle

use crate::{Closed, RecvTimeoutError, SendError, TryRecvError};
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::{PhantomData, PhantomPinned};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::time::Instant;
use weft_futex::{Futex, KeyExpect, WaitError, WakeFilter};
use weft_util::CachePadded;

const CLOSED: usize = 0b01;
const WAITING: usize = 0b10;
const PTR_MASK: usize = !0b11;

/// Trait implemented by types which can be members of an intrusive MPSC
/// channel.
///
/// In order to be part of the channel, a type must contain a [`Links`] value
/// that stores the pointer to the next queued element.
///
/// # Safety
///
/// This is unsafe to implement because it's the implementation's
/// responsibility to ensure that types implementing this trait are valid
/// intrusive collection nodes. In particular:
///
/// - Implementations **must** ensure that implementors are pinned in memory
///   while they are in the channel. While an element is queued, it may not be
///   deallocated or moved to a different memory location.
/// - The type implementing this trait **must not** implement [`Unpin`].
/// - The type must be aligned to at least 4 bytes, so the channel can store
///   its flag bits in the low bits of element pointers.
pub unsafe trait Linked {
    /// The handle owning elements of this type.
    ///
    /// This type must have ownership over a `Self`-typed value; dropping a
    /// `Handle` drops the element. A quintessential example is `Box<Self>`.
    type Handle;

    /// Convert a [`Self::Handle`] to a raw pointer to `Self`, taking
    /// ownership of it in the process.
    fn into_ptr(r: Self::Handle) -> NonNull<Self>;

    /// Convert a raw pointer back into an owning [`Self::Handle`].
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid element whose ownership was previously
    /// transferred with [`Linked::into_ptr`].
    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle;

    /// Return the links of the element pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid element.
    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>>
    where
        Self: Sized;
}

/// Links to the next element in an intrusive MPSC channel.
pub struct Links<T> {
    /// The next element in the queue.
    next: AtomicPtr<T>,

    /// Linked list links must always be `!Unpin`, in order to ensure that
    /// they never receive LLVM `noalias` annotations; see also
    /// <https://github.com/rust-lang/rust/issues/63818>.
    _unpin: PhantomPinned,
}

// === impl Links ===

impl<T> Links<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            _unpin: PhantomPinned,
        }
    }
}

impl<T> Default for Links<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Links<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Links")
            .field("next", &self.next.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

struct Inner<T: Linked> {
    /// The push-list head, tagged with the `closed` and `waiting` flag bits.
    /// Producers CAS new elements onto this word; the consumer parks on it.
    head: CachePadded<AtomicUsize>,
    /// The consumer-owned pop list, in FIFO order.
    pop: CachePadded<UnsafeCell<*mut T>>,
    /// Number of queued elements.
    len: AtomicUsize,
    /// Live `Sender` handles; the channel closes when the last one goes away.
    senders: AtomicUsize,
    futex: Arc<Futex>,
}

// Safety: the channel hands each element to exactly one side at a time; the
// pop list cell is only touched by the single consumer (enforced by
// `Receiver` being `!Sync` and not `Clone`).
unsafe impl<T: Linked> Send for Inner<T>
where
    T: Send,
    T::Handle: Send,
{
}
// Safety: see above.
unsafe impl<T: Linked> Sync for Inner<T> where T: Send {}

/// Creates an intrusive MPSC channel parked on `futex`.
///
/// # Panics
///
/// Panics if `T` is not aligned to at least 4 bytes (the channel stores its
/// flag bits in the low bits of element pointers).
pub fn channel<T: Linked>(futex: Arc<Futex>) -> (Sender<T>, Receiver<T>) {
    assert!(
        align_of::<T>() >= 4,
        "intrusive MPSC elements must be aligned to at least 4 bytes"
    );

    let inner = Arc::new(Inner {
        head: CachePadded(AtomicUsize::new(0)),
        pop: CachePadded(UnsafeCell::new(ptr::null_mut())),
        len: AtomicUsize::new(0),
        senders: AtomicUsize::new(1),
        futex,
    });

    (
        Sender {
            inner: Arc::clone(&inner),
        },
        Receiver {
            inner,
            _not_sync: PhantomData,
        },
    )
}

/// The producing half of an intrusive MPSC channel. Cloneable; sends never
/// block.
pub struct Sender<T: Linked> {
    inner: Arc<Inner<T>>,
}

/// The consuming half of an intrusive MPSC channel. There is exactly one.
pub struct Receiver<T: Linked> {
    inner: Arc<Inner<T>>,
    /// The pop list is unsynchronized; the receiver must not be shared
    /// between threads (it may still be moved to one).
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

// === impl Sender ===

impl<T: Linked> Sender<T> {
    /// Enqueues an element, taking ownership of its handle.
    ///
    /// This method never waits; the channel is unbounded (elements carry
    /// their own storage).
    ///
    /// # Errors
    ///
    /// Hands the element back if the channel is closed.
    pub fn send(&self, element: T::Handle) -> Result<(), SendError<T::Handle>> {
        let ptr = T::into_ptr(element);

        let mut cur = self.inner.head.load(Ordering::Relaxed);
        loop {
            if cur & CLOSED != 0 {
                // Safety: we just took ownership via into_ptr and never
                // published the pointer.
                return Err(SendError(unsafe { T::from_ptr(ptr) }));
            }

            // Safety: we own the element until the CAS below publishes it.
            unsafe {
                T::links(ptr)
                    .as_ref()
                    .next
                    .store((cur & PTR_MASK) as *mut T, Ordering::Relaxed);
            }

            // The new head is our element; this also clears the waiting bit.
            match self.inner.head.compare_exchange_weak(
                cur,
                ptr.as_ptr() as usize,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        self.inner.len.fetch_add(1, Ordering::Release);

        if cur & WAITING != 0 {
            self.inner.wake();
        }
        Ok(())
    }

    /// Closes the channel: subsequent sends fail, parked receivers wake and
    /// observe [`Closed`] once drained.
    pub fn close(&self) {
        self.inner.close();
    }

    /// The number of currently queued elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Linked> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.inner.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Linked> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.inner.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.close();
        }
    }
}

impl<T: Linked> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("mpsc::Sender")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

// === impl Receiver ===

impl<T: Linked> Receiver<T> {
    /// Dequeues an element if one is immediately available.
    ///
    /// # Errors
    ///
    /// [`TryRecvError::Empty`] if the channel is currently empty,
    /// [`TryRecvError::Closed`] once it is closed *and* drained.
    pub fn try_recv(&self) -> Result<T::Handle, TryRecvError> {
        if let Some(element) = self.pop_one() {
            self.inner.len.fetch_sub(1, Ordering::Release);
            // Safety: the element was published to the channel via into_ptr
            // and is now exclusively ours.
            return Ok(unsafe { T::from_ptr(element) });
        }

        // The pop list is dry; capture the entire push list in one swap,
        // preserving only the closed bit (this also clears `waiting`).
        let taken = self.inner.head.fetch_and(CLOSED, Ordering::Acquire);
        let mut cur = (taken & PTR_MASK) as *mut T;

        if cur.is_null() {
            return Err(if taken & CLOSED != 0 {
                TryRecvError::Closed
            } else {
                TryRecvError::Empty
            });
        }

        // Reverse the captured LIFO chain into FIFO order.
        let mut prev: *mut T = ptr::null_mut();
        while let Some(node) = NonNull::new(cur) {
            // Safety: nodes on the captured list were published by producers
            // and are exclusively ours now.
            let next = unsafe { T::links(node).as_ref().next.load(Ordering::Relaxed) };
            // Safety: as above.
            unsafe { T::links(node).as_ref().next.store(prev, Ordering::Relaxed) };
            prev = cur;
            cur = next;
        }

        // Safety: single consumer; the pop cell is ours.
        unsafe { *self.inner.pop.0.get() = prev };

        let element = self.pop_one().expect("captured list cannot be empty");
        self.inner.len.fetch_sub(1, Ordering::Release);
        // Safety: as above.
        Ok(unsafe { T::from_ptr(element) })
    }

    /// Dequeues an element, parking on the channel's futex while the channel
    /// is empty.
    ///
    /// # Errors
    ///
    /// [`Closed`] once the channel is closed and drained.
    pub fn recv(&self) -> Result<T::Handle, Closed> {
        match self.recv_inner(None) {
            Ok(element) => Ok(element),
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
    pub fn recv_until(&self, deadline: Instant) -> Result<T::Handle, RecvTimeoutError> {
        self.recv_inner(Some(deadline))
    }

    fn recv_inner(&self, deadline: Option<Instant>) -> Result<T::Handle, RecvTimeoutError> {
        loop {
            match self.try_recv() {
                Ok(element) => return Ok(element),
                Err(TryRecvError::Closed) => return Err(RecvTimeoutError::Closed),
                Err(TryRecvError::Empty) => {}
            }

            let key = self.park_key();
            // Safety: the key addresses this channel's head word, which lives
            // as long as the futex wait (both are kept alive by `inner`).
            match unsafe { self.inner.futex.wait(key.addr, key.size, key.expected, 0, deadline) } {
                // woken, or the head changed before we parked; re-drain
                Ok(()) | Err(WaitError::Invalid) => {}
                Err(WaitError::Timeout) => return Err(RecvTimeoutError::Timeout),
                Err(WaitError::KeyError) => unreachable!("head word is a valid key"),
            }
        }
    }

    /// Announces this receiver's intent to park and returns the futex key it
    /// parks on: the push-list head word, expected to still read
    /// "empty, waiting, not closed".
    pub(crate) fn park_key(&self) -> KeyExpect {
        self.inner.head.fetch_or(WAITING, Ordering::AcqRel);
        KeyExpect {
            addr: ptr::from_ref::<AtomicUsize>(&self.inner.head.0).cast(),
            size: size_of::<usize>(),
            expected: WAITING as u64,
        }
    }

    /// Closes the channel from the consumer side; subsequent sends fail.
    pub fn close(&self) {
        self.inner.close();
    }

    /// The number of currently queued elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pops the front of the consumer's private pop list.
    fn pop_one(&self) -> Option<NonNull<T>> {
        // Safety: single consumer; the pop cell is ours.
        unsafe {
            let pop = self.inner.pop.0.get();
            let head = NonNull::new(*pop)?;
            *pop = T::links(head).as_ref().next.load(Ordering::Relaxed);
            Some(head)
        }
    }
}

impl<T: Linked> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.inner.close();

        // Drain whatever is still queued so element handles are not leaked.
        while self.try_recv().is_ok() {}
    }
}

impl<T: Linked> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("mpsc::Receiver")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

// === impl Inner ===

impl<T: Linked> Inner<T> {
    fn close(&self) {
        let prev = self.head.fetch_or(CLOSED, Ordering::AcqRel);
        if prev & CLOSED == 0 && prev & WAITING != 0 {
            self.wake();
        }
    }

    fn wake(&self) {
        self.futex.wake(
            ptr::from_ref::<AtomicUsize>(&self.head.0).cast(),
            usize::MAX,
            WakeFilter::Any,
        );
    }
}

impl<T: Linked> Drop for Inner<T> {
    fn drop(&mut self) {
        // Drop anything left on the pop list, then on the push list. The
        // receiver already drains on drop; this is the backstop for a channel
        // whose receiver was leaked or never drained fully.
        // Safety: `&mut self` means no other side can touch the lists.
        unsafe {
            let mut cur = *self.pop.0.get();
            while let Some(node) = NonNull::new(cur) {
                cur = T::links(node).as_ref().next.load(Ordering::Relaxed);
                drop(T::from_ptr(node));
            }

            let mut cur = (self.head.load(Ordering::Acquire) & PTR_MASK) as *mut T;
            while let Some(node) = NonNull::new(cur) {
                cur = T::links(node).as_ref().next.load(Ordering::Relaxed);
                drop(T::from_ptr(node));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Entry {
        links: Links<Entry>,
        val: i32,
    }

    impl Entry {
        fn new(val: i32) -> Pin<Box<Self>> {
            Box::pin(Entry {
                links: Links::new(),
                val,
            })
        }
    }

    // Safety: entries are pinned boxes; the links field is never moved while
    // queued.
    unsafe impl Linked for Entry {
        type Handle = Pin<Box<Entry>>;

        fn into_ptr(handle: Pin<Box<Entry>>) -> NonNull<Entry> {
            // Safety: the box is leaked, not dropped; the pin contract is
            // upheld by never moving the allocation.
            unsafe { NonNull::from(Box::leak(Pin::into_inner_unchecked(handle))) }
        }

        unsafe fn from_ptr(ptr: NonNull<Entry>) -> Pin<Box<Entry>> {
            // Safety: only called on pointers produced by into_ptr.
            unsafe { Pin::new_unchecked(Box::from_raw(ptr.as_ptr())) }
        }

        unsafe fn links(target: NonNull<Entry>) -> NonNull<Links<Entry>> {
            // Safety: target points at a live Entry.
            let links = unsafe { &raw mut (*target.as_ptr()).links };
            // Safety: field pointers of non-null structs are non-null.
            unsafe { NonNull::new_unchecked(links) }
        }
    }

    fn test_channel() -> (Sender<Entry>, Receiver<Entry>) {
        channel(Arc::new(Futex::new()))
    }

    #[test]
    fn fifo_per_producer() {
        let (tx, rx) = test_channel();

        for i in 0..10 {
            tx.send(Entry::new(i)).unwrap();
        }

        for i in 0..10 {
            assert_eq!(rx.try_recv().unwrap().val, i);
        }
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let (tx, rx) = test_channel();

        tx.send(Entry::new(1)).unwrap();
        tx.send(Entry::new(2)).unwrap();
        tx.close();

        assert!(tx.send(Entry::new(3)).is_err());
        assert_eq!(rx.try_recv().unwrap().val, 1);
        assert_eq!(rx.try_recv().unwrap().val, 2);
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Closed);
    }

    #[test]
    fn last_sender_drop_closes() {
        let (tx, rx) = test_channel();
        let tx2 = tx.clone();

        tx.send(Entry::new(1)).unwrap();
        drop(tx);
        assert_eq!(rx.try_recv().unwrap().val, 1);
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);

        drop(tx2);
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Closed);
    }

    #[test]
    fn recv_blocks_until_send() {
        let (tx, rx) = test_channel();

        let consumer = thread::spawn(move || rx.recv().map(|e| e.val));

        thread::sleep(Duration::from_millis(20));
        tx.send(Entry::new(7)).unwrap();

        assert_eq!(consumer.join().unwrap(), Ok(7));
    }

    #[test]
    fn recv_until_times_out() {
        let (_tx, rx) = test_channel();

        let res = rx.recv_until(Instant::now() + Duration::from_millis(30));
        assert_eq!(res.unwrap_err(), RecvTimeoutError::Timeout);
    }

    #[test]
    fn stress_all_received_exactly_once() {
        const THREADS: i32 = if cfg!(miri) { 3 } else { 8 };
        const MSGS: i32 = if cfg!(miri) { 10 } else { 1000 };

        let (tx, rx) = test_channel();

        let producers: Vec<_> = (0..THREADS)
            .map(|t| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..MSGS {
                        tx.send(Entry::new(t * MSGS + i)).unwrap();
                    }
                })
            })
            .collect();
        drop(tx);

        let mut seen = Vec::new();
        loop {
            match rx.recv() {
                Ok(entry) => seen.push(entry.val),
                Err(Closed) => break,
            }
        }

        for producer in producers {
            producer.join().unwrap();
        }

        seen.sort_unstable();
        let expected: Vec<i32> = (0..THREADS * MSGS).collect();
        assert_eq!(seen, expected);
    }
}
