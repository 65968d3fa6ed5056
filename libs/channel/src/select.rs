// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Receiving from several channels at once.
//!
//! A multi-receiver combines a static tuple of receivers with heterogeneous
//! element types into one receive operation producing a tagged variant
//! ([`Select2`], [`Select3`]). `try_recv` polls the receivers in tuple order
//! (rotatable via `try_recv_from`, which the worker loop uses to skew its
//! preference between its private and the shared queue) and reports `Closed`
//! only once *every* receiver is closed and drained.
//!
//! The blocking `recv` spins a few times, yields a few more, then parks on
//! all still-open receivers' futex keys at once via
//! [`wait_v`](weft_futex::Futex::wait_v); whichever channel signals first
//! wakes it for another round of draining.

use crate::{Closed, RecvTimeoutError, TryRecvError};
use std::time::Instant;
use weft_futex::{Futex, KeyExpect, WaitError};

/// Rounds of busy-spinning before a blocking multi-receive starts yielding.
const SPINS: usize = 64;
/// Rounds of `yield_now` after spinning, before parking on the futex.
const YIELDS: usize = 4;

/// A channel endpoint that a multi-receiver can draw from.
pub trait Source {
    /// The element type produced by this source.
    type Item;

    /// Attempts to dequeue one element.
    ///
    /// # Errors
    ///
    /// [`TryRecvError::Empty`] / [`TryRecvError::Closed`] with the usual
    /// drained-then-closed semantics.
    fn try_recv_one(&self) -> Result<Self::Item, TryRecvError>;

    /// Announces intent to park and returns the futex key to park on. The
    /// expected value must fail to match whenever the source has become
    /// ready (or closed) since the announcement.
    fn prepare_park(&self) -> KeyExpect;
}

impl<T: super::mpsc::Linked> Source for super::mpsc::Receiver<T> {
    type Item = T::Handle;

    fn try_recv_one(&self) -> Result<Self::Item, TryRecvError> {
        self.try_recv()
    }

    fn prepare_park(&self) -> KeyExpect {
        self.park_key()
    }
}

impl<T> Source for super::spmc::Receiver<T> {
    type Item = T;

    fn try_recv_one(&self) -> Result<Self::Item, TryRecvError> {
        self.try_recv()
    }

    fn prepare_park(&self) -> KeyExpect {
        self.park_key()
    }
}

impl<T> Source for super::unbounded::Receiver<T> {
    type Item = T;

    fn try_recv_one(&self) -> Result<Self::Item, TryRecvError> {
        self.try_recv()
    }

    fn prepare_park(&self) -> KeyExpect {
        self.park_key()
    }
}

macro_rules! multi_receiver {
    (
        $(#[$meta:meta])*
        $Recv:ident, $Select:ident, $len:expr => $(($idx:tt, $field:ident, $T:ident, $Var:ident)),+
    ) => {
        /// The tagged result of a multi-source receive.
        #[derive(Debug, Eq, PartialEq)]
        pub enum $Select<$($T),+> {
            $($Var($T),)+
        }

        $(#[$meta])*
        pub struct $Recv<'a, $($T: Source),+> {
            futex: &'a Futex,
            $($field: &'a $T,)+
        }

        impl<'a, $($T: Source),+> $Recv<'a, $($T),+> {
            pub fn new(futex: &'a Futex, $($field: &'a $T),+) -> Self {
                Self { futex, $($field,)+ }
            }

            /// Polls the receivers in tuple order.
            ///
            /// # Errors
            ///
            /// [`TryRecvError::Empty`] when nothing is ready;
            /// [`TryRecvError::Closed`] only once all receivers are closed
            /// and drained.
            pub fn try_recv(&self) -> Result<$Select<$($T::Item),+>, TryRecvError> {
                self.try_recv_from(0)
            }

            /// Polls the receivers starting at index `first` (mod the tuple
            /// length), wrapping around.
            ///
            /// # Errors
            ///
            /// See [`try_recv`](Self::try_recv).
            pub fn try_recv_from(
                &self,
                first: usize,
            ) -> Result<$Select<$($T::Item),+>, TryRecvError> {
                match self.poll(first) {
                    (Some(item), _) => Ok(item),
                    (None, closed) if closed.count_ones() as usize == $len => {
                        Err(TryRecvError::Closed)
                    }
                    (None, _) => Err(TryRecvError::Empty),
                }
            }

            /// Receives from whichever source is ready first, parking on all
            /// of them while none is.
            ///
            /// # Errors
            ///
            /// [`Closed`] once every receiver is closed and drained.
            pub fn recv(&self) -> Result<$Select<$($T::Item),+>, Closed> {
                self.recv_from(0)
            }

            /// Like [`recv`](Self::recv), polling from index `first`.
            ///
            /// # Errors
            ///
            /// See [`recv`](Self::recv).
            pub fn recv_from(&self, first: usize) -> Result<$Select<$($T::Item),+>, Closed> {
                match self.recv_inner(first, None) {
                    Ok(item) => Ok(item),
                    Err(RecvTimeoutError::Closed) => Err(Closed),
                    Err(RecvTimeoutError::Timeout) => unreachable!("no deadline was given"),
                }
            }

            /// Like [`recv_from`](Self::recv_from), but gives up at
            /// `deadline`.
            ///
            /// # Errors
            ///
            /// [`RecvTimeoutError::Timeout`] when the deadline elapses
            /// first; [`RecvTimeoutError::Closed`] once every receiver is
            /// closed and drained.
            pub fn recv_until(
                &self,
                first: usize,
                deadline: Instant,
            ) -> Result<$Select<$($T::Item),+>, RecvTimeoutError> {
                self.recv_inner(first, Some(deadline))
            }

            fn recv_inner(
                &self,
                first: usize,
                deadline: Option<Instant>,
            ) -> Result<$Select<$($T::Item),+>, RecvTimeoutError> {
                let mut idle = 0;
                loop {
                    let (item, closed) = self.poll(first);
                    if let Some(item) = item {
                        return Ok(item);
                    }
                    if closed.count_ones() as usize == $len {
                        return Err(RecvTimeoutError::Closed);
                    }

                    idle += 1;
                    if idle <= SPINS {
                        std::hint::spin_loop();
                        continue;
                    }
                    if idle <= SPINS + YIELDS {
                        std::thread::yield_now();
                        continue;
                    }

                    // Park on every source that is still open. A source that
                    // became ready between the poll above and the wait fails
                    // its expected-value check and we drain again.
                    let mut keys = Vec::with_capacity($len);
                    $(
                        if closed & (1 << $idx) == 0 {
                            keys.push(self.$field.prepare_park());
                        }
                    )+
                    // Safety: every key addresses a channel state word kept
                    // alive by the borrowed receivers.
                    match unsafe { self.futex.wait_v(&keys, 0, deadline) } {
                        Ok(_) | Err(WaitError::Invalid) => idle = 0,
                        Err(WaitError::Timeout) => return Err(RecvTimeoutError::Timeout),
                        Err(WaitError::KeyError) => {
                            unreachable!("channel state words are valid keys")
                        }
                    }
                }
            }

            /// One polling round: tries each source once in rotated order.
            /// Returns the first element found and the bitmask of sources
            /// that reported closed.
            fn poll(&self, first: usize) -> (Option<$Select<$($T::Item),+>>, u8) {
                let mut closed = 0u8;
                for k in 0..$len {
                    let idx = (first + k) % $len;
                    match self.poll_at(idx) {
                        Ok(item) => return (Some(item), closed),
                        Err(TryRecvError::Closed) => closed |= 1 << idx,
                        Err(TryRecvError::Empty) => {}
                    }
                }
                (None, closed)
            }

            fn poll_at(&self, idx: usize) -> Result<$Select<$($T::Item),+>, TryRecvError> {
                match idx {
                    $($idx => self.$field.try_recv_one().map($Select::$Var),)+
                    _ => unreachable!(),
                }
            }
        }
    };
}

multi_receiver! {
    /// A blocking receive over two heterogeneous receivers.
    MultiReceiver2, Select2, 2 => (0, first, A, First), (1, second, B, Second)
}

multi_receiver! {
    /// A blocking receive over three heterogeneous receivers.
    MultiReceiver3, Select3, 3 => (0, first, A, First), (1, second, B, Second), (2, third, C, Third)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{spmc, unbounded};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn tuple_order_and_rotation() {
        let futex = Arc::new(Futex::new());
        let (tx_a, rx_a) = spmc::channel::<u32>(8, Arc::clone(&futex));
        let (tx_b, rx_b) = unbounded::channel::<&str>(Arc::clone(&futex));

        let multi = MultiReceiver2::new(&futex, &rx_a, &rx_b);

        tx_a.try_send(1).unwrap();
        tx_b.send("one").unwrap();

        // tuple order: the spmc channel wins
        assert_eq!(multi.try_recv().unwrap(), Select2::First(1));
        // rotated: the unbounded channel is consulted first
        assert_eq!(multi.try_recv_from(1).unwrap(), Select2::Second("one"));
        assert_eq!(multi.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn closed_only_when_all_closed() {
        let futex = Arc::new(Futex::new());
        let (tx_a, rx_a) = spmc::channel::<u32>(8, Arc::clone(&futex));
        let (tx_b, rx_b) = unbounded::channel::<u32>(Arc::clone(&futex));

        let multi = MultiReceiver2::new(&futex, &rx_a, &rx_b);

        drop(tx_a); // closes the first channel
        assert_eq!(multi.try_recv().unwrap_err(), TryRecvError::Empty);

        tx_b.send(5).unwrap();
        assert_eq!(multi.try_recv().unwrap(), Select2::Second(5));

        drop(tx_b);
        assert_eq!(multi.try_recv().unwrap_err(), TryRecvError::Closed);
    }

    #[test]
    fn recv_wakes_from_either_source() {
        let futex = Arc::new(Futex::new());
        let (tx_a, rx_a) = spmc::channel::<u32>(8, Arc::clone(&futex));
        let (tx_b, rx_b) = unbounded::channel::<u32>(Arc::clone(&futex));

        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            tx_b.send(42).unwrap();
            thread::sleep(Duration::from_millis(30));
            tx_a.try_send(7).unwrap();
            // keep the channels open while the receiver drains
            thread::sleep(Duration::from_millis(50));
            drop((tx_a, tx_b));
        });

        let multi = MultiReceiver2::new(&futex, &rx_a, &rx_b);
        assert_eq!(multi.recv().unwrap(), Select2::Second(42));
        assert_eq!(multi.recv().unwrap(), Select2::First(7));
        assert_eq!(multi.recv().unwrap_err(), Closed);

        sender.join().unwrap();
    }

    #[test]
    fn recv_until_times_out() {
        let futex = Arc::new(Futex::new());
        let (_tx_a, rx_a) = spmc::channel::<u32>(8, Arc::clone(&futex));
        let (_tx_b, rx_b) = unbounded::channel::<u32>(Arc::clone(&futex));

        let multi = MultiReceiver2::new(&futex, &rx_a, &rx_b);
        let res = multi.recv_until(0, Instant::now() + Duration::from_millis(30));
        assert_eq!(res.unwrap_err(), RecvTimeoutError::Timeout);
    }

    #[test]
    fn three_way_select() {
        let futex = Arc::new(Futex::new());
        let (tx_a, rx_a) = spmc::channel::<u8>(4, Arc::clone(&futex));
        let (tx_b, rx_b) = unbounded::channel::<u16>(Arc::clone(&futex));
        let (tx_c, rx_c) = unbounded::channel::<u32>(Arc::clone(&futex));

        let multi = MultiReceiver3::new(&futex, &rx_a, &rx_b, &rx_c);

        tx_c.send(3).unwrap();
        assert_eq!(multi.try_recv().unwrap(), Select3::Third(3));

        tx_a.try_send(1).unwrap();
        tx_b.send(2).unwrap();
        assert_eq!(multi.try_recv_from(2).unwrap(), Select3::First(1));
        assert_eq!(multi.try_recv().unwrap(), Select3::Second(2));
    }
}
