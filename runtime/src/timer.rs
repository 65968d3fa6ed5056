// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The pool's hierarchical timer wheel.
//!
//! Six wheels of 64 slots each, with a tick of one millisecond: wheel `x`
//! has a slot width of `64^x` ticks, so the timer tracks deadlines up to
//! `64^6` ms (~2 years) into the future at millisecond precision. Entries
//! land in the wheel matching the highest differing bit group between their
//! deadline and the current time; turning the wheel repeatedly drains
//! expired slots and re-files entries whose deadline is still ahead onto a
//! lower (finer) wheel.
//!
//! The scheduler thread owns the turning; registration happens under the
//! core mutex so workers and the scheduler can insert concurrently.

use crate::task::TaskRef;
use cordyceps::{Linked, list};
use std::fmt;
use std::marker::PhantomPinned;
use std::mem::offset_of;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use weft_futex::WaitId;

/// Why a task is registered with the timer.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TimerKind {
    /// A plain sleep; firing requeues the task.
    Sleep,
    /// The deadline of a futex wait; firing cancels the wait entry and
    /// requeues the task with its timeout flag set. If the wait was already
    /// woken the firing is a no-op.
    Wait { id: WaitId },
}

/// A timer wheel entry. Box-owned by the wheel while registered.
pub(crate) struct Entry {
    links: list::Links<Entry>,
    /// Absolute deadline in timer ticks.
    deadline: u64,
    pub(crate) kind: TimerKind,
    pub(crate) task: TaskRef,
    _pin: PhantomPinned,
}

// Safety: entries are owned by the wheel (under its mutex) from insertion
// until they are handed back out of `advance`.
unsafe impl Send for Entry {}
// Safety: see above.
unsafe impl Sync for Entry {}

// Safety: `links` is the entry's intrusive link field; boxed entries never
// move while linked.
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

/// One level of the hierarchy.
struct Wheel {
    level: usize,
    slots: [list::List<Entry>; Wheel::SLOTS],
    /// Bitmap of non-empty slots.
    occupied: u64,
}

pub(crate) struct Timer {
    start: Instant,
    core: Mutex<Core>,
}

struct Core {
    /// Ticks elapsed since `start` as of the last turn.
    now: u64,
    wheels: [Wheel; Core::WHEELS],
}

// === impl Wheel ===

impl Wheel {
    const SLOTS: usize = 64;
    const BITS: usize = 6;

    fn new(level: usize) -> Self {
        Self {
            level,
            slots: std::array::from_fn(|_| list::List::new()),
            occupied: 0,
        }
    }

    /// The slot a deadline belongs to on this wheel.
    fn slot_for(&self, ticks: u64) -> usize {
        usize::try_from((ticks >> (self.level * Self::BITS)) & (Self::SLOTS as u64 - 1)).unwrap()
    }

    fn insert(&mut self, ticks: u64, entry: NonNull<Entry>) {
        let slot = self.slot_for(ticks);
        self.slots[slot].push_back(entry);
        self.occupied |= 1 << slot;
    }

    fn take_slot(&mut self, slot: usize) -> list::List<Entry> {
        self.occupied &= !(1 << slot);
        std::mem::replace(&mut self.slots[slot], list::List::new())
    }

    /// The earliest tick at which a slot of this wheel may hold an expiring
    /// entry, relative to `now`. Entries may be re-filed to a finer wheel
    /// when their slot turns out to be early; waking early is always sound.
    fn next_expiry(&self, now: u64) -> Option<(u64, usize)> {
        if self.occupied == 0 {
            return None;
        }

        let slot_width = 1_u64 << (self.level * Self::BITS);
        let period = slot_width << Self::BITS;
        let base = now & !(period - 1);

        let mut earliest: Option<(u64, usize)> = None;
        let mut occupied = self.occupied;
        while occupied != 0 {
            let slot = occupied.trailing_zeros() as usize;
            occupied &= occupied - 1;

            let mut ticks = base + (slot as u64) * slot_width;
            // A slot behind the current position belongs to the next
            // rotation.
            if ticks + slot_width <= now {
                ticks += period;
            }
            let candidate = ticks.max(now);
            if earliest.is_none_or(|(t, _)| candidate < t) {
                earliest = Some((candidate, slot));
            }
        }
        earliest
    }
}

// === impl Timer ===

impl Timer {
    const WHEEL_MASK: u64 = (1 << Wheel::BITS) - 1;
    pub(crate) const TICK: Duration = Duration::from_millis(1);

    pub(crate) fn new(start: Instant) -> Self {
        Self {
            start,
            core: Mutex::new(Core {
                now: 0,
                wheels: std::array::from_fn(Wheel::new),
            }),
        }
    }

    fn ticks_at(&self, instant: Instant) -> u64 {
        let elapsed = instant.saturating_duration_since(self.start);
        u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
    }

    fn instant_at(&self, ticks: u64) -> Instant {
        self.start + Self::TICK * u32::try_from(ticks.min(u64::from(u32::MAX))).unwrap()
    }

    /// Registers a task with the wheel. Deadlines are rounded up to the next
    /// tick so an expiry never fires early.
    pub(crate) fn insert(&self, deadline: Instant, kind: TimerKind, task: TaskRef) {
        let mut core = self.core.lock().unwrap();

        let elapsed = deadline.saturating_duration_since(self.start);
        let mut ticks = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        if Self::TICK * u32::try_from(ticks.min(u64::from(u32::MAX))).unwrap() < elapsed {
            ticks += 1;
        }
        // an already-expired deadline still takes a full turn through the
        // wheel; file it in the immediate future
        let ticks = ticks.max(core.now + 1);

        let entry = Box::new(Entry {
            links: list::Links::new(),
            deadline: ticks,
            kind,
            task,
            _pin: PhantomPinned,
        });
        core.insert_at(ticks, NonNull::from(Box::leak(entry)));
    }

    /// Turns the wheel up to the current time, returning the expired entries
    /// and the instant of the next pending expiry.
    pub(crate) fn advance(&self) -> (Vec<Box<Entry>>, Option<Instant>) {
        let now = self.ticks_at(Instant::now());
        let mut core = self.core.lock().unwrap();

        let expired = core.poll(now);
        let next = core.next_expiry().map(|ticks| self.instant_at(ticks));
        (expired, next)
    }

    /// Drops every registered entry. Used during pool teardown.
    pub(crate) fn drain(&self) {
        let mut core = self.core.lock().unwrap();
        for wheel in &mut core.wheels {
            for slot in 0..Wheel::SLOTS {
                let mut list = wheel.take_slot(slot);
                while let Some(ptr) = list.pop_front() {
                    // Safety: the wheel owns its boxed entries.
                    drop(unsafe { Box::from_raw(ptr.as_ptr()) });
                }
            }
        }
    }

    /// The wheel level an entry for `ticks` belongs on, given the current
    /// time: the level of the highest bit group in which the two differ.
    fn wheel_index(now: u64, ticks: u64) -> usize {
        const MAX_SLEEP_TICKS: u64 = (1 << (Wheel::BITS * Core::WHEELS)) - 1;

        // mask out the bits representing the index in the lowest wheel
        let mut wheel_indices = now ^ ticks | Self::WHEEL_MASK;

        // deadlines over the max duration go in the top level wheel
        if wheel_indices >= MAX_SLEEP_TICKS {
            wheel_indices = MAX_SLEEP_TICKS - 1;
        }

        let zeros = wheel_indices.leading_zeros();
        let rest = u64::BITS - 1 - zeros;

        rest as usize / Wheel::BITS
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock().unwrap();
        f.debug_struct("Timer")
            .field("now", &core.now)
            .field("next", &core.next_expiry())
            .finish()
    }
}

// === impl Core ===

impl Core {
    const WHEELS: usize = 6;

    fn insert_at(&mut self, ticks: u64, entry: NonNull<Entry>) {
        let wheel = Timer::wheel_index(self.now, ticks);
        self.wheels[wheel].insert(ticks, entry);
    }

    fn next_expiry(&self) -> Option<u64> {
        self.wheels
            .iter()
            .filter_map(|wheel| wheel.next_expiry(self.now).map(|(ticks, _)| ticks))
            .min()
    }

    fn poll(&mut self, now: u64) -> Vec<Box<Entry>> {
        let mut expired = Vec::new();

        // Entries that need to drop to a finer wheel are re-filed only after
        // the slot is fully drained, to avoid processing them twice in one
        // turn.
        let mut pending_reschedule = Vec::new();

        loop {
            let Some((ticks, wheel, slot)) = self
                .wheels
                .iter()
                .filter_map(|wheel| {
                    wheel
                        .next_expiry(self.now)
                        .map(|(ticks, slot)| (ticks, wheel.level, slot))
                })
                .min_by_key(|&(ticks, _, _)| ticks)
            else {
                break;
            };

            if ticks > now {
                break;
            }

            let mut entries = self.wheels[wheel].take_slot(slot);
            while let Some(ptr) = entries.pop_front() {
                // Safety: the wheel owns its boxed entries.
                let entry = unsafe { Box::from_raw(ptr.as_ptr()) };

                if entry.deadline <= now {
                    expired.push(entry);
                } else {
                    // still ahead; re-file on a finer wheel once the slot is
                    // drained
                    pending_reschedule.push(entry);
                }
            }

            self.now = ticks.max(self.now);
        }

        self.now = now.max(self.now);

        for entry in pending_reschedule {
            let ticks = entry.deadline;
            debug_assert!(ticks > self.now);
            self.insert_at(ticks, NonNull::from(Box::leak(entry)));
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    fn dummy_task() -> TaskRef {
        TaskRef::new(NonNull::dangling())
    }

    fn collect_deadlines(timer: &Timer) -> Vec<u64> {
        let (expired, _) = timer.advance();
        expired.into_iter().map(|e| e.deadline).collect()
    }

    #[test]
    fn nothing_expires_early() {
        let timer = Timer::new(Instant::now());
        timer.insert(
            Instant::now() + Duration::from_millis(200),
            TimerKind::Sleep,
            dummy_task(),
        );

        let (expired, next) = timer.advance();
        assert!(expired.is_empty());
        let next = next.expect("an entry is pending");
        assert!(next <= Instant::now() + Duration::from_millis(250));
    }

    #[test]
    fn expired_entries_fire() {
        let timer = Timer::new(Instant::now() - Duration::from_secs(1));
        timer.insert(
            Instant::now() - Duration::from_millis(5),
            TimerKind::Sleep,
            dummy_task(),
        );

        std::thread::sleep(Duration::from_millis(5));
        let fired = collect_deadlines(&timer);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn fires_in_deadline_order_across_wheels() {
        let start = Instant::now();
        let timer = Timer::new(start);

        // deadlines spanning several wheel levels
        for ms in [3_u64, 70, 5000, 200_000] {
            timer.insert(
                start + Duration::from_millis(ms),
                TimerKind::Sleep,
                dummy_task(),
            );
        }

        let (expired, next) = timer.advance();
        assert!(expired.is_empty());
        // the next expiry estimate is never later than the earliest deadline
        assert!(next.unwrap() <= start + Duration::from_millis(3));

        std::thread::sleep(Duration::from_millis(10));
        let fired = collect_deadlines(&timer);
        assert_eq!(fired.len(), 1, "only the 3ms entry has expired");

        timer.drain();
        let (expired, next) = timer.advance();
        assert!(expired.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn long_deadline_reschedules_downward() {
        let start = Instant::now() - Duration::from_millis(100);
        let timer = Timer::new(start);

        // lands on wheel 1 initially (70ms ahead of now=100ms)
        timer.insert(
            start + Duration::from_millis(170),
            TimerKind::Sleep,
            dummy_task(),
        );

        // advancing before the deadline must not fire it
        let (expired, next) = timer.advance();
        assert!(expired.is_empty());
        assert!(next.is_some());
    }
}
