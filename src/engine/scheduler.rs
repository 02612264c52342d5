//! Ordered event queue and cancellable one-shot timers.
//!
//! The queue is a `BTreeMap` keyed by (deadline, insertion sequence): the
//! same ordered-wakeup structure a virtual time driver uses, reduced to pure
//! virtual time. Two events scheduled for the same instant pop in insertion
//! order, which is the only ordering guarantee handlers may rely on.
//!
//! `Timer` implements explicit cancel and re-arm without any destructor
//! magic. Arming hands out a generation ticket; the event carrying the
//! ticket is accepted only if no cancel or re-arm happened in between, so a
//! stale firing left in the queue is ignored instead of cancelled in place.

use std::collections::BTreeMap;

use super::clock::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EventKey {
    at: Instant,
    seq: u64,
}

/// Time-ordered event queue with stable FIFO dispatch at equal instants.
#[derive(Debug)]
pub struct EventScheduler<E> {
    queue: BTreeMap<EventKey, E>,
    now: Instant,
    next_seq: u64,
}

impl<E> EventScheduler<E> {
    pub fn new() -> Self {
        EventScheduler {
            queue: BTreeMap::new(),
            now: Instant::ZERO,
            next_seq: 0,
        }
    }

    /// Current virtual time: the deadline of the most recently popped event.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Schedule an event at an absolute instant. Deadlines in the past are
    /// clamped to `now` so they still run, after everything already queued
    /// for the current instant.
    pub fn schedule_at(&mut self, at: Instant, event: E) {
        let at = at.max(self.now);
        let key = EventKey {
            at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.queue.insert(key, event);
    }

    pub fn schedule_after(&mut self, delay: Duration, event: E) {
        self.schedule_at(self.now + delay, event);
    }

    pub fn schedule_now(&mut self, event: E) {
        self.schedule_at(self.now, event);
    }

    /// Pop the next event and advance the clock to its deadline.
    pub fn pop_due(&mut self) -> Option<(Instant, E)> {
        let (&key, _) = self.queue.iter().next()?;
        let event = self.queue.remove(&key)?;
        self.now = key.at;
        Some((key.at, event))
    }

    /// Deadline of the earliest queued event, if any.
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|key| key.at)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<E> Default for EventScheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that a particular `Timer::arm` call is still the latest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTicket {
    generation: u64,
}

/// One-shot timer with explicit cancel and re-arm.
///
/// The timer itself holds no deadline; the owner schedules an event carrying
/// the ticket returned by [`Timer::arm`] and calls [`Timer::try_fire`] when
/// that event is dispatched. Cancelling or re-arming invalidates every
/// ticket handed out before, making stale queue entries harmless.
#[derive(Debug, Default)]
pub struct Timer {
    generation: u64,
    armed: bool,
}

impl Timer {
    pub fn new() -> Self {
        Timer::default()
    }

    /// Arm the timer, superseding any earlier arm.
    pub fn arm(&mut self) -> TimerTicket {
        self.generation += 1;
        self.armed = true;
        TimerTicket {
            generation: self.generation,
        }
    }

    /// Cancel a pending firing. Idempotent.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Accept a firing if `ticket` matches the latest arm; disarms on
    /// success so a ticket fires at most once.
    pub fn try_fire(&mut self, ticket: TimerTicket) -> bool {
        if self.armed && ticket.generation == self.generation {
            self.armed = false;
            true
        } else {
            false
        }
    }
}
