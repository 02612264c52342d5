//! Bounded FIFO for packets that arrived before a route exists.
//!
//! Members queue locally originated datagrams here while their transmit
//! window is closed; the queue drains when a route materializes (slot start,
//! or steady state with no head). Capacity overflow evicts the oldest entry,
//! and entries that sat longer than the configured maximum expire on the
//! next drain attempt instead of being transmitted stale.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use crate::engine::clock::{Duration, Instant};
use crate::net::{DataPacket, Ipv4Header};

/// One deferred packet with its header and arrival time.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub packet: DataPacket,
    pub header: Ipv4Header,
    pub queued_at: Instant,
}

impl QueueEntry {
    fn is_expired(&self, now: Instant, max_delay: Duration) -> bool {
        now.duration_since(self.queued_at) > max_delay
    }
}

/// Capacity- and time-bounded drop-front FIFO.
#[derive(Debug)]
pub struct DeferredQueue {
    entries: VecDeque<QueueEntry>,
    max_len: usize,
    max_delay: Duration,
}

impl DeferredQueue {
    pub fn new(max_len: usize, max_delay: Duration) -> Self {
        DeferredQueue {
            entries: VecDeque::with_capacity(max_len.min(64)),
            max_len,
            max_delay,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enqueue a packet. When the queue is full the oldest entry is evicted
    /// and returned so the caller can account for the drop.
    pub fn push(
        &mut self,
        packet: DataPacket,
        header: Ipv4Header,
        now: Instant,
    ) -> Option<QueueEntry> {
        let evicted = if self.entries.len() >= self.max_len {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(QueueEntry {
            packet,
            header,
            queued_at: now,
        });
        evicted
    }

    /// Remove every entry whose header destination matches, splitting them
    /// into entries still worth sending and entries that expired in the
    /// queue.
    pub fn drain_for(
        &mut self,
        destination: Ipv4Addr,
        now: Instant,
    ) -> (Vec<QueueEntry>, Vec<QueueEntry>) {
        let mut ready = Vec::new();
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.header.destination != destination {
                kept.push_back(entry);
            } else if entry.is_expired(now, self.max_delay) {
                expired.push(entry);
            } else {
                ready.push(entry);
            }
        }
        self.entries = kept;
        (ready, expired)
    }

    /// Remove every entry, splitting as in [`DeferredQueue::drain_for`].
    pub fn drain_all(&mut self, now: Instant) -> (Vec<QueueEntry>, Vec<QueueEntry>) {
        let mut ready = Vec::new();
        let mut expired = Vec::new();
        for entry in self.entries.drain(..) {
            if entry.is_expired(now, self.max_delay) {
                expired.push(entry);
            } else {
                ready.push(entry);
            }
        }
        (ready, expired)
    }
}
