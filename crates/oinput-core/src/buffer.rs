//! Fixed-capacity ring buffer of events with overwrite-on-full semantics.
//!
//! # Shape
//!
//! The buffer is an arena of `capacity` pre-allocated [`Event`] slots with two
//! index cursors:
//!
//! ```text
//!   tail ──► oldest unread slot          head ──► next slot to write
//!   ┌────┬────┬────┬────┬────┬────┬────┬────┐
//!   │    │ e1 │ e2 │ e3 │ e4 │    │    │    │   available = 4
//!   └────┴────┴────┴────┴────┴────┴────┴────┘
//! ```
//!
//! Producers never wait for the consumer.  When every slot holds an unread
//! event, the next [`EventBuffer::write_head`] reuses the oldest unread slot,
//! moves `tail` forward past it, and counts one dropped event.  Memory stays
//! bounded and overload shows up only in [`EventBuffer::dropped_count`].
//!
//! # Locking
//!
//! [`EventQueue`] wraps the buffer in a single mutex.  A producer holds the
//! guard across one or more writes, the consumer holds it across one full
//! [`EventBuffer::drain`].  There is no condition variable: nobody blocks on
//! an empty or full buffer.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::event::Event;

/// Default buffer capacity.
pub const DEFAULT_MAX_EVENTS: usize = 1024;

/// The ring buffer itself.  See the module docs for the overwrite policy.
#[derive(Debug)]
pub struct EventBuffer {
    slots: Vec<Event>,
    head: usize,
    tail: usize,
    available: usize,
    dropped: u64,
}

impl EventBuffer {
    /// Allocates a buffer with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "event buffer capacity must be non-zero");
        Self {
            slots: vec![Event::default(); capacity],
            head: 0,
            tail: 0,
            available: 0,
            dropped: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of unread events.  Never exceeds [`capacity`](Self::capacity).
    pub fn available_count(&self) -> usize {
        self.available
    }

    /// Events overwritten before they were read, since the last
    /// [`reset_dropped`](Self::reset_dropped).
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn reset_dropped(&mut self) {
        self.dropped = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.available == 0
    }

    /// Claims the next slot for writing and returns it.
    ///
    /// The slot may still contain an old event; callers normally start with
    /// [`Event::reset`] or overwrite it wholesale.  If the buffer is full the
    /// oldest unread event is sacrificed.
    pub fn write_head(&mut self) -> &mut Event {
        let index = self.head;
        self.head = self.next_index(self.head);

        if self.available == self.capacity() {
            // Overwriting the oldest unread slot: keep tail on the new oldest.
            self.tail = self.next_index(self.tail);
            self.dropped += 1;
        } else {
            self.available += 1;
        }

        &mut self.slots[index]
    }

    /// Copies `event` into the next slot.
    pub fn push(&mut self, event: &Event) {
        self.write_head().clone_from(event);
    }

    /// Takes the oldest unread event, or `None` if the buffer is empty.
    pub fn read_tail(&mut self) -> Option<&Event> {
        if self.available == 0 {
            return None;
        }
        let index = self.tail;
        self.tail = self.next_index(self.tail);
        self.available -= 1;
        Some(&self.slots[index])
    }

    /// Unread event `index`, counting from the oldest (0) to the newest.
    ///
    /// Does not consume anything.  Lets a later-tier service look at events
    /// written earlier in the same tick.
    pub fn get(&self, index: usize) -> Option<&Event> {
        if index >= self.available {
            return None;
        }
        Some(&self.slots[self.slot_of(index)])
    }

    /// Mutable variant of [`get`](Self::get), for in-place re-stamping.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Event> {
        if index >= self.available {
            return None;
        }
        let slot = self.slot_of(index);
        Some(&mut self.slots[slot])
    }

    /// The most recently written unread event.
    pub fn latest(&self) -> Option<&Event> {
        self.available.checked_sub(1).and_then(|i| self.get(i))
    }

    /// Iterates unread events oldest-first without consuming them.
    pub fn iter(&self) -> impl Iterator<Item = &Event> + '_ {
        (0..self.available).map(move |i| &self.slots[self.slot_of(i)])
    }

    /// Copies up to `max_count` events, oldest first, into `out` and then
    /// **empties the buffer**.
    ///
    /// Events beyond `max_count` are discarded, not retained for the next
    /// call.  The single consumer owns the whole buffer once per tick; a
    /// consumer that asks for fewer events than are available loses the
    /// rest.  This is the relay's discard policy and callers that cannot
    /// afford it must drain with `max_count >= available_count()`.
    ///
    /// Returns the number of events appended to `out`.
    pub fn drain_into(&mut self, max_count: usize, out: &mut Vec<Event>) -> usize {
        let mut copied = 0;
        while copied < max_count {
            match self.read_tail() {
                Some(evt) => {
                    out.push(evt.clone());
                    copied += 1;
                }
                None => break,
            }
        }
        self.clear();
        copied
    }

    /// Convenience wrapper around [`drain_into`](Self::drain_into).
    pub fn drain(&mut self, max_count: usize) -> Vec<Event> {
        let mut out = Vec::with_capacity(max_count.min(self.available));
        self.drain_into(max_count, &mut out);
        out
    }

    /// Discards every unread event and rewinds both cursors.
    ///
    /// The dropped counter is left alone.
    pub fn clear(&mut self) {
        self.available = 0;
        self.head = 0;
        self.tail = 0;
    }

    fn next_index(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.capacity() {
            0
        } else {
            next
        }
    }

    fn slot_of(&self, index: usize) -> usize {
        (self.tail + index) % self.capacity()
    }
}

// ── Shared handle ─────────────────────────────────────────────────────────────

/// Cloneable, thread-safe handle to one [`EventBuffer`].
///
/// Producers on foreign threads (vendor SDK callbacks, a gesture thread) each
/// hold a clone and call [`lock`](Self::lock) around their writes.
#[derive(Debug, Clone)]
pub struct EventQueue {
    inner: Arc<Mutex<EventBuffer>>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBuffer::new(capacity))),
        }
    }

    /// Acquires the buffer lock.
    ///
    /// A producer that panicked while holding the lock leaves the buffer in
    /// a consistent state (every mutation is a few integer updates), so a
    /// poisoned lock is recovered rather than propagated.
    pub fn lock(&self) -> MutexGuard<'_, EventBuffer> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("event buffer lock poisoned by a panicking producer, recovering");
            poisoned.into_inner()
        })
    }

    /// Locks, writes one copy of `event`, unlocks.
    pub fn push(&self, event: &Event) {
        self.lock().push(event);
    }

    pub fn available_count(&self) -> usize {
        self.lock().available_count()
    }

    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped_count()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{EventType, ServiceType};

    fn write_seq(buf: &mut EventBuffer, ids: impl IntoIterator<Item = u32>) {
        for id in ids {
            let evt = buf.write_head();
            evt.reset(EventType::Update, ServiceType::Generic, id, 0, 0);
        }
    }

    fn source_ids(events: &[Event]) -> Vec<u32> {
        events.iter().map(|e| e.source_id).collect()
    }

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = EventBuffer::new(8);
        assert_eq!(buf.available_count(), 0);
        assert_eq!(buf.dropped_count(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_write_then_read_tail_is_fifo() {
        let mut buf = EventBuffer::new(8);
        write_seq(&mut buf, [1, 2, 3]);

        assert_eq!(buf.read_tail().map(|e| e.source_id), Some(1));
        assert_eq!(buf.read_tail().map(|e| e.source_id), Some(2));
        assert_eq!(buf.read_tail().map(|e| e.source_id), Some(3));
        assert!(buf.read_tail().is_none());
    }

    #[test]
    fn test_available_never_exceeds_capacity() {
        let mut buf = EventBuffer::new(4);
        for i in 0..10 {
            write_seq(&mut buf, [i]);
            assert!(buf.available_count() <= 4);
        }
    }

    #[test]
    fn test_overflow_counts_exact_drops() {
        let mut buf = EventBuffer::new(4);
        write_seq(&mut buf, 0..11);

        assert_eq!(buf.available_count(), 4);
        assert_eq!(buf.dropped_count(), 7);
    }

    #[test]
    fn test_overflow_keeps_newest_events_in_order() {
        let mut buf = EventBuffer::new(4);
        write_seq(&mut buf, 0..6);

        let out = buf.drain(usize::MAX);
        assert_eq!(source_ids(&out), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_drain_returns_oldest_first_up_to_max() {
        let mut buf = EventBuffer::new(8);
        write_seq(&mut buf, [10, 11, 12, 13]);

        let out = buf.drain(2);
        assert_eq!(source_ids(&out), vec![10, 11]);
    }

    #[test]
    fn test_drain_discards_events_beyond_max_count() {
        // Deliberate: the buffer is emptied even when the caller asked for
        // fewer events than were available.
        let mut buf = EventBuffer::new(8);
        write_seq(&mut buf, [1, 2, 3, 4, 5]);

        let out = buf.drain(2);

        assert_eq!(out.len(), 2);
        assert_eq!(buf.available_count(), 0);
        assert!(buf.read_tail().is_none());
    }

    #[test]
    fn test_drain_rewinds_cursors() {
        let mut buf = EventBuffer::new(4);
        write_seq(&mut buf, [1, 2, 3]);
        buf.drain(1);

        write_seq(&mut buf, [9]);
        assert_eq!(buf.get(0).map(|e| e.source_id), Some(9));
    }

    #[test]
    fn test_drain_does_not_reset_dropped() {
        let mut buf = EventBuffer::new(2);
        write_seq(&mut buf, 0..5);
        buf.drain(usize::MAX);

        assert_eq!(buf.dropped_count(), 3);
        buf.reset_dropped();
        assert_eq!(buf.dropped_count(), 0);
    }

    #[test]
    fn test_get_and_latest_index_from_oldest() {
        let mut buf = EventBuffer::new(3);
        write_seq(&mut buf, [1, 2, 3, 4]);

        assert_eq!(buf.get(0).map(|e| e.source_id), Some(2));
        assert_eq!(buf.latest().map(|e| e.source_id), Some(4));
        assert!(buf.get(3).is_none());
        assert_eq!(buf.available_count(), 3, "peeking must not consume");
    }

    #[test]
    fn test_get_mut_edits_in_place() {
        let mut buf = EventBuffer::new(4);
        write_seq(&mut buf, [1]);

        if let Some(evt) = buf.get_mut(0) {
            evt.service_type = ServiceType::Wand;
        }

        assert_eq!(buf.read_tail().map(|e| e.service_type), Some(ServiceType::Wand));
    }

    #[test]
    fn test_iter_walks_wrapped_ring() {
        let mut buf = EventBuffer::new(3);
        write_seq(&mut buf, [1, 2, 3]);
        buf.read_tail();
        write_seq(&mut buf, [4]);

        let ids: Vec<u32> = buf.iter().map(|e| e.source_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_queue_is_shared_across_threads() {
        let queue = EventQueue::new(DEFAULT_MAX_EVENTS);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let mut guard = q.lock();
                        guard
                            .write_head()
                            .reset(EventType::Move, ServiceType::Pointer, t * 1000 + i, 0, 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("producer thread panicked");
        }

        assert_eq!(queue.available_count(), 400);
        assert_eq!(queue.dropped_count(), 0);
    }

    #[test]
    fn test_queue_recovers_from_poisoned_lock() {
        let queue = EventQueue::new(4);
        let q = queue.clone();
        let result = std::thread::spawn(move || {
            let mut guard = q.lock();
            guard
                .write_head()
                .reset(EventType::Update, ServiceType::Mocap, 1, 0, 0);
            panic!("producer died holding the lock");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(queue.available_count(), 1);
        queue.push(&Event::new(EventType::Update, ServiceType::Mocap));
        assert_eq!(queue.available_count(), 2);
    }
}
