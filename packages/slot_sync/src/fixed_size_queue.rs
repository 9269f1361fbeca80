//! Bounded multi-producer multi-consumer queue on top of a [`Bucket`].

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

use crate::Bucket;

/// A bounded queue whose entries live in the slots of a [`Bucket`].
///
/// Adders and takers each draw tickets from their own counter and a ticket maps to a slot of the
/// bucket. Two further counters gate the tickets: one bounds the number of entries stored or in
/// flight by the capacity, the other only lets a taker draw a ticket once an adder has committed
/// an entry for it. Neither side ever takes a lock.
///
/// A ticket holder may have to wait briefly for the peer that owns the same slot to finish its
/// own swap - that peer is always already in flight when this happens.
///
/// Entries usually come out in the order they went in but no strict ordering is guaranteed under
/// concurrency. Every entry is taken at most once.
///
/// # Example
///
/// ```rust
/// use slot_sync::FixedSizeQueue;
///
/// let queue = FixedSizeQueue::new(2);
///
/// assert!(queue.try_add("a").is_ok());
/// assert!(queue.try_add("b").is_ok());
/// assert_eq!(queue.try_add("c"), Err("c"));
///
/// assert_eq!(queue.try_take(), Some("a"));
/// assert_eq!(queue.try_take(), Some("b"));
/// assert_eq!(queue.try_take(), None);
/// ```
pub struct FixedSizeQueue<T> {
    entries: Bucket<T>,

    // The number of entries the queue accepts. The bucket may be larger because we need
    // a power-of-two slot count to map tickets onto slots across counter wraparound.
    capacity: usize,

    slot_mask: usize,

    // Entries that are stored, being stored or being taken. Bounded by `capacity`.
    reserved: AtomicUsize,

    // Entries that are stored and not yet claimed by a taker.
    available: AtomicUsize,

    add_ticket: AtomicUsize,
    take_ticket: AtomicUsize,
}

impl<T> FixedSizeQueue<T> {
    /// Creates a queue that holds at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or too large to round up to a power of two.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "FixedSizeQueue must have non-zero capacity");

        let slot_count = capacity
            .checked_next_power_of_two()
            .expect("FixedSizeQueue capacity is too large to round up to a power of two");

        Self {
            entries: Bucket::new(slot_count),
            capacity,
            slot_mask: slot_count.wrapping_sub(1),
            reserved: AtomicUsize::new(0),
            available: AtomicUsize::new(0),
            add_ticket: AtomicUsize::new(0),
            take_ticket: AtomicUsize::new(0),
        }
    }

    /// The maximum number of entries the queue holds.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of entries currently stored.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.count()
    }

    /// Whether the queue holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds an entry to the queue.
    ///
    /// # Errors
    ///
    /// Returns the entry back if the queue is full.
    #[cfg_attr(test, mutants::skip)] // Mutating the wait loop turns into hangs.
    pub fn try_add(&self, item: T) -> Result<(), T> {
        // Acquire on success pairs with the Release in `try_take`, so we observe the slot that
        // taker emptied before we try to fill it.
        if self
            .reserved
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |reserved| {
                (reserved < self.capacity).then(|| reserved.wrapping_add(1))
            })
            .is_err()
        {
            return Err(item);
        }

        // Wrapping is fine: the slot count is a power of two, so tickets keep mapping to the
        // same slot sequence across the wraparound.
        let ticket = self.add_ticket.fetch_add(1, Ordering::Relaxed);
        let index = ticket & self.slot_mask;

        let item = Arc::new(item);
        let backoff = Backoff::new();

        // The slot may still hold the entry of a lapped ticket whose taker is in flight.
        while !self.entries.insert(index, Arc::clone(&item)) {
            backoff.snooze();
        }

        drop(item);

        // Release publishes the stored entry to the taker that claims it.
        self.available.fetch_add(1, Ordering::Release);

        Ok(())
    }

    /// Takes an entry from the queue, if there is one.
    #[cfg_attr(test, mutants::skip)] // Mutating the wait loop turns into hangs.
    pub fn try_take(&self) -> Option<T> {
        // Acquire pairs with the Release in `try_add`.
        self.available
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |available| {
                available.checked_sub(1)
            })
            .ok()?;

        let ticket = self.take_ticket.fetch_add(1, Ordering::Relaxed);
        let index = ticket & self.slot_mask;

        let backoff = Backoff::new();

        let mut entry = loop {
            if let Some(entry) = self.entries.take(index) {
                break entry;
            }

            // The adder holding the matching ticket has not stored its entry yet.
            backoff.snooze();
        };

        // An adder that found this slot occupied may still hold a transient reference.
        let item = loop {
            match Arc::try_unwrap(entry) {
                Ok(item) => break item,
                Err(shared) => {
                    entry = shared;
                    backoff.snooze();
                }
            }
        };

        // Release hands the emptied slot to the next adder that reserves a place.
        self.reserved.fetch_sub(1, Ordering::Release);

        Some(item)
    }
}

impl<T> fmt::Debug for FixedSizeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("capacity", &self.capacity)
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}
