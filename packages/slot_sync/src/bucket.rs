//! Fixed-capacity array of independently atomic slots.

use std::any::type_name;
use std::fmt;
use std::iter::FusedIterator;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};

use arc_swap::ArcSwapOption;
use crossbeam::utils::Backoff;

use crate::Error;

/// Decides whether two values are equal for the purpose of a conditional bucket operation.
///
/// Any `Fn(&T, &T) -> bool` closure is a comparer. Use [`DefaultComparer`] to compare via
/// [`PartialEq`].
pub trait Comparer<T: ?Sized> {
    /// Returns `true` if `left` and `right` are to be considered equal.
    fn equals(&self, left: &T, right: &T) -> bool;
}

impl<T, F> Comparer<T> for F
where
    T: ?Sized,
    F: Fn(&T, &T) -> bool,
{
    fn equals(&self, left: &T, right: &T) -> bool {
        self(left, right)
    }
}

/// Compares values using their [`PartialEq`] implementation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DefaultComparer;

impl<T> Comparer<T> for DefaultComparer
where
    T: PartialEq + ?Sized,
{
    fn equals(&self, left: &T, right: &T) -> bool {
        left == right
    }
}

/// The result of a conditional update of a bucket slot.
#[derive(Debug)]
#[must_use]
#[expect(
    clippy::exhaustive_enums,
    reason = "a compare-and-swap has exactly these outcomes and callers are expected to match on them"
)]
pub enum UpdateOutcome<T> {
    /// The slot held a value that passed the check and it was replaced.
    Updated {
        /// The value that was replaced. This is the same value the check was evaluated against.
        previous: Arc<T>,
    },

    /// The slot held a value that did not pass the check. The slot was not modified.
    Rejected {
        /// The value the check was evaluated against.
        current: Arc<T>,
    },

    /// The slot was empty, so there was nothing to update.
    Empty,
}

impl<T> UpdateOutcome<T> {
    /// Whether the update was applied.
    #[must_use]
    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }

    /// Whether the update found the slot empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// The value that was replaced, if the update was applied.
    #[must_use]
    pub fn previous(self) -> Option<Arc<T>> {
        match self {
            Self::Updated { previous } => Some(previous),
            Self::Rejected { .. } | Self::Empty => None,
        }
    }
}

/// A fixed-capacity array of slots, each of which is either empty or holds one value.
///
/// Every slot is mutated independently through atomic compare-and-swap on a reference-counted
/// handle to the stored value, so operations on different indexes never contend with each other
/// and operations on the same index are totally ordered by their winning swap. No lock ever
/// protects the bucket as a whole.
///
/// Values are handed out as [`Arc<T>`] because a reader may observe a value at the same moment
/// another thread replaces it - the reader keeps the old value alive for as long as it needs it.
///
/// # Count
///
/// [`count()`][Self::count] is maintained by the operation that wins the slot transition, right
/// after its swap. Under concurrent mutation it may briefly lag behind the slots themselves but
/// it never drifts: every transition between empty and occupied adjusts it exactly once.
///
/// # Panics
///
/// Every operation that takes an index panics if the index is not less than the capacity.
/// An out-of-range index is a programming error, not a contention outcome.
///
/// # Example
///
/// ```rust
/// use slot_sync::Bucket;
///
/// let bucket = Bucket::<String>::new(4);
///
/// assert!(bucket.insert(0, "a".to_string()));
/// assert!(!bucket.insert(0, "b".to_string()));
/// assert_eq!(bucket.count(), 1);
///
/// let previous = bucket.exchange(0, "b".to_string()).unwrap();
/// assert_eq!(*previous, "a");
/// assert_eq!(*bucket.try_get(0).unwrap(), "b");
/// ```
pub struct Bucket<T> {
    slots: Box<[ArcSwapOption<T>]>,

    // Signed because the thread that empties a slot may adjust the count before the thread that
    // filled the slot got around to it. Readers clamp at zero.
    count: AtomicIsize,
}

impl<T> Bucket<T> {
    /// Creates a bucket with `capacity` empty slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| ArcSwapOption::const_empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            count: AtomicIsize::new(0),
        }
    }

    /// The number of slots in the bucket. Valid indexes are `0..capacity`.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The number of occupied slots.
    #[must_use]
    pub fn count(&self) -> usize {
        // Relaxed is enough - the counter is advisory and does not publish slot contents.
        usize::try_from(self.count.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Whether no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Stores `item` in the slot at `index` if the slot is empty.
    ///
    /// Returns `true` if the item was stored. Of any number of threads racing to insert into the
    /// same empty slot, exactly one succeeds.
    ///
    /// # Example
    ///
    /// ```rust
    /// use slot_sync::Bucket;
    ///
    /// let bucket = Bucket::new(2);
    ///
    /// assert!(bucket.insert(1, 42));
    /// assert!(!bucket.insert(1, 43));
    /// assert_eq!(*bucket.try_get(1).unwrap(), 42);
    /// ```
    pub fn insert(&self, index: usize, item: impl Into<Arc<T>>) -> bool {
        self.try_insert(index, item).is_ok()
    }

    /// Stores `item` in the slot at `index` if the slot is empty.
    ///
    /// If the slot is occupied, the slot is left unchanged and its current occupant is returned
    /// in the `Err` variant. The rejected item is dropped.
    ///
    /// # Example
    ///
    /// ```rust
    /// use slot_sync::Bucket;
    ///
    /// let bucket = Bucket::<&str>::new(2);
    /// bucket.insert(0, "first");
    ///
    /// let occupant = bucket.try_insert(0, "second").unwrap_err();
    /// assert_eq!(*occupant, "first");
    /// ```
    pub fn try_insert(&self, index: usize, item: impl Into<Arc<T>>) -> Result<(), Arc<T>> {
        let slot = self.slot(index);

        let vacant: Option<Arc<T>> = None;
        let previous = slot.compare_and_swap(&vacant, Some(item.into()));

        match &*previous {
            None => {
                self.increment_count();
                Ok(())
            }
            Some(occupant) => Err(Arc::clone(occupant)),
        }
    }

    /// Stores `item` in the slot at `index` regardless of what the slot holds.
    ///
    /// Returns the previous occupant, or `None` if the slot was empty.
    pub fn exchange(&self, index: usize, item: impl Into<Arc<T>>) -> Option<Arc<T>> {
        let previous = self.slot(index).swap(Some(item.into()));

        if previous.is_none() {
            self.increment_count();
        }

        previous
    }

    /// Stores `item` in the slot at `index` regardless of what the slot holds.
    ///
    /// Returns `true` if the slot was empty before, which callers use to maintain their own
    /// size counters.
    pub fn set(&self, index: usize, item: impl Into<Arc<T>>) -> bool {
        self.exchange(index, item).is_none()
    }

    /// Returns the value in the slot at `index`, if any.
    #[must_use]
    pub fn try_get(&self, index: usize) -> Option<Arc<T>> {
        self.slot(index).load_full()
    }

    /// Empties the slot at `index`.
    ///
    /// Returns `true` if the slot was occupied.
    pub fn remove_at(&self, index: usize) -> bool {
        self.take(index).is_some()
    }

    /// Empties the slot at `index`, returning the value that was removed.
    pub fn take(&self, index: usize) -> Option<Arc<T>> {
        let previous = self.slot(index).swap(None);

        if previous.is_some() {
            self.decrement_count();
        }

        previous
    }

    /// Empties the slot at `index` only if its occupant equals `expected` under `comparer`.
    ///
    /// Returns the removed value. The comparison is evaluated against the value that is actually
    /// removed - if another thread replaces the occupant between the comparison and the removal,
    /// the comparison is repeated against the new occupant.
    ///
    /// # Example
    ///
    /// ```rust
    /// use slot_sync::{Bucket, DefaultComparer};
    ///
    /// let bucket = Bucket::new(1);
    /// bucket.insert(0, 10);
    ///
    /// assert!(bucket.remove_value_at(0, &11, &DefaultComparer).is_none());
    /// assert_eq!(*bucket.remove_value_at(0, &10, &DefaultComparer).unwrap(), 10);
    /// assert!(bucket.is_empty());
    /// ```
    pub fn remove_value_at<C>(&self, index: usize, expected: &T, comparer: &C) -> Option<Arc<T>>
    where
        C: Comparer<T> + ?Sized,
    {
        self.compare_exchange_occupied(
            index,
            |current| comparer.equals(current, expected),
            |_| None,
        )
        .previous()
    }

    /// Replaces the occupant of the slot at `index` with `item` only if the occupant equals
    /// `comparison` under `comparer`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use slot_sync::{Bucket, DefaultComparer};
    ///
    /// let bucket = Bucket::<&str>::new(4);
    /// bucket.insert(0, "b");
    ///
    /// let outcome = bucket.update(0, "c", &"b", &DefaultComparer);
    /// assert_eq!(*outcome.previous().unwrap(), "b");
    /// assert_eq!(*bucket.try_get(0).unwrap(), "c");
    /// ```
    pub fn update<C>(
        &self,
        index: usize,
        item: impl Into<Arc<T>>,
        comparison: &T,
        comparer: &C,
    ) -> UpdateOutcome<T>
    where
        C: Comparer<T> + ?Sized,
    {
        let item = item.into();

        self.compare_exchange_occupied(
            index,
            |current| comparer.equals(current, comparison),
            |_| Some(Arc::clone(&item)),
        )
    }

    /// Replaces the occupant of the slot at `index` with `item` only if `predicate` accepts
    /// the occupant.
    ///
    /// The predicate may be called more than once: whenever another thread changes the slot
    /// between the evaluation and the swap, it is re-evaluated against the fresh occupant.
    /// On success, [`UpdateOutcome::Updated`] carries exactly the value the final evaluation
    /// accepted.
    pub fn update_if<P>(
        &self,
        index: usize,
        item: impl Into<Arc<T>>,
        predicate: P,
    ) -> UpdateOutcome<T>
    where
        P: FnMut(&T) -> bool,
    {
        let item = item.into();

        self.compare_exchange_occupied(index, predicate, |_| Some(Arc::clone(&item)))
    }

    /// Replaces the occupant of the slot at `index` with the value computed by `factory` from it.
    ///
    /// The factory may be called more than once under contention and only the result computed
    /// from the occupant that is actually replaced is stored, so it must not have side effects
    /// that matter if a result is thrown away.
    ///
    /// Returns [`UpdateOutcome::Empty`] if the slot was empty; otherwise the update always applies.
    ///
    /// # Example
    ///
    /// ```rust
    /// use slot_sync::Bucket;
    ///
    /// let bucket = Bucket::new(1);
    /// bucket.insert(0, 1);
    ///
    /// assert!(bucket.update_with(0, |value| value + 1).is_updated());
    /// assert_eq!(*bucket.try_get(0).unwrap(), 2);
    /// ```
    pub fn update_with<F>(&self, index: usize, mut factory: F) -> UpdateOutcome<T>
    where
        F: FnMut(&T) -> T,
    {
        self.compare_exchange_occupied(
            index,
            |_| true,
            |current| Some(Arc::new(factory(current))),
        )
    }

    /// Iterates over the values of all occupied slots in index order.
    ///
    /// The iterator does not take a snapshot: each slot is read at the moment it is visited.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            slots: self.slots.iter(),
        }
    }

    /// Iterates over the values of occupied slots that satisfy `predicate`.
    ///
    /// Like [`iter()`][Self::iter], each slot is read when it is visited. Call this again to
    /// restart the sequence.
    ///
    /// # Example
    ///
    /// ```rust
    /// use slot_sync::Bucket;
    ///
    /// let bucket = Bucket::new(4);
    /// bucket.insert(0, 1);
    /// bucket.insert(2, 2);
    /// bucket.insert(3, 3);
    ///
    /// let odd: Vec<_> = bucket.matching(|value| value % 2 == 1).map(|v| *v).collect();
    /// assert_eq!(odd, vec![1, 3]);
    /// ```
    pub fn matching<P>(&self, mut predicate: P) -> impl Iterator<Item = Arc<T>>
    where
        P: FnMut(&T) -> bool,
    {
        self.iter().filter(move |item| {
            let value: &T = item;
            predicate(value)
        })
    }

    /// Copies the values of all occupied slots into `target`, starting at position `offset`.
    ///
    /// The copy is assembled from per-slot reads and is not an atomic snapshot of the bucket.
    /// Returns the number of values written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetTooSmall`] if `target` cannot hold all the values after `offset`.
    /// Positions written before the shortfall was detected keep their new contents.
    pub fn copy_to(&self, target: &mut [Option<Arc<T>>], offset: usize) -> crate::Result<usize> {
        let available = target.len().saturating_sub(offset);

        let required = self.count();
        if required > available {
            return Err(Error::TargetTooSmall {
                required,
                available,
            });
        }

        let mut destination = target.iter_mut().skip(offset);
        let mut written: usize = 0;

        for value in self {
            let Some(position) = destination.next() else {
                // Someone filled more slots after we checked the count.
                return Err(Error::TargetTooSmall {
                    required: written.saturating_add(1),
                    available,
                });
            };

            *position = Some(value);
            written = written.saturating_add(1);
        }

        Ok(written)
    }

    /// The compare-and-swap engine behind every conditional operation.
    ///
    /// Loads the occupant, evaluates `check` against it, computes the replacement from it and
    /// swaps only if the slot still holds that same occupant. A lost race restarts the whole
    /// sequence against the freshly loaded occupant, so `check` and `replacement` never act on
    /// a stale value. A `None` replacement empties the slot.
    #[cfg_attr(test, mutants::skip)] // Mutating the retry condition turns contention into hangs.
    fn compare_exchange_occupied<P, R>(
        &self,
        index: usize,
        mut check: P,
        mut replacement: R,
    ) -> UpdateOutcome<T>
    where
        P: FnMut(&T) -> bool,
        R: FnMut(&T) -> Option<Arc<T>>,
    {
        let slot = self.slot(index);
        let backoff = Backoff::new();

        loop {
            let current = slot.load();

            let Some(occupant) = &*current else {
                return UpdateOutcome::Empty;
            };

            let occupant_value: &T = occupant;

            if !check(occupant_value) {
                return UpdateOutcome::Rejected {
                    current: Arc::clone(occupant),
                };
            }

            let new_value = replacement(occupant_value);
            let empties_slot = new_value.is_none();

            let previous = slot.compare_and_swap(&current, new_value);

            if is_same_occupant(&previous, &current) {
                if empties_slot {
                    self.decrement_count();
                }

                return UpdateOutcome::Updated {
                    previous: Arc::clone(occupant),
                };
            }

            // Someone else changed the slot in between. Start over with whatever is there now.
            backoff.spin();
        }
    }

    fn slot(&self, index: usize) -> &ArcSwapOption<T> {
        self.slots.get(index).unwrap_or_else(|| {
            panic!(
                "slot index {index} is out of bounds for a bucket with capacity {}",
                self.slots.len()
            )
        })
    }

    fn increment_count(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn decrement_count(&self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Whether two slot readings refer to the same occupant (or are both empty).
///
/// Pointer identity is sufficient: the guard of the earlier reading keeps its occupant alive, so
/// the allocation cannot have been recycled for a different value in the meantime.
fn is_same_occupant<T>(left: &Option<Arc<T>>, right: &Option<Arc<T>>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(left), Some(right)) => Arc::ptr_eq(left, right),
        _ => false,
    }
}

impl<T> fmt::Debug for Bucket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("capacity", &self.capacity())
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

impl<'a, T> IntoIterator for &'a Bucket<T> {
    type Item = Arc<T>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the values of the occupied slots of a [`Bucket`].
///
/// Created by [`Bucket::iter()`].
pub struct Iter<'a, T> {
    slots: slice::Iter<'a, ArcSwapOption<T>>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = Arc<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.slots.by_ref().find_map(|slot| slot.load_full())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.slots.len()))
    }
}

impl<T> FusedIterator for Iter<'_, T> {}

impl<T> fmt::Debug for Iter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("remaining_slots", &self.slots.len())
            .finish()
    }
}
