//! Bounded pooling of reusable objects.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;

use thiserror::Error;
use tracing::{debug, trace};

use crate::FixedSizeQueue;
use crate::reentry::{self, UniqueId};

type Recycler<T> = dyn Fn(&mut T) -> Result<(), RecycleError> + Send + Sync;

/// Why a recycler refused to reset an entry for reuse.
///
/// These are the expected ways for recycling to fail while the owners of pooled entries are
/// being torn down. The pool discards an entry whose recycler returns one of them. Anything
/// else going wrong in a recycler is a bug and should panic; such panics reach the donor.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum RecycleError {
    /// The entry (or something it depends on) has already been disposed of.
    #[error("the entry has already been disposed of")]
    Disposed,

    /// The entry is in a state that does not allow it to be reset.
    #[error("the entry is in a state that does not allow it to be reset")]
    InvalidOperation,

    /// Something the entry needs in order to be reset is no longer there.
    #[error("state needed to reset the entry is missing")]
    MissingState,
}

/// A bounded cache of reusable objects.
///
/// Callers [`donate()`][Self::donate] objects they no longer need and later
/// [`try_get()`][Self::try_get] them back instead of creating new ones. An optional recycler
/// resets each donated object before it is stored.
///
/// The pool never blocks and never holds more than its capacity: an object that does not fit, or
/// that the recycler refuses, is dropped. An object is either in the pool or owned by a caller,
/// never both.
///
/// # Reentrancy
///
/// If a recycler (or something it calls, such as the drop of a discarded object) donates to the
/// same pool on the same thread, that nested donation is dropped instead of being processed.
/// This stops teardown chains from recursing without bound.
///
/// # Example
///
/// ```rust
/// use slot_sync::Pool;
///
/// let pool = Pool::builder(2)
///     .recycler(|buffer: &mut Vec<u8>| {
///         buffer.clear();
///         Ok(())
///     })
///     .build();
///
/// pool.donate(vec![1, 2, 3]);
///
/// let buffer = pool.try_get().unwrap();
/// assert!(buffer.is_empty());
/// assert!(buffer.capacity() >= 3);
/// ```
pub struct Pool<T> {
    entries: FixedSizeQueue<T>,

    recycler: Option<Box<Recycler<T>>>,

    // Keys the reentry guard, so nested donations to other pools are not affected.
    id: UniqueId,
}

impl<T> Pool<T> {
    /// Creates a pool that holds up to `capacity` objects and stores them as donated.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::builder(capacity).build()
    }

    /// Starts building a pool that holds up to `capacity` objects.
    ///
    /// # Example
    ///
    /// ```rust
    /// use slot_sync::Pool;
    ///
    /// let pool = Pool::<String>::builder(16)
    ///     .recycler(|s| {
    ///         s.clear();
    ///         Ok(())
    ///     })
    ///     .build();
    ///
    /// assert_eq!(pool.capacity(), 16);
    /// ```
    #[must_use]
    pub fn builder(capacity: usize) -> PoolBuilder<T> {
        PoolBuilder::new(capacity)
    }

    /// The maximum number of objects the pool holds.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// The number of objects currently in the pool.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.count()
    }

    /// Returns an object to the pool for later reuse.
    ///
    /// The recycler (if any) runs first. The object is dropped instead of stored if:
    ///
    /// * the pool is full;
    /// * the recycler returns a [`RecycleError`];
    /// * this is a nested donation to the same pool on the current thread.
    ///
    /// # Panics
    ///
    /// Panics raised by the recycler propagate to the caller. The object is dropped during
    /// unwinding and the pool remains usable.
    ///
    /// # Progress
    ///
    /// This does not take locks, but it may briefly spin while another thread is still in the
    /// middle of an operation on the same slot of the backing [`FixedSizeQueue`]. A peer that is
    /// preempted at that moment can therefore delay the call.
    pub fn donate(&self, entry: T) {
        let Some(_entered) = reentry::enter(self.id) else {
            trace!(pool = %self.id, "dropping entry from nested donation");
            return;
        };

        // Rebound so the entry drops before `_entered` on every path, including unwinding.
        let mut entry = entry;

        if let Some(recycler) = &self.recycler {
            if let Err(reason) = recycler(&mut entry) {
                debug!(pool = %self.id, %reason, "recycler refused entry, dropping it");
                drop(entry);
                return;
            }
        }

        if let Err(entry) = self.entries.try_add(entry) {
            trace!(pool = %self.id, "pool is full, dropping donated entry");
            drop(entry);
        }
    }

    /// Takes an object out of the pool, if there is one.
    ///
    /// Like [`donate()`][Self::donate], this may briefly spin while another thread is mid-way
    /// through an operation on the same slot of the backing queue.
    #[must_use]
    pub fn try_get(&self) -> Option<T> {
        self.entries.try_take()
    }

    /// Takes an object out of the pool or creates a new one if the pool is empty.
    ///
    /// # Example
    ///
    /// ```rust
    /// use slot_sync::Pool;
    ///
    /// let pool = Pool::new(4);
    ///
    /// let fresh = pool.get_or_else(|| "fresh".to_string());
    /// assert_eq!(fresh, "fresh");
    ///
    /// pool.donate("reused".to_string());
    /// assert_eq!(pool.get_or_else(String::new), "reused");
    /// ```
    pub fn get_or_else<F>(&self, create: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.try_get().unwrap_or_else(create)
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("entries", &self.entries)
            .field("has_recycler", &self.recycler.is_some())
            .field("id", &self.id)
            .finish()
    }
}

/// Builder for configuring a [`Pool`].
#[derive(derive_more::Debug)]
pub struct PoolBuilder<T> {
    capacity: usize,

    #[debug(ignore)]
    recycler: Option<Box<Recycler<T>>>,

    _entry: PhantomData<fn(T)>,
}

impl<T> PoolBuilder<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            recycler: None,
            _entry: PhantomData,
        }
    }

    /// Sets the function that resets a donated object before it is stored.
    ///
    /// Return a [`RecycleError`] to have the object dropped instead of stored.
    #[must_use]
    pub fn recycler<F>(mut self, recycler: F) -> Self
    where
        F: Fn(&mut T) -> Result<(), RecycleError> + Send + Sync + 'static,
    {
        self.recycler = Some(Box::new(recycler));
        self
    }

    /// Builds the pool.
    ///
    /// # Panics
    ///
    /// Panics if the capacity is zero.
    #[must_use]
    pub fn build(self) -> Pool<T> {
        Pool {
            entries: FixedSizeQueue::new(self.capacity),
            recycler: self.recycler,
            id: UniqueId::next(),
        }
    }
}
