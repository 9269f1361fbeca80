//! Reusable single-assignment completion signals.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use rsevents::{Awaitable, EventState, ManualResetEvent};
use tracing::warn;

const PENDING: u8 = 0;

// A producer is storing the fault and will publish a terminal state right after.
const RESOLVING: u8 = 1;

const COMPLETED: u8 = 2;
const FAULTED: u8 = 3;

/// Snapshot of the state of a [`Promise`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PromiseState {
    /// Not resolved yet. Waiting blocks.
    Pending,

    /// Resolved without a fault.
    Completed,

    /// Resolved with a fault.
    Faulted,
}

struct Shared<E> {
    state: AtomicU8,

    // Only written while the state is RESOLVING (or during release), so readers that observed a
    // terminal state with Acquire see the final value.
    error: Mutex<Option<E>>,

    resolved: ManualResetEvent,
}

impl<E> Shared<E> {
    fn new(state: u8, error: Option<E>) -> Self {
        let event_state = if state == PENDING {
            EventState::Unset
        } else {
            EventState::Set
        };

        Self {
            state: AtomicU8::new(state),
            error: Mutex::new(error),
            resolved: ManualResetEvent::new(event_state),
        }
    }

    fn state(&self) -> PromiseState {
        match self.state.load(Ordering::Acquire) {
            COMPLETED => PromiseState::Completed,
            FAULTED => PromiseState::Faulted,
            _ => PromiseState::Pending,
        }
    }

    fn resolve(&self, terminal: u8, error: Option<E>) -> bool {
        if self
            .state
            .compare_exchange(PENDING, RESOLVING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        *self.error.lock() = error;

        self.state.store(terminal, Ordering::Release);
        self.resolved.set();

        true
    }

    #[cfg_attr(test, mutants::skip)] // Mutating the retry loop turns into hangs.
    fn release(&self) -> bool {
        let backoff = Backoff::new();

        loop {
            let current = self.state.load(Ordering::Acquire);

            match current {
                PENDING => return false,
                // Another call through the handle is mid-transition.
                RESOLVING => backoff.snooze(),
                _ => {
                    if self
                        .state
                        .compare_exchange(current, RESOLVING, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        break;
                    }

                    backoff.spin();
                }
            }
        }

        *self.error.lock() = None;
        self.resolved.reset();
        self.state.store(PENDING, Ordering::Release);

        true
    }
}

/// The consumer side of a single-assignment completion signal.
///
/// A promise starts out pending and is resolved exactly once by its [`Promised`] handle, either
/// as completed or as faulted with an error of type `E`. Consumers can poll its state or block
/// until it is resolved. The fault is data: resolving a promise as faulted does not panic on
/// either side, the consumer retrieves the error via [`error()`][Self::error] and decides
/// what to do with it.
///
/// Cloning a promise creates another view of the same state.
///
/// # Reuse
///
/// The producer may [`release()`][Promised::release] a resolved promise back to pending. The
/// caller must ensure no thread is blocked in [`wait()`][Self::wait] at that point; a waiter that
/// races with a release may or may not return.
///
/// # Cancellation
///
/// Cancellation is not modeled. [`is_canceled()`][Self::is_canceled] always returns `false`.
///
/// # Example
///
/// ```rust
/// use std::thread;
///
/// use slot_sync::Promise;
///
/// let (promise, promised) = Promise::<String>::pending();
///
/// let producer = thread::spawn(move || {
///     promised.on_completed();
/// });
///
/// promise.wait();
/// assert!(promise.is_completed());
/// assert_eq!(promise.error(), None);
///
/// producer.join().unwrap();
/// ```
pub struct Promise<E> {
    shared: Arc<Shared<E>>,
}

/// The producer side of a [`Promise`], allowed to resolve and release it.
///
/// There is exactly one handle per promise. Dropping a handle while its promise is still pending
/// leaves any waiters blocked forever, which is logged as a warning.
pub struct Promised<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Promise<E> {
    /// Creates a pending promise together with the handle that resolves it.
    #[must_use]
    pub fn pending() -> (Self, Promised<E>) {
        Self::with_handle(PENDING, None)
    }

    /// Creates a promise that is already completed.
    ///
    /// # Example
    ///
    /// ```rust
    /// use slot_sync::{Promise, PromiseState};
    ///
    /// let promise = Promise::<String>::completed();
    ///
    /// promise.wait();
    /// assert_eq!(promise.state(), PromiseState::Completed);
    /// ```
    #[must_use]
    pub fn completed() -> Self {
        Self {
            shared: Arc::new(Shared::new(COMPLETED, None)),
        }
    }

    /// Creates a promise that is already faulted with `error`.
    #[must_use]
    pub fn faulted(error: E) -> Self {
        Self {
            shared: Arc::new(Shared::new(FAULTED, Some(error))),
        }
    }

    /// Creates a completed promise together with a handle that can later release it for reuse.
    #[must_use]
    pub fn completed_with_handle() -> (Self, Promised<E>) {
        Self::with_handle(COMPLETED, None)
    }

    /// Creates a faulted promise together with a handle that can later release it for reuse.
    #[must_use]
    pub fn faulted_with_handle(error: E) -> (Self, Promised<E>) {
        Self::with_handle(FAULTED, Some(error))
    }

    fn with_handle(state: u8, error: Option<E>) -> (Self, Promised<E>) {
        let shared = Arc::new(Shared::new(state, error));

        (
            Self {
                shared: Arc::clone(&shared),
            },
            Promised { shared },
        )
    }

    /// The current state of the promise.
    ///
    /// The state may change as soon as this returns.
    #[must_use]
    pub fn state(&self) -> PromiseState {
        self.shared.state()
    }

    /// Whether the promise has been resolved, either as completed or as faulted.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state() != PromiseState::Pending
    }

    /// Whether the promise has been resolved as faulted.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.state() == PromiseState::Faulted
    }

    /// Always `false`: promises cannot be canceled.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Constant by contract.
    #[expect(
        clippy::unused_self,
        reason = "kept as a method so callers can query it like the other states"
    )]
    pub fn is_canceled(&self) -> bool {
        false
    }

    /// Blocks the current thread until the promise is resolved.
    ///
    /// Returns immediately if it is already resolved.
    pub fn wait(&self) {
        self.shared.resolved.wait();
    }

    /// Blocks the current thread until the promise is resolved or `timeout` elapses.
    ///
    /// Returns whether the promise was resolved in time.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.shared.resolved.wait_for(timeout)
    }
}

impl<E: Clone> Promise<E> {
    /// Blocks until the promise is resolved and returns its fault, if any.
    ///
    /// Returns `None` if the promise completed without a fault.
    ///
    /// # Example
    ///
    /// ```rust
    /// use slot_sync::Promise;
    ///
    /// let promise = Promise::faulted("disk full");
    ///
    /// assert!(promise.is_faulted());
    /// assert_eq!(promise.error(), Some("disk full"));
    /// ```
    #[must_use]
    pub fn error(&self) -> Option<E> {
        self.wait();
        self.shared.error.lock().clone()
    }
}

impl<E> Clone for Promise<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: fmt::Display> fmt::Display for Promise<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state() {
            PromiseState::Pending => write!(f, "[Pending]"),
            PromiseState::Completed => write!(f, "[Done]"),
            PromiseState::Faulted => match &*self.shared.error.lock() {
                Some(error) => write!(f, "{error}"),
                // Released between the state read and the lock.
                None => write!(f, "[Pending]"),
            },
        }
    }
}

impl<E> fmt::Debug for Promise<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<E> Promised<E> {
    /// Resolves the promise as completed and wakes all waiters.
    ///
    /// Returns `false` without changing anything if the promise is not pending.
    pub fn on_completed(&self) -> bool {
        self.shared.resolve(COMPLETED, None)
    }

    /// Resolves the promise as faulted with `error` and wakes all waiters.
    ///
    /// Returns `false` without changing anything if the promise is not pending. The error is
    /// dropped in that case.
    pub fn on_error(&self, error: E) -> bool {
        self.shared.resolve(FAULTED, Some(error))
    }

    /// Returns a resolved promise to pending, dropping any stored fault.
    ///
    /// Returns `false` if the promise was already pending.
    pub fn release(&self) -> bool {
        self.shared.release()
    }

    /// The current state of the promise this handle resolves.
    #[must_use]
    pub fn state(&self) -> PromiseState {
        self.shared.state()
    }
}

impl<E> Drop for Promised<E> {
    fn drop(&mut self) {
        if self.shared.state() == PromiseState::Pending && Arc::strong_count(&self.shared) > 1 {
            warn!("promise handle dropped without resolving; waiters will never be woken");
        }
    }
}

impl<E> fmt::Debug for Promised<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use testing::with_watchdog;

    use super::*;

    assert_impl_all!(Promise<String>: Send, Sync, Clone);
    assert_impl_all!(Promised<String>: Send, Sync);
    assert_not_impl_any!(Promised<String>: Clone);

    #[test]
    fn pending_until_completed() {
        let (promise, promised) = Promise::<String>::pending();

        assert_eq!(promise.state(), PromiseState::Pending);
        assert!(!promise.is_completed());
        assert!(!promise.wait_timeout(Duration::from_millis(1)));

        assert!(promised.on_completed());

        assert!(promise.is_completed());
        assert!(!promise.is_faulted());
        assert!(promise.wait_timeout(Duration::ZERO));
        assert_eq!(promise.error(), None);
    }

    #[test]
    fn faulted_promise_returns_error_without_blocking() {
        let promise = Promise::faulted("broken".to_string());

        assert!(promise.is_completed());
        assert!(promise.is_faulted());
        promise.wait();
        assert_eq!(promise.error().as_deref(), Some("broken"));
    }

    #[test]
    fn completed_promise_does_not_block() {
        let promise = Promise::<String>::completed();

        promise.wait();
        assert_eq!(promise.state(), PromiseState::Completed);
    }

    #[test]
    fn second_resolution_is_refused() {
        let (promise, promised) = Promise::pending();

        assert!(promised.on_error(1));
        assert!(!promised.on_completed());
        assert!(!promised.on_error(2));

        assert_eq!(promise.error(), Some(1));
    }

    #[test]
    fn release_returns_to_pending_and_clears_error() {
        let (promise, promised) = Promise::faulted_with_handle(7);

        assert!(promise.is_faulted());
        assert!(promised.release());

        assert_eq!(promise.state(), PromiseState::Pending);
        assert!(!promise.wait_timeout(Duration::from_millis(1)));
        assert!(!promised.release());

        assert!(promised.on_completed());
        assert_eq!(promise.error(), None);
    }

    #[test]
    fn completed_with_handle_can_be_reused() {
        let (promise, promised) = Promise::<u8>::completed_with_handle();

        assert!(promise.is_completed());
        assert!(promised.release());
        assert!(!promise.is_completed());
        assert!(promised.on_error(3));
        assert_eq!(promise.error(), Some(3));
    }

    #[test]
    fn clones_share_state() {
        let (promise, promised) = Promise::<u8>::pending();
        let clone = promise.clone();

        promised.on_completed();

        assert!(clone.is_completed());
    }

    #[test]
    fn is_never_canceled() {
        let (promise, promised) = Promise::<u8>::pending();
        assert!(!promise.is_canceled());

        promised.on_error(1);
        assert!(!promise.is_canceled());
    }

    #[test]
    fn display_reflects_state() {
        let (promise, promised) = Promise::<String>::pending();
        assert_eq!(promise.to_string(), "[Pending]");

        promised.on_error("it broke".to_string());
        assert_eq!(promise.to_string(), "it broke");

        promised.release();
        promised.on_completed();
        assert_eq!(promise.to_string(), "[Done]");
    }

    #[test]
    fn debug_shows_state() {
        let (promise, promised) = Promise::<u8>::pending();

        assert!(format!("{promise:?}").contains("Pending"));
        assert!(format!("{promised:?}").contains("Pending"));
    }

    #[test]
    fn dropping_pending_handle_leaves_promise_pending() {
        let (promise, promised) = Promise::<u8>::pending();

        drop(promised);

        assert_eq!(promise.state(), PromiseState::Pending);
    }

    #[cfg_attr(miri, ignore)] // Miri cannot reliably wait on OS timers.
    #[test]
    fn completion_from_other_thread_wakes_waiter() {
        with_watchdog(|| {
            let (promise, promised) = Promise::<String>::pending();

            let producer = thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                assert!(promised.on_completed());
            });

            promise.wait();

            assert!(promise.is_completed());
            assert_eq!(promise.error(), None);

            producer.join().unwrap();
        });
    }

    #[cfg_attr(miri, ignore)] // Too many threads for Miri to finish in reasonable time.
    #[test]
    fn all_waiters_wake_and_see_error() {
        const WAITERS: usize = 4;

        with_watchdog(|| {
            let (promise, promised) = Promise::pending();
            let barrier = Arc::new(Barrier::new(WAITERS + 1));

            let waiters = (0..WAITERS)
                .map(|_| {
                    let promise = promise.clone();
                    let barrier = Arc::clone(&barrier);

                    thread::spawn(move || {
                        barrier.wait();
                        promise.error()
                    })
                })
                .collect::<Vec<_>>();

            barrier.wait();
            assert!(promised.on_error(42_u32));

            for waiter in waiters {
                assert_eq!(waiter.join().unwrap(), Some(42));
            }
        });
    }

    #[cfg_attr(miri, ignore)] // Too many threads for Miri to finish in reasonable time.
    #[test]
    fn concurrent_resolutions_apply_once() {
        with_watchdog(|| {
            let (promise, promised) = Promise::pending();
            let promised = Arc::new(promised);
            let barrier = Arc::new(Barrier::new(4));

            let resolvers = (0..4_u32)
                .map(|value| {
                    let promised = Arc::clone(&promised);
                    let barrier = Arc::clone(&barrier);

                    thread::spawn(move || {
                        barrier.wait();
                        promised.on_error(value)
                    })
                })
                .collect::<Vec<_>>();

            let applied = resolvers
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|applied| *applied)
                .count();

            assert_eq!(applied, 1);
            assert!(promise.error().is_some());
        });
    }
}
