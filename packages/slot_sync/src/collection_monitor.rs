//! Broadcasts "a collection cycle happened" to weakly held subscribers.

mod global;

pub use global::*;

use std::any::{Any, type_name};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rsevents::{AutoResetEvent, Awaitable, EventState};
use tracing::{debug, error, trace};

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_THREAD_NAME: &str = "slot_sync-collection-monitor";

/// Identifies one subscription to a [`CollectionMonitor`].
///
/// Returned by the subscribe methods and accepted by
/// [`unsubscribe()`][CollectionMonitor::unsubscribe].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    #[cfg_attr(test, mutants::skip)] // No API contract for the display format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription #{}", self.0)
    }
}

trait Subscriber: Send + Sync {
    /// Whether the subscription still has someone to notify.
    fn is_alive(&self) -> bool;

    fn notify(&self);
}

/// Lives as long as its owner. Holding only a weak reference keeps the owner collectable.
struct OwnedSubscriber<O, F> {
    owner: Weak<O>,
    handler: F,
}

impl<O, F> Subscriber for OwnedSubscriber<O, F>
where
    O: Send + Sync,
    F: Fn(&O) + Send + Sync,
{
    fn is_alive(&self) -> bool {
        self.owner.strong_count() > 0
    }

    fn notify(&self) {
        if let Some(owner) = self.owner.upgrade() {
            (self.handler)(&owner);
        }
    }
}

/// Lives until explicitly unsubscribed.
struct FnSubscriber<F>(F);

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn() + Send + Sync,
{
    #[cfg_attr(test, mutants::skip)] // Constant by contract.
    fn is_alive(&self) -> bool {
        true
    }

    fn notify(&self) {
        (self.0)();
    }
}

struct Inner {
    subscribers: scc::HashMap<SubscriptionId, Arc<dyn Subscriber>>,

    // Auto-reset, so each signal is consumed by exactly one cycle of the runner.
    wake: AutoResetEvent,

    finished: AtomicBool,
    cycles: AtomicU64,

    // `None` means the runner only wakes up on explicit notification.
    probe_interval: Option<Duration>,
}

impl Inner {
    fn run(&self) {
        loop {
            let signaled = match self.probe_interval {
                Some(interval) => self.wake.wait_for(interval),
                None => {
                    self.wake.wait();
                    true
                }
            };

            // Acquire pairs with the Release in `shutdown()`.
            if self.finished.load(Ordering::Acquire) {
                break;
            }

            trace!(signaled, "collection monitor woke up");

            self.broadcast();
        }
    }

    fn broadcast(&self) {
        let mut purged: usize = 0;

        self.subscribers.retain(|_, subscriber| {
            let alive = subscriber.is_alive();

            if !alive {
                purged = purged.wrapping_add(1);
            }

            alive
        });

        // Snapshot first, so handlers may (un)subscribe without contending with our scan.
        let mut live = Vec::with_capacity(self.subscribers.len());
        self.subscribers
            .scan(|_, subscriber| live.push(Arc::clone(subscriber)));

        for subscriber in &live {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| subscriber.notify())) {
                let message = format_panic_payload(&payload);
                error!(
                    panic_message = %message,
                    "collection monitor subscriber panicked; continuing with the other subscribers"
                );
            }
        }

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        trace!(cycle, purged, invoked = live.len(), "collection cycle broadcast");
    }
}

/// Notifies subscribers each time a collection cycle is observed.
///
/// A dedicated background thread (the runner) waits for a cycle signal and then invokes every live
/// subscriber. A cycle is signaled either explicitly via
/// [`notify_collected()`][Self::notify_collected] (e.g. by a host that observed memory pressure)
/// or by the periodic probe, which treats every elapsed probe interval as a cycle. The runner is
/// started by the first subscription.
///
/// Subscriptions made with [`subscribe()`][Self::subscribe] hold their owner weakly: once the
/// owner is dropped, the subscription is purged at the next cycle without an explicit
/// [`unsubscribe()`][Self::unsubscribe]. A subscriber that panics is logged and skipped; the
/// others are still invoked and the runner keeps going.
///
/// Dropping the monitor shuts it down and waits for the runner to exit.
///
/// A process-wide instance is available through the free functions of this crate, such as
/// [`subscribe()`][crate::subscribe].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use slot_sync::CollectionMonitor;
///
/// let monitor = CollectionMonitor::builder().probe_interval(None).build();
///
/// let cache = Arc::new(AtomicUsize::new(0));
/// monitor.subscribe(&cache, |cache| {
///     cache.fetch_add(1, Ordering::Relaxed);
/// });
///
/// monitor.notify_collected();
///
/// // The subscriber runs on the runner thread. Shutting down waits for it to finish.
/// # while monitor.cycles() == 0 { std::thread::yield_now(); }
/// monitor.shutdown();
/// assert!(monitor.is_finished());
/// ```
pub struct CollectionMonitor {
    inner: Arc<Inner>,

    thread_name: String,

    runner_started: AtomicBool,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl CollectionMonitor {
    /// Creates a monitor that probes for collection cycles once per second.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a monitor with custom settings.
    #[must_use]
    pub fn builder() -> CollectionMonitorBuilder {
        CollectionMonitorBuilder::new()
    }

    /// Subscribes `handler`, to be invoked with `owner` on every cycle for as long as `owner`
    /// is alive.
    ///
    /// The monitor only holds a weak reference to `owner`.
    pub fn subscribe<O, F>(&self, owner: &Arc<O>, handler: F) -> SubscriptionId
    where
        O: Send + Sync + 'static,
        F: Fn(&O) + Send + Sync + 'static,
    {
        self.register(Arc::new(OwnedSubscriber {
            owner: Arc::downgrade(owner),
            handler,
        }))
    }

    /// Subscribes `handler`, to be invoked on every cycle until unsubscribed.
    pub fn subscribe_fn<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(Arc::new(FnSubscriber(handler)))
    }

    fn register(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        let id = SubscriptionId::next();

        // Ids are unique, so there is never an existing entry.
        drop(self.inner.subscribers.insert(id, subscriber));

        self.ensure_runner_started();

        id
    }

    /// Removes a subscription.
    ///
    /// Returns `false` if it was not registered (anymore), for example because its owner was
    /// dropped and the subscription already purged.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.remove(&id).is_some()
    }

    /// Signals that a collection cycle happened, waking the runner.
    ///
    /// Signals that arrive while the runner is busy are coalesced into one more cycle.
    pub fn notify_collected(&self) {
        self.inner.wake.set();
    }

    /// Stops the monitor permanently.
    ///
    /// The runner finishes its current cycle (if any) and exits; this waits for that unless
    /// called from the runner itself (e.g. by a subscriber). Subscriptions made afterwards are
    /// accepted but never invoked. Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        // Release pairs with the Acquire in the runner loop.
        if self.inner.finished.swap(true, Ordering::Release) {
            return;
        }

        debug!(thread_name = %self.thread_name, "collection monitor shutting down");

        self.inner.wake.set();

        let Some(runner) = self.runner.lock().take() else {
            return;
        };

        if runner.thread().id() == thread::current().id() {
            // The runner exits on its own once the current cycle completes.
            return;
        }

        if let Err(payload) = runner.join() {
            // Subscriber panics are trapped, so the runner itself should never panic.
            panic::resume_unwind(payload);
        }
    }

    /// Whether [`shutdown()`][Self::shutdown] has been called.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// The number of cycles broadcast so far.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.inner.cycles.load(Ordering::Relaxed)
    }

    /// The number of registered subscriptions, including dead ones not yet purged.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    fn ensure_runner_started(&self) {
        if self.is_finished() {
            return;
        }

        // AcqRel on success so a concurrent shutdown that takes the handle sees it stored.
        if self
            .runner_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let thread_name = self.thread_name.clone();

        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                debug!(thread_name = %thread_name, "collection monitor runner started");
                inner.run();
                debug!(thread_name = %thread_name, "collection monitor runner exiting");
            })
            .expect(
                "failed to spawn collection monitor thread: thread spawning failure is not supported",
            );

        *self.runner.lock() = Some(handle);
    }
}

impl Default for CollectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CollectionMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for CollectionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("thread_name", &self.thread_name)
            .field("probe_interval", &self.inner.probe_interval)
            .field("subscribers", &self.subscriber_count())
            .field("cycles", &self.cycles())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`CollectionMonitor`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use slot_sync::CollectionMonitor;
///
/// let monitor = CollectionMonitor::builder()
///     .probe_interval(Some(Duration::from_millis(250)))
///     .thread_name("cache-trimmer")
///     .build();
///
/// assert_eq!(monitor.cycles(), 0);
/// ```
#[derive(Debug)]
pub struct CollectionMonitorBuilder {
    probe_interval: Option<Duration>,
    thread_name: String,
}

impl CollectionMonitorBuilder {
    fn new() -> Self {
        Self {
            probe_interval: Some(DEFAULT_PROBE_INTERVAL),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }

    /// Sets how often the probe reports a cycle on its own.
    ///
    /// `None` disables the probe, so cycles only happen on
    /// [`notify_collected()`][CollectionMonitor::notify_collected]. Defaults to one second.
    #[must_use]
    pub fn probe_interval(mut self, interval: Option<Duration>) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Sets the name of the runner thread.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Builds the monitor. The runner thread starts with the first subscription.
    #[must_use]
    pub fn build(self) -> CollectionMonitor {
        CollectionMonitor {
            inner: Arc::new(Inner {
                subscribers: scc::HashMap::new(),
                wake: AutoResetEvent::new(EventState::Unset),
                finished: AtomicBool::new(false),
                cycles: AtomicU64::new(0),
                probe_interval: self.probe_interval,
            }),
            thread_name: self.thread_name,
            runner_started: AtomicBool::new(false),
            runner: Mutex::new(None),
        }
    }
}

/// Formats a panic payload for logging.
fn format_panic_payload(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicUsize;

    use static_assertions::assert_impl_all;
    use testing::{wait_until, with_watchdog};

    use super::*;

    const PATIENCE: Duration = Duration::from_secs(5);

    assert_impl_all!(CollectionMonitor: Send, Sync);
    assert_impl_all!(CollectionMonitorBuilder: Send, Sync);
    assert_impl_all!(SubscriptionId: Send, Sync, Copy);

    fn manual_monitor() -> CollectionMonitor {
        CollectionMonitor::builder().probe_interval(None).build()
    }

    fn counter_subscriber(monitor: &CollectionMonitor) -> (Arc<AtomicUsize>, SubscriptionId) {
        let counter = Arc::new(AtomicUsize::new(0));
        let id = monitor.subscribe(&counter, |counter| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        (counter, id)
    }

    #[test]
    fn runner_not_started_without_subscribers() {
        let monitor = manual_monitor();

        monitor.notify_collected();

        assert!(monitor.runner.lock().is_none());
        assert_eq!(monitor.cycles(), 0);
    }

    #[cfg_attr(miri, ignore)] // Miri cannot reliably wait on OS timers.
    #[test]
    fn notify_invokes_live_subscribers() {
        with_watchdog(|| {
            let monitor = manual_monitor();
            let (counter, _id) = counter_subscriber(&monitor);

            monitor.notify_collected();

            assert!(wait_until(PATIENCE, || counter.load(Ordering::Relaxed) >= 1));
            assert!(wait_until(PATIENCE, || monitor.cycles() >= 1));
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot reliably wait on OS timers.
    #[test]
    fn dropped_owner_is_purged_without_unsubscribe() {
        with_watchdog(|| {
            let monitor = manual_monitor();
            let invoked = Arc::new(AtomicUsize::new(0));

            let owner = Arc::new(());
            let handler_invoked = Arc::clone(&invoked);
            let id = monitor.subscribe(&owner, move |_| {
                handler_invoked.fetch_add(1, Ordering::Relaxed);
            });
            assert_eq!(monitor.subscriber_count(), 1);

            drop(owner);
            monitor.notify_collected();

            assert!(wait_until(PATIENCE, || monitor.cycles() >= 1));
            assert_eq!(monitor.subscriber_count(), 0);
            assert_eq!(invoked.load(Ordering::Relaxed), 0);
            assert!(!monitor.unsubscribe(id));
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot reliably wait on OS timers.
    #[test]
    fn unsubscribed_handler_is_not_invoked() {
        with_watchdog(|| {
            let monitor = manual_monitor();
            let (removed, removed_id) = counter_subscriber(&monitor);
            let (kept, _kept_id) = counter_subscriber(&monitor);

            assert!(monitor.unsubscribe(removed_id));
            assert!(!monitor.unsubscribe(removed_id));

            monitor.notify_collected();

            assert!(wait_until(PATIENCE, || kept.load(Ordering::Relaxed) >= 1));
            assert_eq!(removed.load(Ordering::Relaxed), 0);
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot reliably wait on OS timers.
    #[test]
    fn handler_removed_during_broadcast_is_not_invoked_later() {
        struct Remover {
            monitor: Arc<CollectionMonitor>,
            target: OnceLock<SubscriptionId>,
            removed: AtomicBool,
        }

        with_watchdog(|| {
            let monitor = Arc::new(manual_monitor());
            let remover = Arc::new(Remover {
                monitor: Arc::clone(&monitor),
                target: OnceLock::new(),
                removed: AtomicBool::new(false),
            });

            let _remover_id = monitor.subscribe(&remover, |remover| {
                if let Some(target) = remover.target.get() {
                    if remover.monitor.unsubscribe(*target) {
                        remover.removed.store(true, Ordering::Relaxed);
                    }
                }
            });

            let (target, target_id) = counter_subscriber(&monitor);
            remover
                .target
                .set(target_id)
                .expect("target is only set once");

            // The target may run in the cycle that removes it, depending on broadcast order.
            for cycle in 1..=4 {
                monitor.notify_collected();
                assert!(wait_until(PATIENCE, || monitor.cycles() >= cycle));
            }

            assert!(remover.removed.load(Ordering::Relaxed));
            assert!(target.load(Ordering::Relaxed) <= 1);
            assert_eq!(monitor.subscriber_count(), 1);

            // The remover keeps the monitor alive, so it has to go first.
            drop(remover);
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot reliably wait on OS timers.
    #[test]
    fn panicking_subscriber_does_not_stop_others() {
        with_watchdog(|| {
            let monitor = manual_monitor();

            let _panicking = monitor.subscribe_fn(|| panic!("subscriber failure"));
            let (counter, _id) = counter_subscriber(&monitor);

            monitor.notify_collected();
            assert!(wait_until(PATIENCE, || monitor.cycles() >= 1));

            monitor.notify_collected();
            assert!(wait_until(PATIENCE, || monitor.cycles() >= 2));

            assert_eq!(counter.load(Ordering::Relaxed), 2);
            assert!(!monitor.is_finished());
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot reliably wait on OS timers.
    #[test]
    fn probe_reports_cycles_without_notification() {
        with_watchdog(|| {
            let monitor = CollectionMonitor::builder()
                .probe_interval(Some(Duration::from_millis(5)))
                .build();
            let (counter, _id) = counter_subscriber(&monitor);

            assert!(wait_until(PATIENCE, || counter.load(Ordering::Relaxed) >= 3));
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot reliably wait on OS timers.
    #[test]
    fn shutdown_stops_runner() {
        with_watchdog(|| {
            let monitor = manual_monitor();
            let (counter, _id) = counter_subscriber(&monitor);

            monitor.notify_collected();
            assert!(wait_until(PATIENCE, || monitor.cycles() >= 1));

            monitor.shutdown();
            assert!(monitor.is_finished());

            // The runner has been joined, so nothing can run anymore.
            let cycles = monitor.cycles();
            monitor.notify_collected();
            assert_eq!(monitor.cycles(), cycles);
            assert_eq!(counter.load(Ordering::Relaxed), 1);

            // Idempotent.
            monitor.shutdown();
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot reliably wait on OS timers.
    #[test]
    fn shutdown_from_subscriber_does_not_deadlock() {
        with_watchdog(|| {
            let monitor = Arc::new(manual_monitor());

            let shutdown_target = Arc::downgrade(&monitor);
            monitor.subscribe_fn(move || {
                if let Some(monitor) = shutdown_target.upgrade() {
                    monitor.shutdown();
                }
            });

            monitor.notify_collected();

            assert!(wait_until(PATIENCE, || monitor.is_finished()));
        });
    }

    #[test]
    fn subscribe_after_shutdown_does_not_start_runner() {
        let monitor = manual_monitor();
        monitor.shutdown();

        let _id = monitor.subscribe_fn(|| {});

        assert!(monitor.runner.lock().is_none());
        assert_eq!(monitor.subscriber_count(), 1);
    }

    #[cfg_attr(miri, ignore)] // Miri cannot reliably wait on OS timers.
    #[test]
    fn drop_joins_runner() {
        with_watchdog(|| {
            let monitor = manual_monitor();
            let (_counter, _id) = counter_subscriber(&monitor);
            let inner = Arc::downgrade(&monitor.inner);

            drop(monitor);

            // The runner owned the other reference and has exited.
            assert_eq!(inner.strong_count(), 0);
        });
    }

    #[test]
    fn debug_lists_settings() {
        let monitor = CollectionMonitor::builder()
            .thread_name("debug-monitor")
            .build();

        let output = format!("{monitor:?}");

        assert!(output.contains("debug-monitor"));
        assert!(output.contains("cycles"));
    }

    #[test]
    fn panic_payload_formats() {
        let text: Box<dyn Any + Send> = Box::new("static text");
        let owned: Box<dyn Any + Send> = Box::new("owned text".to_string());
        let other: Box<dyn Any + Send> = Box::new(42_u8);

        assert_eq!(format_panic_payload(&text), "static text");
        assert_eq!(format_panic_payload(&owned), "owned text");
        assert_eq!(format_panic_payload(&other), "unknown panic payload");
    }
}
