//! The process-wide [`CollectionMonitor`].
//!
//! It is created on first subscription and lives until the host calls [`shutdown()`]. Operations
//! other than subscribing do nothing until it exists.

use std::env;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use crossbeam::utils::Backoff;
use tracing::{debug, warn};

use super::DEFAULT_PROBE_INTERVAL;
use crate::{CollectionMonitor, SubscriptionId};

/// Environment variable that sets the probe interval of the process-wide monitor in
/// milliseconds. `0` disables the probe.
pub const PROBE_INTERVAL_ENV: &str = "SLOT_SYNC_PROBE_INTERVAL_MS";

const THREAD_NAME: &str = "slot_sync-global-collection-monitor";

const NOT_READY: u8 = 0;
const PENDING: u8 = 1;
const READY: u8 = 2;

static STATUS: AtomicU8 = AtomicU8::new(NOT_READY);
static MONITOR: OnceLock<CollectionMonitor> = OnceLock::new();

// Separate from the monitor so that shutting down before initialization still sticks.
static FINISHED: AtomicBool = AtomicBool::new(false);

/// Subscribes `handler` to the process-wide monitor, to be invoked with `owner` on every
/// collection cycle for as long as `owner` is alive.
///
/// The first subscription in the process creates the monitor and starts its runner thread.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// let trim_requested = Arc::new(AtomicBool::new(false));
///
/// let id = slot_sync::subscribe(&trim_requested, |flag| flag.store(true, Ordering::Relaxed));
///
/// slot_sync::notify_collected();
/// # slot_sync::unsubscribe(id);
/// ```
pub fn subscribe<O, F>(owner: &Arc<O>, handler: F) -> SubscriptionId
where
    O: Send + Sync + 'static,
    F: Fn(&O) + Send + Sync + 'static,
{
    initialize().subscribe(owner, handler)
}

/// Subscribes `handler` to the process-wide monitor until unsubscribed.
///
/// The first subscription in the process creates the monitor and starts its runner thread.
pub fn subscribe_fn<F>(handler: F) -> SubscriptionId
where
    F: Fn() + Send + Sync + 'static,
{
    initialize().subscribe_fn(handler)
}

/// Removes a subscription from the process-wide monitor.
///
/// Returns `false` if the subscription was not registered.
pub fn unsubscribe(id: SubscriptionId) -> bool {
    ready().is_some_and(|monitor| monitor.unsubscribe(id))
}

/// Signals the process-wide monitor that a collection cycle happened.
pub fn notify_collected() {
    if let Some(monitor) = ready() {
        monitor.notify_collected();
    }
}

/// Stops the process-wide monitor permanently.
///
/// Waits for the runner thread to exit unless called from a subscriber. Subscriptions made
/// afterwards are accepted but never invoked.
pub fn shutdown() {
    // SeqCst pairs with the one in `initialize()`: either we see READY here or the initializer
    // sees FINISHED there, so the monitor is always shut down.
    FINISHED.store(true, Ordering::SeqCst);

    if let Some(monitor) = ready() {
        monitor.shutdown();
    }
}

/// Whether the process-wide monitor has been shut down.
#[must_use]
pub fn is_finished() -> bool {
    FINISHED.load(Ordering::Acquire)
}

/// The number of cycles the process-wide monitor has broadcast.
#[must_use]
pub fn cycles() -> u64 {
    ready().map_or(0, CollectionMonitor::cycles)
}

fn ready() -> Option<&'static CollectionMonitor> {
    if STATUS.load(Ordering::SeqCst) == READY {
        MONITOR.get()
    } else {
        None
    }
}

#[cfg_attr(test, mutants::skip)] // Mutating the spin loop turns into hangs.
fn initialize() -> &'static CollectionMonitor {
    match STATUS.compare_exchange(NOT_READY, PENDING, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => {
            let monitor = MONITOR.get_or_init(|| {
                let probe_interval = probe_interval_from(env::var(PROBE_INTERVAL_ENV).ok());

                debug!(?probe_interval, "creating process-wide collection monitor");

                CollectionMonitor::builder()
                    .probe_interval(probe_interval)
                    .thread_name(THREAD_NAME)
                    .build()
            });

            STATUS.store(READY, Ordering::SeqCst);

            if FINISHED.load(Ordering::SeqCst) {
                monitor.shutdown();
            }

            monitor
        }
        Err(READY) => ready_monitor(),
        Err(_) => {
            // Another thread is creating the monitor and will be done momentarily.
            let backoff = Backoff::new();

            while STATUS.load(Ordering::SeqCst) != READY {
                backoff.snooze();
            }

            ready_monitor()
        }
    }
}

fn ready_monitor() -> &'static CollectionMonitor {
    MONITOR
        .get()
        .expect("status is only set to ready after the monitor is stored")
}

/// Interprets the value of the probe interval environment variable.
fn probe_interval_from(value: Option<String>) -> Option<Duration> {
    let Some(value) = value else {
        return Some(DEFAULT_PROBE_INTERVAL);
    };

    match value.trim().parse::<u64>() {
        Ok(0) => None,
        Ok(millis) => Some(Duration::from_millis(millis)),
        Err(error) => {
            warn!(
                %value,
                %error,
                "ignoring unparsable {PROBE_INTERVAL_ENV}, using the default probe interval"
            );
            Some(DEFAULT_PROBE_INTERVAL)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_env_uses_default() {
        assert_eq!(probe_interval_from(None), Some(DEFAULT_PROBE_INTERVAL));
    }

    #[test]
    fn zero_disables_probe() {
        assert_eq!(probe_interval_from(Some("0".to_string())), None);
    }

    #[test]
    fn millis_are_parsed() {
        assert_eq!(
            probe_interval_from(Some(" 250 ".to_string())),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn garbage_falls_back_to_default() {
        assert_eq!(
            probe_interval_from(Some("soon".to_string())),
            Some(DEFAULT_PROBE_INTERVAL)
        );
        assert_eq!(
            probe_interval_from(Some("-5".to_string())),
            Some(DEFAULT_PROBE_INTERVAL)
        );
    }
}
