//! Detects reentrant calls into the same logical owner on the current thread.
//!
//! An owner obtains a process-unique [`UniqueId`] once and wraps its guarded section in
//! [`enter()`]. While the returned guard is alive, another `enter()` with the same id on the same
//! thread returns `None`. Dropping the guard - including during a panic - leaves the section.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use scopeguard::ScopeGuard;
use smallvec::SmallVec;

/// An identifier that no other call to [`UniqueId::next()`] in this process returns.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct UniqueId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl UniqueId {
    pub(crate) fn next() -> Self {
        // Relaxed is enough - we only need every caller to get a different number.
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for UniqueId {
    #[cfg_attr(test, mutants::skip)] // No API contract for the display format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

thread_local! {
    // Guarded sections are rarely nested more than a couple of levels deep.
    static ACTIVE: RefCell<SmallVec<[UniqueId; 4]>> = RefCell::new(SmallVec::new());
}

/// Keeps the guarded section of an owner entered until dropped.
pub(crate) type Entered = ScopeGuard<UniqueId, fn(UniqueId)>;

/// Enters the guarded section of the owner identified by `id` on the current thread.
///
/// Returns `None` if the current thread is already inside that section. Also returns `None`
/// if the thread is being torn down and its thread-local state is gone, as nothing should start
/// new guarded work at that point.
pub(crate) fn enter(id: UniqueId) -> Option<Entered> {
    let entered = ACTIVE
        .try_with(|active| {
            let mut active = active.borrow_mut();

            if active.contains(&id) {
                false
            } else {
                active.push(id);
                true
            }
        })
        .unwrap_or(false);

    entered.then(|| scopeguard::guard(id, leave as fn(UniqueId)))
}

/// Whether the current thread is inside the guarded section of `id`.
#[cfg(test)]
pub(crate) fn is_entered(id: UniqueId) -> bool {
    ACTIVE
        .try_with(|active| active.borrow().contains(&id))
        .unwrap_or(false)
}

fn leave(id: UniqueId) {
    // If the thread-local is already gone, there is nothing left to clean up.
    drop(ACTIVE.try_with(|active| {
        let mut active = active.borrow_mut();

        if let Some(position) = active.iter().rposition(|entered| *entered == id) {
            active.swap_remove(position);
        }
    }));
}
