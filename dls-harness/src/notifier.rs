//! Wake-up signal between the store's change hook and the scenario thread.
//!
//! The notifier carries one bit: "something changed since you last looked".
//! Signals that arrive while nobody is waiting are remembered until the next
//! [`ChangeNotifier::await_change`], and several signals before a wait
//! coalesce into one wake. Waiters must re-check their predicate after every
//! wake.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use dls_common::{ChangeObserver, StoreChange};
use tracing::trace;

#[derive(Debug, Default)]
pub struct ChangeNotifier {
    pending: Mutex<bool>,
    changed: Condvar,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change and wake every waiter.
    pub fn signal(&self) {
        *self.lock() = true;
        self.changed.notify_all();
    }

    /// Block until a change is pending or `deadline` passes.
    ///
    /// Returns whether a change was observed. The pending flag is cleared on
    /// every return, so the next wait only sees later signals.
    pub fn await_change(&self, deadline: Instant) -> bool {
        let mut pending = self.lock();
        while !*pending {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            pending = guard;
        }
        std::mem::replace(&mut *pending, false)
    }

    /// Whether a signal is waiting to be consumed.
    pub fn is_pending(&self) -> bool {
        *self.lock()
    }

    // Only a bool lives behind the lock, so a poisoned lock is still valid.
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Store hook that forwards every committed change to a [`ChangeNotifier`].
#[derive(Debug, Clone)]
pub struct NotifierObserver {
    notifier: Arc<ChangeNotifier>,
}

impl NotifierObserver {
    pub fn new(notifier: Arc<ChangeNotifier>) -> Self {
        Self { notifier }
    }
}

impl ChangeObserver for NotifierObserver {
    fn on_change(&self, change: &StoreChange) {
        trace!(resource = %change.resource, kind = %change.kind, "signalling change");
        self.notifier.signal();
    }
}
