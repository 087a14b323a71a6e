//! Per-key async mutual exclusion.
//!
//! An entry exists only while some caller holds or awaits the lock for its
//! key, so keys supplied by unauthenticated callers never accumulate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<()>>;

/// A set of async mutexes keyed by string.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

/// Held lock for one key. Dropping it releases the lock and removes the
/// entry once nobody else is waiting on it.
#[derive(Debug)]
pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    /// Create an empty lock set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        // Declared first so a cancelled wait still prunes the entry.
        let mut held = KeyedGuard {
            owner: self,
            key: key.to_owned(),
            guard: None,
        };
        let slot = Arc::clone(self.slots().entry(key.to_owned()).or_default());
        held.guard = Some(slot.lock_owned().await);
        held
    }

    /// Number of keys currently locked or awaited.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    /// Whether no key is locked or awaited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    fn prune(&self, key: &str) {
        let mut slots = self.slots();
        if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(key);
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.owner.prune(&self.key);
    }
}
