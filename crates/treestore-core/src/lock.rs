//! Per-key mutual exclusion with reference-counted entries.
//!
//! Structural mutations of one owner are serialized by holding that owner's
//! key. The set of keys is unbounded, so entries are created on demand and
//! removed again once nobody holds or waits for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    /// Holders plus waiters. Only touched under the registry guard.
    refs: usize,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

/// Registry of named locks.
///
/// Built once and shared by reference (`Arc`) with every consumer. The
/// registry guard is held only for O(1) map updates, never while waiting for a
/// key. Re-acquiring a key already held by the same call chain deadlocks.
#[derive(Default)]
pub struct NamedLockRegistry {
    slots: Slots,
}

impl NamedLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is exclusively held by the caller.
    ///
    /// The lock is released when the returned guard is dropped. Dropping this
    /// future before it completes gives the reference back without locking.
    pub async fn acquire(&self, key: &str) -> NamedLockGuard {
        let lock = {
            let mut slots = lock_slots(&self.slots);
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                lock: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.lock)
        };

        let mut guard = NamedLockGuard {
            slots: Arc::clone(&self.slots),
            key: key.to_string(),
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        trace!(key, "named lock acquired");
        guard
    }

    /// Number of keys currently held or waited for.
    pub fn active_keys(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

/// Exclusive ownership of one key. Dropping it releases the key.
pub struct NamedLockGuard {
    slots: Slots,
    key: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl NamedLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.slots);
        // Unlock and decrement under the same guard so a concurrent acquire
        // never picks up a slot that is about to be removed.
        let was_held = self.held.take().is_some();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(&self.key);
            }
        }
        if was_held {
            trace!(key = %self.key, "named lock released");
        }
    }
}

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<String, Slot>> {
    // Critical sections never panic midway through an update, so the map is
    // consistent even if a holder panicked elsewhere.
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let registry = NamedLockRegistry::new();
        {
            let guard = registry.acquire("u1").await;
            assert_eq!(guard.key(), "u1");
            assert_eq!(registry.active_keys(), 1);
        }
        assert_eq!(registry.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let registry = NamedLockRegistry::new();
        let _a = registry.acquire("u1").await;
        let b = tokio::time::timeout(Duration::from_millis(200), registry.acquire("u2")).await;
        assert!(b.is_ok());
        assert_eq!(registry.active_keys(), 2);
    }

    #[tokio::test]
    async fn test_same_key_waits_for_holder() {
        let registry = NamedLockRegistry::new();
        let guard = registry.acquire("u1").await;

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), registry.acquire("u1")).await;
        assert!(blocked.is_err());

        drop(guard);
        let retry = tokio::time::timeout(Duration::from_millis(200), registry.acquire("u1")).await;
        assert!(retry.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak() {
        let registry = NamedLockRegistry::new();
        let guard = registry.acquire("u1").await;

        // Times out while waiting; the dropped future must give its ref back.
        let _ = tokio::time::timeout(Duration::from_millis(20), registry.acquire("u1")).await;
        assert_eq!(registry.active_keys(), 1);

        drop(guard);
        assert_eq!(registry.active_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serializes_holders_of_one_key() {
        let registry = Arc::new(NamedLockRegistry::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire("owner").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_keys(), 0);
    }
}
