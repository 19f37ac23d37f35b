//! Per-key async mutexes.
//!
//! Store, feedback and forget on the same `(owner, scope, key)` take the same
//! lock, so their multi-step sequences never interleave. Unrelated keys never
//! wait on each other. Entries are dropped once nobody holds or awaits them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::memory::types::RecordKey;
use crate::sync::lock;

#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<RecordKey, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of a keyed operation.
pub struct KeyGuard<'a> {
    owner: &'a KeyLocks,
    key: RecordKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // release before pruning so the strong count reflects only waiters
        self.guard.take();
        self.owner.prune(&self.key);
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &RecordKey) -> KeyGuard<'_> {
        let mutex = {
            let mut locks = lock(&self.locks);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    fn prune(&self, key: &RecordKey) {
        let mut locks = lock(&self.locks);
        if let Some(mutex) = locks.get(key) {
            // only the map holds it: no holder, no waiter
            if Arc::strong_count(mutex) == 1 {
                locks.remove(key);
            }
        }
    }

    /// Number of keys currently locked or contended.
    pub fn len(&self) -> usize {
        lock(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Scope;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let key = RecordKey::new("u", Scope::Persistent, "k");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(&key).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyLocks::new();
        let a = locks.acquire(&RecordKey::new("u", Scope::Persistent, "a")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(&RecordKey::new("u", Scope::Persistent, "b")),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
        drop(a);
    }
}
