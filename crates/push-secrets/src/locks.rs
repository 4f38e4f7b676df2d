//! Advisory remote-key lock façade, spec.md §4.E concurrency coordination
//! and §5. Serializes `PushSecret` reconciles that touch the same remote
//! key across *different* `PushSecret` objects without blocking the
//! reconcile worker thread: `try_lock()` fails fast as `LockConflict`
//! rather than queueing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct RemoteKeyLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RemoteKeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, store_kind: &str, store_name: &str, remote_key: &str) -> Arc<AsyncMutex<()>> {
        let key = format!("{store_kind}/{store_name}:{remote_key}");
        self.locks.lock().unwrap().entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Attempts to acquire the lock for `(store_kind, store_name, remote_key)`
    /// without blocking; `None` means another reconcile currently holds it.
    pub fn try_acquire(&self, store_kind: &str, store_name: &str, remote_key: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(store_kind, store_name, remote_key).try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_conflicts_while_first_held() {
        let locks = RemoteKeyLocks::new();
        let guard = locks.try_acquire("SecretStore", "vault", "path/to/key");
        assert!(guard.is_some());
        let conflict = locks.try_acquire("SecretStore", "vault", "path/to/key");
        assert!(conflict.is_none());
        drop(guard);
        assert!(locks.try_acquire("SecretStore", "vault", "path/to/key").is_some());
    }

    #[test]
    fn distinct_keys_do_not_conflict() {
        let locks = RemoteKeyLocks::new();
        let a = locks.try_acquire("SecretStore", "vault", "a");
        let b = locks.try_acquire("SecretStore", "vault", "b");
        assert!(a.is_some());
        assert!(b.is_some());
    }
}
