//! Per-(player, route) write serialization
//!
//! The database already rejects conflicting writes; these locks keep
//! same-session requests from racing each other into retries.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type SessionKey = (String, String);

/// Keyed async mutexes, one per (player, route) in use
#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<SessionKey, Arc<Mutex<()>>>,
}

/// Held while a write for one (player, route) is in flight
pub struct SessionGuard<'a> {
    owner: &'a SessionLocks,
    key: SessionKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to (player, route)
    pub async fn acquire(&self, player_id: &str, route_id: &str) -> SessionGuard<'_> {
        let key = (player_id.to_string(), route_id.to_string());
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        SessionGuard {
            owner: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map holds the mutex once no guard or waiter references it
        self.owner
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_entries_are_evicted_after_use() {
        let locks = SessionLocks::new();
        {
            let _guard = locks.acquire("p1", "r1").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = SessionLocks::new();
        let _a = locks.acquire("p1", "r1").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("p2", "r1")).await;
        assert!(b.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(SessionLocks::new());
        let inside = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                tokio::spawn(async move {
                    let _guard = locks.acquire("p1", "r1").await;
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert!(locks.is_empty());
    }
}
