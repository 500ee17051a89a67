// Copyright 2026 Joyent, Inc.

//! Keyed cache of established outbound connections.
//!
//! `get_or_create` is single-flight: concurrent first access for one key
//! runs the factory once and hands every waiter the same connection. A
//! failed creation leaves nothing behind, so the next caller for that key
//! retries from scratch. Entries are never evicted; the cache lives exactly
//! as long as the proxy that owns it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;

use crate::errors::Result;

pub struct ConnectionCache<V> {
    entries: Mutex<HashMap<String, Arc<OnceCell<Arc<V>>>>>,
}

impl<V> ConnectionCache<V> {
    pub fn new() -> ConnectionCache<V> {
        ConnectionCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the connection for `key`, running `factory` to establish it
    /// if no live entry exists. The entries lock is only held to look up or
    /// insert the cell, never across the factory's await.
    pub async fn get_or_create<F, Fut>(&self, key: &str, factory: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let cell = {
            let mut entries = self.lock_entries();
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        match cell
            .get_or_try_init(|| async { factory().await.map(Arc::new) })
            .await
        {
            Ok(connection) => Ok(Arc::clone(connection)),
            Err(e) => {
                // Failed creations are not cached: drop the cell unless a
                // concurrent caller has since initialized or replaced it.
                let mut entries = self.lock_entries();
                if let Some(current) = entries.get(key) {
                    if Arc::ptr_eq(current, &cell) && current.get().is_none() {
                        entries.remove(key);
                    }
                }
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock_entries()
            .values()
            .filter(|cell| cell.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Arc<OnceCell<Arc<V>>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> Default for ConnectionCache<V> {
    fn default() -> ConnectionCache<V> {
        ConnectionCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;

    use crate::errors::ReplicaError;

    #[tokio::test]
    async fn concurrent_first_access_runs_the_factory_once() {
        let cache = ConnectionCache::new();
        let created = AtomicUsize::new(0);

        let calls = (0..16).map(|_| {
            let cache = &cache;
            let created = &created;
            async move {
                cache
                    .get_or_create("replica-7", || async {
                        created.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(42u32)
                    })
                    .await
                    .expect("creation failed")
            }
        });
        let connections = join_all(calls).await;

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        let first = &connections[0];
        for conn in &connections {
            assert!(Arc::ptr_eq(first, conn));
        }
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_connections() {
        let cache = ConnectionCache::new();
        let a = cache
            .get_or_create("a", || async { Ok(1u32) })
            .await
            .expect("creation failed");
        let b = cache
            .get_or_create("b", || async { Ok(2u32) })
            .await
            .expect("creation failed");
        assert_eq!((*a, *b), (1, 2));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn failed_creations_are_not_cached() {
        let cache: ConnectionCache<u32> = ConnectionCache::new();
        let result = cache
            .get_or_create("replica-7", || async {
                Err(ReplicaError::Timeout("connect"))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty());

        // The next caller retries and succeeds.
        let conn = cache
            .get_or_create("replica-7", || async { Ok(7u32) })
            .await
            .expect("creation failed");
        assert_eq!(*conn, 7);
        assert_eq!(cache.len(), 1);
    }
}
