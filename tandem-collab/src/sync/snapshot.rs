//! Per-room save serialization.
//!
//! ```text
//! save(r) ─► idle? ──yes──► in_flight ── store_data ──┐
//!              │                 ▲                    │
//!              no                └──── pending? ◄─────┘
//!              │                         │ no
//!              ▼                         ▼
//!         pending = true              idle (notify waiters)
//! ```
//!
//! At most one `store_data` per room is in flight; any number of calls made
//! while it runs collapse into a single follow-up save that captures the
//! document as it is when that follow-up starts.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use super::cache::RoomCache;

#[derive(Default)]
struct SaveSlot {
    in_flight: bool,
    pending: bool,
    done: Arc<Notify>,
}

pub struct SnapshotScheduler {
    cache: Arc<RoomCache>,
    slots: Mutex<HashMap<String, SaveSlot>>,
}

impl SnapshotScheduler {
    pub fn new(cache: Arc<RoomCache>) -> Self {
        Self {
            cache,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Save the room's cached document.
    ///
    /// If a save is already running this only marks a retry and returns once
    /// the running saver has drained it, so awaiting the call always means the
    /// latest state reached the adapter.
    pub async fn save(&self, room: &str) {
        let waiter = {
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(room.to_string()).or_default();
            if slot.in_flight {
                slot.pending = true;
                // Registered under the lock; every notify happens under it too.
                let mut notified = Box::pin(slot.done.clone().notified_owned());
                notified.as_mut().enable();
                Some(notified)
            } else {
                slot.in_flight = true;
                None
            }
        };

        if let Some(notified) = waiter {
            notified.await;
            return;
        }

        loop {
            self.store_once(room).await;

            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.get_mut(room) else {
                return;
            };
            if slot.pending {
                slot.pending = false;
                log::trace!("Running queued save for room '{room}'");
                continue;
            }
            slot.in_flight = false;
            slot.done.notify_waiters();
            return;
        }
    }

    /// Drop the room's save state, releasing anyone waiting on it.
    pub async fn forget(&self, room: &str) {
        if let Some(slot) = self.slots.lock().await.remove(room) {
            slot.done.notify_waiters();
        }
    }

    pub async fn is_in_flight(&self, room: &str) -> bool {
        self.slots
            .lock()
            .await
            .get(room)
            .is_some_and(|slot| slot.in_flight)
    }

    async fn store_once(&self, room: &str) {
        let Some(state) = self.cache.peek(room).await else {
            log::debug!("Room '{room}' not cached, nothing to save");
            return;
        };
        let document = state.lock().await.server_copy.clone();

        match self.cache.adapter().store_data(room, &document).await {
            Ok(()) => log::debug!("Saved snapshot of room '{room}'"),
            Err(e) => log::error!("Failed to save room '{room}': {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DataAdapter, StoreError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tandem_core::Document;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct SlowStore {
        stores: AtomicUsize,
        last: RwLock<Option<Document>>,
        fail: bool,
    }

    #[async_trait]
    impl DataAdapter for SlowStore {
        async fn get_data(&self, _room: &str) -> Result<Document, StoreError> {
            Ok(json!({"n": 0}))
        }

        async fn store_data(&self, _room: &str, document: &Document) -> Result<(), StoreError> {
            self.stores.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            if self.fail {
                return Err(StoreError::Database("write stalled".into()));
            }
            *self.last.write().await = Some(document.clone());
            Ok(())
        }
    }

    async fn setup(fail: bool) -> (Arc<SlowStore>, Arc<RoomCache>, Arc<SnapshotScheduler>) {
        let store = Arc::new(SlowStore {
            fail,
            ..SlowStore::default()
        });
        let cache = Arc::new(RoomCache::new(store.clone()));
        cache.get_data("r1").await.unwrap();
        let scheduler = Arc::new(SnapshotScheduler::new(cache.clone()));
        (store, cache, scheduler)
    }

    #[tokio::test]
    async fn test_concurrent_saves_coalesce_to_two() {
        let (store, _cache, scheduler) = setup(false).await;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.save("r1").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.stores.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_in_flight("r1").await);
    }

    #[tokio::test]
    async fn test_queued_save_sees_later_state() {
        let (store, cache, scheduler) = setup(false).await;

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.save("r1").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let room = cache.peek("r1").await.unwrap();
        room.lock().await.server_copy = json!({"n": 1});
        scheduler.save("r1").await;
        first.await.unwrap();

        assert_eq!(*store.last.read().await, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_failed_save_releases_room() {
        let (store, _cache, scheduler) = setup(true).await;

        scheduler.save("r1").await;
        assert!(!scheduler.is_in_flight("r1").await);

        scheduler.save("r1").await;
        assert_eq!(store.stores.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_forget_releases_queued_saver_while_new_save_runs() {
        let (_store, _cache, scheduler) = setup(false).await;

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.save("r1").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let queued = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.save("r1").await })
        };
        tokio::task::yield_now().await;

        scheduler.forget("r1").await;
        let fresh = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.save("r1").await })
        };

        tokio::time::timeout(Duration::from_secs(1), queued)
            .await
            .expect("queued save released by forget")
            .unwrap();
        first.await.unwrap();
        fresh.await.unwrap();
    }

    #[tokio::test]
    async fn test_uncached_room_is_skipped() {
        let (store, _cache, scheduler) = setup(false).await;
        scheduler.save("ghost").await;
        assert_eq!(store.stores.load(Ordering::SeqCst), 0);
    }
}
