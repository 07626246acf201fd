//! Room-scoped fan-out of server frames.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each member gets an independent receiver that buffers up to `capacity`
//! frames. Frames go to every member, the originator included; receivers
//! filter (a client ignores `remoteUpdateIncoming` carrying its own id).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ConnectionId, ProtocolError, ServerMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_members: usize,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    members: RwLock<HashSet<ConnectionId>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a lagging member may fall behind
    /// before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a member and return its receiver.
    pub async fn add_member(&self, id: ConnectionId) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.members.write().await.insert(id);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, id: &ConnectionId) -> bool {
        self.members.write().await.remove(id)
    }

    /// Encode once, send to every member. Returns the receiver count.
    pub fn broadcast(&self, message: &ServerMessage) -> Result<usize, ProtocolError> {
        let encoded = message.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, id: &ConnectionId) -> bool {
        self.members.read().await.contains(id)
    }

    pub async fn members(&self) -> Vec<ConnectionId> {
        self.members.read().await.iter().copied().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room manager: maps room ids to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, room: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room) {
                return group.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = rooms.get(room) {
            return group.clone();
        }

        let group = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(room.to_string(), group.clone());
        group
    }

    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    /// Encode and send `message` to every member of `room`, if the room exists.
    pub async fn broadcast_to(&self, room: &str, message: &ServerMessage) -> usize {
        let Some(group) = self.get(room).await else {
            return 0;
        };
        match group.broadcast(message) {
            Ok(count) => count,
            Err(e) => {
                log::error!("Failed to encode broadcast for room '{room}': {e}");
                0
            }
        }
    }

    /// Remove the room's group once it has no members.
    pub async fn remove_if_empty(&self, room: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room) {
            if group.member_count().await == 0 {
                rooms.remove(room);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let id = Uuid::new_v4();

        let _rx = group.add_member(id).await;
        assert_eq!(group.member_count().await, 1);
        assert!(group.has_member(&id).await);

        assert!(group.remove_member(&id).await);
        assert_eq!(group.member_count().await, 0);
        assert!(!group.remove_member(&id).await);
    }

    #[tokio::test]
    async fn test_fan_out_includes_sender() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut rx_alice = group.add_member(alice).await;
        let mut rx_bob = group.add_member(bob).await;

        let count = group
            .broadcast(&ServerMessage::RemoteUpdateIncoming { from: alice })
            .unwrap();
        assert_eq!(count, 2);

        for rx in [&mut rx_alice, &mut rx_bob] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(
                ServerMessage::decode(&frame).unwrap(),
                ServerMessage::RemoteUpdateIncoming { from: alice }
            );
        }
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_member(Uuid::new_v4()).await;

        group.broadcast(&ServerMessage::Pong).unwrap();
        group.broadcast_raw(Arc::new(b"{}".to_vec()));

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_members, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let a = manager.get_or_create("r1").await;
        let b = manager.get_or_create("r1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.room_count().await, 1);
        assert!(manager.get("r2").await.is_none());
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let group = manager.get_or_create("r1").await;
        let id = Uuid::new_v4();
        let _rx = group.add_member(id).await;

        assert!(!manager.remove_if_empty("r1").await);
        group.remove_member(&id).await;
        assert!(manager.remove_if_empty("r1").await);
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.active_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_to_missing_room() {
        let manager = RoomManager::new(16);
        assert_eq!(manager.broadcast_to("ghost", &ServerMessage::Pong).await, 0);
    }
}
