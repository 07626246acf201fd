//! Room membership and free-form user metadata.
//!
//! One `PresenceService` is owned by the server and injected where needed.
//! Every mutation returns the room's updated user list so the caller can
//! broadcast `updateUsers`; operations on unknown users yield `None`.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::protocol::ConnectionId;

/// One connected user as seen by the rest of the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub id: ConnectionId,
    pub room: String,
    /// Join time, seconds since the Unix epoch.
    pub joined: u64,
    /// Last keep-alive or metadata update, seconds since the Unix epoch.
    pub last_action: u64,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl UserPresence {
    fn new(id: ConnectionId, room: &str) -> Self {
        let now = now_secs();
        Self {
            id,
            room: room.to_string(),
            joined: now,
            last_action: now,
            meta: Map::new(),
        }
    }
}

/// Users per room, in join order.
#[derive(Debug, Default)]
pub struct PresenceService {
    rooms: RwLock<HashMap<String, Vec<UserPresence>>>,
}

impl PresenceService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a user in a room. Re-adding an existing user refreshes it.
    pub async fn add_user(&self, id: ConnectionId, room: &str) -> Vec<UserPresence> {
        let mut rooms = self.rooms.write().await;
        let users = rooms.entry(room.to_string()).or_default();

        match users.iter_mut().find(|u| u.id == id) {
            Some(user) => user.last_action = now_secs(),
            None => users.push(UserPresence::new(id, room)),
        }
        log::info!("User {id} joined room '{room}' ({} online)", users.len());
        users.clone()
    }

    pub async fn remove_user(&self, id: ConnectionId, room: &str) -> Option<Vec<UserPresence>> {
        let mut rooms = self.rooms.write().await;
        let Some(users) = rooms.get_mut(room) else {
            log::debug!("No users tracked in room '{room}'");
            return None;
        };

        let before = users.len();
        users.retain(|u| u.id != id);
        if users.len() == before {
            log::debug!("There is no user {id} in room '{room}'");
            return None;
        }

        let remaining = users.clone();
        if remaining.is_empty() {
            rooms.remove(room);
        }
        log::info!("User {id} left room '{room}' ({} online)", remaining.len());
        Some(remaining)
    }

    /// Shallow-merge `meta` (a JSON object) into the user's metadata.
    pub async fn update_meta(
        &self,
        id: ConnectionId,
        room: &str,
        meta: Value,
    ) -> Option<Vec<UserPresence>> {
        let Value::Object(fields) = meta else {
            log::warn!("Ignoring non-object metadata from {id} in room '{room}'");
            return None;
        };

        self.touch(id, room, |user| user.meta.extend(fields)).await
    }

    /// Refresh the user's `last_action` timestamp.
    pub async fn keep_alive(&self, id: ConnectionId, room: &str) -> Option<Vec<UserPresence>> {
        self.touch(id, room, |_| {}).await
    }

    pub async fn users(&self, room: &str) -> Vec<UserPresence> {
        self.rooms
            .read()
            .await
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn user(&self, id: ConnectionId, room: &str) -> Option<UserPresence> {
        self.rooms
            .read()
            .await
            .get(room)
            .and_then(|users| users.iter().find(|u| u.id == id).cloned())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn touch(
        &self,
        id: ConnectionId,
        room: &str,
        update: impl FnOnce(&mut UserPresence),
    ) -> Option<Vec<UserPresence>> {
        let mut rooms = self.rooms.write().await;
        let users = rooms.get_mut(room)?;
        let Some(user) = users.iter_mut().find(|u| u.id == id) else {
            log::debug!("There is no user {id} in room '{room}'");
            return None;
        };

        update(user);
        user.last_action = now_secs();
        Some(users.clone())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_add_and_remove_users() {
        let presence = PresenceService::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        presence.add_user(alice, "r1").await;
        let users = presence.add_user(bob, "r1").await;
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].id, alice);

        let users = presence.remove_user(alice, "r1").await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, bob);

        let users = presence.remove_user(bob, "r1").await.unwrap();
        assert!(users.is_empty());
        assert_eq!(presence.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_add_same_user_twice() {
        let presence = PresenceService::new();
        let id = Uuid::new_v4();
        presence.add_user(id, "r1").await;
        let users = presence.add_user(id, "r1").await;
        assert_eq!(users.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_unknown_user() {
        let presence = PresenceService::new();
        assert!(presence.remove_user(Uuid::new_v4(), "nowhere").await.is_none());

        presence.add_user(Uuid::new_v4(), "r1").await;
        assert!(presence.remove_user(Uuid::new_v4(), "r1").await.is_none());
    }

    #[tokio::test]
    async fn test_update_meta_shallow_merge() {
        let presence = PresenceService::new();
        let id = Uuid::new_v4();
        presence.add_user(id, "r1").await;

        presence
            .update_meta(id, "r1", json!({"name": "Alice", "color": "red"}))
            .await
            .unwrap();
        let users = presence
            .update_meta(id, "r1", json!({"color": {"hex": "#0f0"}}))
            .await
            .unwrap();

        let meta = &users[0].meta;
        assert_eq!(meta["name"], "Alice");
        assert_eq!(meta["color"], json!({"hex": "#0f0"}));
    }

    #[tokio::test]
    async fn test_update_meta_rejects_non_object() {
        let presence = PresenceService::new();
        let id = Uuid::new_v4();
        presence.add_user(id, "r1").await;
        assert!(presence.update_meta(id, "r1", json!("nope")).await.is_none());
        assert!(presence.user(id, "r1").await.unwrap().meta.is_empty());
    }

    #[tokio::test]
    async fn test_keep_alive_unknown_user() {
        let presence = PresenceService::new();
        let id = Uuid::new_v4();
        assert!(presence.keep_alive(id, "r1").await.is_none());

        presence.add_user(id, "r1").await;
        let users = presence.keep_alive(id, "r1").await.unwrap();
        assert!(users[0].last_action >= users[0].joined);
    }

    #[test]
    fn test_presence_wire_format() {
        let user = UserPresence {
            id: Uuid::nil(),
            room: "r1".into(),
            joined: 10,
            last_action: 12,
            meta: Map::new(),
        };
        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["lastAction"], 12);
        assert_eq!(value["room"], "r1");
    }
}
