use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;
use tandem_core::Document;
use tokio::sync::RwLock;

use super::{DataAdapter, StoreError};

/// Process-local adapter. Unknown rooms are created as `{}` on first read.
#[derive(Debug, Default)]
pub struct InMemoryDataAdapter {
    rooms: RwLock<HashMap<String, Document>>,
}

impl InMemoryDataAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a room before any client joins it.
    pub fn with_room(mut self, room: impl Into<String>, document: Document) -> Self {
        self.rooms.get_mut().insert(room.into(), document);
        self
    }

    /// Last stored document for `room`, if any.
    pub async fn document(&self, room: &str) -> Option<Document> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[async_trait]
impl DataAdapter for InMemoryDataAdapter {
    async fn get_data(&self, room: &str) -> Result<Document, StoreError> {
        if let Some(doc) = self.rooms.read().await.get(room) {
            return Ok(doc.clone());
        }

        let mut rooms = self.rooms.write().await;
        let doc = rooms.entry(room.to_string()).or_insert_with(|| json!({}));
        log::debug!("Created empty document for room '{room}'");
        Ok(doc.clone())
    }

    async fn store_data(&self, room: &str, document: &Document) -> Result<(), StoreError> {
        self.rooms
            .write()
            .await
            .insert(room.to_string(), document.clone());
        Ok(())
    }
}
