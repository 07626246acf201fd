//! Room/data cache: room id → shared [`RoomState`], filled from the adapter on miss.
//!
//! A cold room triggers exactly one adapter fetch. Callers that arrive while
//! that fetch is outstanding get `Ok(None)` ("not ready") and must re-check
//! their source event later; they never wait on the first caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tandem_core::Document;
use tokio::sync::Mutex;

use crate::protocol::{ConnectionId, Edit};
use crate::storage::{DataAdapter, StoreError};

pub type SharedRoom = Arc<Mutex<RoomState>>;

/// Canonical document of a room plus the per-connection sync channels.
#[derive(Debug)]
pub struct RoomState {
    pub server_copy: Document,
    pub clients: HashMap<ConnectionId, ClientChannel>,
}

impl RoomState {
    pub fn new(server_copy: Document) -> Self {
        Self {
            server_copy,
            clients: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Backup {
    pub doc: Document,
    pub server_version: u64,
}

/// The server's reconstruction of what one client holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Shadow {
    pub doc: Document,
    pub server_version: u64,
    pub local_version: u64,
}

/// Per-connection, per-room sync state.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientChannel {
    pub backup: Backup,
    pub shadow: Shadow,
    /// Server edits the client has not acknowledged yet.
    pub edits: Vec<Edit>,
}

impl ClientChannel {
    /// Fresh channel at version 0, holding its own copies of `server_copy`.
    pub fn new(server_copy: &Document) -> Self {
        Self {
            backup: Backup {
                doc: server_copy.clone(),
                server_version: 0,
            },
            shadow: Shadow {
                doc: server_copy.clone(),
                server_version: 0,
                local_version: 0,
            },
            edits: Vec::new(),
        }
    }
}

#[derive(Default)]
struct CacheInner {
    rooms: HashMap<String, SharedRoom>,
    requests: HashSet<String>,
}

pub struct RoomCache {
    adapter: Arc<dyn DataAdapter>,
    inner: Mutex<CacheInner>,
}

impl RoomCache {
    pub fn new(adapter: Arc<dyn DataAdapter>) -> Self {
        Self {
            adapter,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Cached room, or fetch it. `Ok(None)` while another caller's fetch is outstanding.
    pub async fn get_data(&self, room: &str) -> Result<Option<SharedRoom>, StoreError> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(state) = inner.rooms.get(room) {
                return Ok(Some(state.clone()));
            }
            if !inner.requests.insert(room.to_string()) {
                log::debug!("Fetch for room '{room}' already outstanding");
                return Ok(None);
            }
        }

        let fetched = self.adapter.get_data(room).await;

        let mut inner = self.inner.lock().await;
        inner.requests.remove(room);
        match fetched {
            Ok(document) => {
                let state = Arc::new(Mutex::new(RoomState::new(document)));
                inner.rooms.insert(room.to_string(), state.clone());
                log::debug!("Loaded room '{room}' into cache");
                Ok(Some(state))
            }
            Err(e) => {
                log::error!("Failed to load room '{room}': {e}");
                Err(e)
            }
        }
    }

    /// Cached room without touching the adapter.
    pub async fn peek(&self, room: &str) -> Option<SharedRoom> {
        self.inner.lock().await.rooms.get(room).cloned()
    }

    /// Drop the room and any outstanding-fetch marker.
    pub async fn evict(&self, room: &str) -> Option<SharedRoom> {
        let mut inner = self.inner.lock().await;
        inner.requests.remove(room);
        inner.rooms.remove(room)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.rooms.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn adapter(&self) -> &Arc<dyn DataAdapter> {
        &self.adapter
    }
}
