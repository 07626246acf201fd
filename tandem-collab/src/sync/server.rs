//! Server side of differential synchronization.
//!
//! ```text
//!                 ┌──────────────────────── RoomState ───────────────────────┐
//! EditMessage ──► │ channel(conn).shadow ──patch──► server_copy              │
//!                 │        ▲                             │                   │
//!                 │        └──── diff(shadow, server) ◄──┘                   │
//!                 │                   │                                      │
//!                 └───────────────────┼──────────────────────────────────────┘
//!                                     ▼
//!                          ServerEditResponse ──► sender
//!                          remoteUpdateIncoming ──► rest of the room
//!                          save ──► SnapshotScheduler ──► DataAdapter
//! ```
//!
//! Every connection in a room has its own [`ClientChannel`]. Client edits are
//! applied strictly in order and only when their version stamps match the
//! channel's shadow; a mismatched edit is logged and dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tandem_core::{DeltaEngine, Document, JsonDiffPatch};
use tokio::sync::{mpsc, Mutex, RwLock};

use super::cache::{ClientChannel, RoomCache, RoomState};
use super::snapshot::SnapshotScheduler;
use crate::error::SyncError;
use crate::protocol::{ConnectionId, Edit, EditMessage, ServerEditResponse, ServerMessage};
use crate::storage::DataAdapter;

/// Transport-side handle for one client connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Subscribe the connection to the room's broadcasts.
    async fn join(&self, room: &str);

    /// Queue a message for this connection only.
    fn send(&self, message: ServerMessage);
}

/// Events for collaborators (presence, broadcast) to consume.
pub enum ServerEvent {
    UserJoined {
        connection: Arc<dyn Connection>,
        room: String,
    },
    /// A connection pushed edits; everyone else in the room should sync.
    ServerSyncRequested {
        connection: Arc<dyn Connection>,
        room: String,
    },
    /// The connection has no channel in the room and must rejoin.
    InvalidConnection {
        connection: Arc<dyn Connection>,
        room: String,
    },
}

impl fmt::Debug for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, connection, room) = match self {
            ServerEvent::UserJoined { connection, room } => ("UserJoined", connection, room),
            ServerEvent::ServerSyncRequested { connection, room } => {
                ("ServerSyncRequested", connection, room)
            }
            ServerEvent::InvalidConnection { connection, room } => {
                ("InvalidConnection", connection, room)
            }
        };
        f.debug_struct(name)
            .field("connection", &connection.id())
            .field("room", room)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// Another caller is fetching the room; retry later.
    NotReady,
    /// The adapter failed to load the room.
    Failed,
}

pub struct SyncService {
    engine: Arc<dyn DeltaEngine>,
    cache: Arc<RoomCache>,
    snapshots: Arc<SnapshotScheduler>,
    /// Joins hold a room's gate for reading, close holds it for writing.
    gates: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl SyncService {
    pub fn new(adapter: Arc<dyn DataAdapter>) -> Self {
        Self::with_engine(adapter, Arc::new(JsonDiffPatch::default()))
    }

    pub fn with_engine(adapter: Arc<dyn DataAdapter>, engine: Arc<dyn DeltaEngine>) -> Self {
        let cache = Arc::new(RoomCache::new(adapter));
        let snapshots = Arc::new(SnapshotScheduler::new(cache.clone()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            cache,
            snapshots,
            gates: Mutex::new(HashMap::new()),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Register `connection` in `room` and hand it the current document.
    ///
    /// Waits behind a running [`SyncService::close`] of the same room.
    pub async fn join_connection<F>(
        &self,
        connection: Arc<dyn Connection>,
        room: &str,
        initialize_client: F,
    ) -> JoinOutcome
    where
        F: FnOnce(Document) + Send,
    {
        let gate = self.gate(room).await;
        let outcome = self
            .join_open_room(&gate, connection, room, initialize_client)
            .await;
        if outcome == JoinOutcome::Failed {
            self.release_gate(room, gate).await;
        }
        outcome
    }

    async fn join_open_room<F>(
        &self,
        gate: &RwLock<()>,
        connection: Arc<dyn Connection>,
        room: &str,
        initialize_client: F,
    ) -> JoinOutcome
    where
        F: FnOnce(Document) + Send,
    {
        let _open = gate.read().await;

        let state = match self.cache.get_data(room).await {
            Ok(Some(state)) => state,
            Ok(None) => return JoinOutcome::NotReady,
            Err(e) => {
                log::error!("Join of {} to room '{room}' failed: {e}", connection.id());
                return JoinOutcome::Failed;
            }
        };

        connection.join(room).await;

        let document = {
            let mut state = state.lock().await;
            let channel = ClientChannel::new(&state.server_copy);
            state.clients.insert(connection.id(), channel);
            state.server_copy.clone()
        };

        initialize_client(document);
        log::info!("Connection {} joined room '{room}'", connection.id());
        self.emit(ServerEvent::UserJoined {
            connection,
            room: room.to_string(),
        });
        JoinOutcome::Joined
    }

    /// Reconcile a client's edit message and reply with the server's changes.
    pub async fn receive_edit<F>(
        &self,
        connection: &Arc<dyn Connection>,
        message: EditMessage,
        send_to_client: F,
    ) where
        F: FnOnce(ServerEditResponse),
    {
        let room = message.room;
        let id = connection.id();

        let state = match self.cache.get_data(&room).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                log::debug!("Room '{room}' still loading, dropping edits from {id}");
                return;
            }
            Err(e) => {
                log::warn!("Room '{room}' unavailable for {id}: {e}");
                self.invalid_connection(connection, &room);
                return;
            }
        };

        let had_edits = !message.edits.is_empty();
        let response = {
            let mut guard = state.lock().await;
            let RoomState {
                server_copy,
                clients,
            } = &mut *guard;

            let Some(channel) = clients.get_mut(&id) else {
                let error = SyncError::InvalidConnection {
                    connection: id,
                    room: room.clone(),
                };
                log::warn!("{error}");
                self.invalid_connection(connection, &room);
                return;
            };

            if message.server_version == channel.shadow.server_version {
                channel.edits.clear();
            }

            for edit in message.edits {
                match self.apply_client_edit(server_copy, channel, edit) {
                    Ok(()) => {}
                    Err(e @ SyncError::RejectedEdit { local_version, shadow_local_version, .. })
                        if local_version < shadow_local_version =>
                    {
                        log::debug!("Duplicate edit from {id} in room '{room}': {e}");
                    }
                    Err(e) => log::warn!("Dropped edit from {id} in room '{room}': {e}"),
                }
            }

            self.send_server_changes(server_copy, channel)
        };

        let snapshots = self.snapshots.clone();
        let save_room = room.clone();
        tokio::spawn(async move { snapshots.save(&save_room).await });

        if had_edits {
            self.emit(ServerEvent::ServerSyncRequested {
                connection: connection.clone(),
                room,
            });
        }

        send_to_client(response);
    }

    fn apply_client_edit(
        &self,
        server_copy: &mut Document,
        channel: &mut ClientChannel,
        edit: Edit,
    ) -> Result<(), SyncError> {
        let shadow = &mut channel.shadow;
        if edit.server_version != shadow.server_version
            || edit.local_version != shadow.local_version
        {
            return Err(SyncError::RejectedEdit {
                server_version: edit.server_version,
                local_version: edit.local_version,
                shadow_server_version: shadow.server_version,
                shadow_local_version: shadow.local_version,
            });
        }

        channel.backup.doc = shadow.doc.clone();
        channel.backup.server_version = shadow.server_version;

        let changed = !self.engine.is_empty(&edit.diff);
        if let Err(e) = self.engine.patch(&mut shadow.doc, edit.diff.clone()) {
            shadow.doc = channel.backup.doc.clone();
            shadow.server_version = channel.backup.server_version;
            return Err(e.into());
        }
        // The server copy may hold other clients' edits the shadow has not seen.
        for skipped in self.engine.fuzzy_patch(server_copy, edit.diff) {
            log::debug!("Skipped conflicting entry: {skipped}");
        }
        if changed {
            shadow.local_version += 1;
        }
        Ok(())
    }

    /// Diff the channel's shadow against the server copy and build the reply.
    ///
    /// The reply is produced even when nothing changed so the client's round
    /// trip always completes.
    pub fn send_server_changes(
        &self,
        server_copy: &Document,
        channel: &mut ClientChannel,
    ) -> ServerEditResponse {
        let delta = self.engine.diff(&channel.shadow.doc, server_copy);
        let server_version = channel.shadow.server_version;

        if !self.engine.is_empty(&delta) {
            channel.edits.push(Edit {
                server_version,
                local_version: channel.shadow.local_version,
                diff: delta.clone(),
            });
            channel.shadow.server_version += 1;
            if let Err(e) = self.engine.patch(&mut channel.shadow.doc, delta) {
                log::error!("Failed to patch shadow with server diff: {e}");
                channel.shadow.doc = server_copy.clone();
            }
        }

        ServerEditResponse {
            local_version: channel.shadow.local_version,
            server_version,
            edits: channel.edits.clone(),
        }
    }

    /// Remove the connection's channel. Returns how many channels remain.
    pub async fn leave_connection(&self, id: ConnectionId, room: &str) -> usize {
        let Some(state) = self.cache.peek(room).await else {
            return 0;
        };
        let mut state = state.lock().await;
        if state.clients.remove(&id).is_some() {
            log::info!("Connection {id} left room '{room}'");
        }
        state.clients.len()
    }

    /// Save the room once more and drop it from memory.
    ///
    /// Returns false without closing if a connection joined in the meantime.
    pub async fn close(&self, room: &str) -> bool {
        let gate = self.gate(room).await;
        let _closing = gate.write().await;

        if let Some(state) = self.cache.peek(room).await {
            if !state.lock().await.clients.is_empty() {
                log::debug!("Room '{room}' has members again, not closing");
                return false;
            }
        }

        self.snapshots.save(room).await;
        self.cache.evict(room).await;
        self.snapshots.forget(room).await;
        self.gates.lock().await.remove(room);
        log::info!("Closed room '{room}'");
        true
    }

    /// Save the room's current document.
    pub async fn save_snapshot(&self, room: &str) {
        self.snapshots.save(room).await;
    }

    /// Current server copy of a cached room.
    pub async fn document(&self, room: &str) -> Option<Document> {
        let state = self.cache.peek(room).await?;
        let document = state.lock().await.server_copy.clone();
        Some(document)
    }

    pub async fn channel(&self, id: ConnectionId, room: &str) -> Option<ClientChannel> {
        let state = self.cache.peek(room).await?;
        let channel = state.lock().await.clients.get(&id).cloned();
        channel
    }

    pub async fn room_count(&self) -> usize {
        self.cache.len().await
    }

    async fn gate(&self, room: &str) -> Arc<RwLock<()>> {
        self.gates
            .lock()
            .await
            .entry(room.to_string())
            .or_default()
            .clone()
    }

    /// Drop a room's gate when nobody else holds it and the room is not loaded.
    async fn release_gate(&self, room: &str, gate: Arc<RwLock<()>>) {
        let mut gates = self.gates.lock().await;
        let unused = gates
            .get(room)
            .is_some_and(|current| Arc::ptr_eq(current, &gate) && Arc::strong_count(&gate) == 2);
        if unused && self.cache.peek(room).await.is_none() {
            gates.remove(room);
        }
    }

    fn invalid_connection(&self, connection: &Arc<dyn Connection>, room: &str) {
        self.emit(ServerEvent::InvalidConnection {
            connection: connection.clone(),
            room: room.to_string(),
        });
    }

    fn emit(&self, event: ServerEvent) {
        if self.event_tx.send(event).is_err() {
            log::trace!("No listener for server events");
        }
    }
}
