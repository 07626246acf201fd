//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, join, rejoin, disconnect)
//! - A [`ClientSyncService`] driven by server replies and room notifications
//! - Presence updates (keep-alive, user metadata)
//!
//! ```text
//!  application ── with_data / sync ──► ClientSyncService ── SyncEdits ──► driver ──► writer ──► socket
//!       ▲                                     ▲                                                  │
//!       └──────────── SyncEvent ◄─────────────┴────────────── reader ◄───────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tandem_core::{DiffOptions, Document, JsonDiffPatch};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::error::SyncError;
use crate::presence::UserPresence;
use crate::protocol::{ClientMessage, ConnectionId, ProtocolError, ServerMessage};
use crate::sync::{ClientSyncEvent, ClientSyncService};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Joined a room and received its document
    Connected,
    /// A sync round trip completed
    Synced,
    Error(String),
    /// The room's user list changed
    UsersUpdated(Vec<UserPresence>),
    /// Connection lost
    Disconnected,
}

type PendingJoin = Arc<Mutex<Option<oneshot::Sender<Result<(), SyncError>>>>>;

/// The sync client.
///
/// Owns one room's [`ClientSyncService`] and the WebSocket it syncs over.
pub struct SyncClient {
    room: String,
    server_url: String,

    engine: Arc<Mutex<ClientSyncService>>,
    /// Engine events, handed to the driver task on first connect
    engine_rx: Option<mpsc::UnboundedReceiver<ClientSyncEvent>>,

    state: Arc<RwLock<ConnectionState>>,
    connection_id: Arc<RwLock<Option<ConnectionId>>>,

    /// Channel to the WebSocket writer task of the current connection
    outgoing_tx: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
    pending_join: PendingJoin,

    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    request_timeout: Duration,
}

impl SyncClient {
    pub fn new(room: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self::with_options(room, server_url, DiffOptions::default())
    }

    /// Client whose engine diffs with `options`; they should match the server's.
    pub fn with_options(
        room: impl Into<String>,
        server_url: impl Into<String>,
        options: DiffOptions,
    ) -> Self {
        let room = room.into();
        let mut engine =
            ClientSyncService::with_engine(room.clone(), Arc::new(JsonDiffPatch::new(options)));
        let engine_rx = engine.take_event_rx();
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            room,
            server_url: server_url.into(),
            engine: Arc::new(Mutex::new(engine)),
            engine_rx,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connection_id: Arc::new(RwLock::new(None)),
            outgoing_tx: Arc::new(RwLock::new(None)),
            pending_join: Arc::new(Mutex::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// How long `connect` and `join` wait for the server.
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the socket and wait for the server's `welcome`.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<ConnectionId, ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        *self.outgoing_tx.write().await = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Driver task: engine output → socket / application
        if let Some(engine_rx) = self.engine_rx.take() {
            tokio::spawn(drive_engine(
                engine_rx,
                self.outgoing_tx.clone(),
                self.event_tx.clone(),
            ));
        }

        // Reader task: process incoming WebSocket messages
        let (welcome_tx, welcome_rx) = oneshot::channel();
        let reader = Reader {
            engine: self.engine.clone(),
            connection_id: self.connection_id.clone(),
            pending_join: self.pending_join.clone(),
            event_tx: self.event_tx.clone(),
            welcome_tx: Some(welcome_tx),
        };
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            while let Some(msg) = ws_reader.next().await {
                let bytes: Vec<u8> = match msg {
                    Ok(Message::Binary(data)) => data.into(),
                    Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                match ServerMessage::decode(&bytes) {
                    Ok(message) => reader.handle(message).await,
                    Err(e) => log::warn!("Failed to decode server message: {e}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            reader.connection_lost().await;
        });

        let connection_id = match tokio::time::timeout(self.request_timeout, welcome_rx).await {
            Ok(Ok(id)) => id,
            Ok(Err(_)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Timeout);
            }
        };

        *self.state.write().await = ConnectionState::Connected;
        log::info!("Connected to {} as {connection_id}", self.server_url);
        Ok(connection_id)
    }

    /// Join the room; resolves once the server's document initialized the engine.
    pub async fn join(&self, credentials: Value) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        *self.pending_join.lock().await = Some(tx);

        self.send(ClientMessage::Join {
            credentials,
            room: self.room.clone(),
        })
        .await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                self.pending_join.lock().await.take();
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    /// Drop all sync state and join again, for a full resync.
    pub async fn rejoin(&self, credentials: Value) -> Result<(), SyncError> {
        self.engine.lock().await.reset();
        self.join(credentials).await
    }

    /// Edit the live local copy. Call [`SyncClient::sync`] to push the change.
    pub async fn with_data<R>(&self, edit: impl FnOnce(&mut Document) -> R) -> R {
        let mut engine = self.engine.lock().await;
        edit(engine.data_mut())
    }

    /// Copy of the local document.
    pub async fn data(&self) -> Document {
        self.engine.lock().await.get_data().clone()
    }

    /// Schedule a sync cycle.
    pub async fn sync(&self) {
        self.engine.lock().await.schedule();
    }

    pub async fn keep_alive(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::KeepAlive {
            room: self.room.clone(),
        })
        .await
    }

    /// Merge `meta` into this user's presence metadata.
    pub async fn update_user_data(&self, meta: Value) -> Result<(), ProtocolError> {
        self.send(ClientMessage::UpdateUserData {
            room: self.room.clone(),
            meta,
        })
        .await
    }

    /// Send a ping to the server.
    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    /// Close the socket. Pending edits stay queued in the engine.
    pub async fn disconnect(&self) {
        self.outgoing_tx.write().await.take();
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn connection_id(&self) -> Option<ConnectionId> {
        *self.connection_id.read().await
    }

    pub async fn is_syncing(&self) -> bool {
        self.engine.lock().await.is_syncing()
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn engine(&self) -> &Arc<Mutex<ClientSyncService>> {
        &self.engine
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        send_frame(&self.outgoing_tx, &message).await
    }
}

async fn send_frame(
    outgoing: &RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    message: &ClientMessage,
) -> Result<(), ProtocolError> {
    let encoded = message.encode()?;
    let tx = outgoing
        .read()
        .await
        .clone()
        .ok_or(ProtocolError::ConnectionClosed)?;
    tx.send(encoded)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)
}

fn emit(event_tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(e) = event_tx.try_send(event) {
        log::warn!("Dropped sync event: {e}");
    }
}

/// Forward engine output: edit messages to the socket, the rest to the application.
async fn drive_engine(
    mut engine_rx: mpsc::UnboundedReceiver<ClientSyncEvent>,
    outgoing: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
    event_tx: mpsc::Sender<SyncEvent>,
) {
    while let Some(event) = engine_rx.recv().await {
        match event {
            ClientSyncEvent::SyncEdits(message) => {
                log::trace!("Sending {} edits for room '{}'", message.edits.len(), message.room);
                let frame = ClientMessage::SyncWithServer { message };
                if let Err(e) = send_frame(&outgoing, &frame).await {
                    log::warn!("Failed to send edits: {e}");
                    emit(&event_tx, SyncEvent::Error(e.to_string()));
                }
            }
            ClientSyncEvent::Synced => emit(&event_tx, SyncEvent::Synced),
            ClientSyncEvent::Error(e) => emit(&event_tx, SyncEvent::Error(e.to_string())),
        }
    }
}

/// State owned by the reader task of one connection.
struct Reader {
    engine: Arc<Mutex<ClientSyncService>>,
    connection_id: Arc<RwLock<Option<ConnectionId>>>,
    pending_join: PendingJoin,
    event_tx: mpsc::Sender<SyncEvent>,
    welcome_tx: Option<oneshot::Sender<ConnectionId>>,
}

impl Reader {
    async fn handle(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { connection_id } => {
                *self.connection_id.write().await = Some(connection_id);
                if let Some(tx) = self.welcome_tx.take() {
                    let _ = tx.send(connection_id);
                }
            }

            ServerMessage::Joined { room, document } => {
                let result = self.engine.lock().await.initialize(document);
                match &result {
                    Ok(()) => {
                        log::info!("Joined room '{room}'");
                        emit(&self.event_tx, SyncEvent::Connected);
                    }
                    Err(e) => log::error!("Failed to initialize from room '{room}': {e}"),
                }
                if let Some(tx) = self.pending_join.lock().await.take() {
                    let _ = tx.send(result);
                }
            }

            ServerMessage::ServerEdits { response } => {
                self.engine.lock().await.apply_server_edits(response);
            }

            ServerMessage::RemoteUpdateIncoming { from } => {
                if *self.connection_id.read().await == Some(from) {
                    return;
                }
                log::trace!("Remote update from {from}");
                self.engine.lock().await.schedule();
            }

            ServerMessage::UpdateUsers { users, .. } => {
                emit(&self.event_tx, SyncEvent::UsersUpdated(users));
            }

            ServerMessage::Error { message } => {
                log::warn!("Server error: {message}");
                if let Some(tx) = self.pending_join.lock().await.take() {
                    let _ = tx.send(Err(ProtocolError::Rejected(message.clone()).into()));
                }
                emit(&self.event_tx, SyncEvent::Error(message));
            }

            ServerMessage::Pong => log::trace!("Pong"),
        }
    }

    async fn connection_lost(&mut self) {
        log::info!("Disconnected from server");
        if let Some(tx) = self.pending_join.lock().await.take() {
            let _ = tx.send(Err(ProtocolError::ConnectionClosed.into()));
        }
        emit(&self.event_tx, SyncEvent::Disconnected);
    }
}
