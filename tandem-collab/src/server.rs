//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── SyncService ── RoomCache ── DataAdapter
//!             ├── WsConnection ───┤        │
//! Client B ──┘   (per socket)     │        └── SnapshotScheduler
//!                                 │
//!                                 ├── PresenceService (users per room)
//!                                 │
//!                                 └── RoomManager ── BroadcastGroup (per room)
//!                                                        │
//!                                          ┌─────────────┼─────────────┐
//!                                          ▼             ▼             ▼
//!                                       Client A      Client B      Client C
//! ```
//!
//! Every socket gets a [`ConnectionId`] and is greeted with `welcome`.
//! Messages from one socket are handled in arrival order; replies go out on
//! the same socket, room-wide notifications through the room's broadcast group.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tandem_core::{DiffOptions, JsonDiffPatch};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::presence::PresenceService;
use crate::protocol::{ClientMessage, ConnectionId, ServerMessage};
use crate::storage::{DataAdapter, InMemoryDataAdapter};
use crate::sync::{Connection, JoinOutcome, ServerEvent, SyncService};

/// Sent to a connection whose edits reference a room it has no channel in.
pub const RECONNECT_MESSAGE: &str = "Need to re-connect!";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Delay before retrying a join whose room is still being loaded
    pub join_retry_interval: Duration,
    /// Retries before a join is reported as failed
    pub join_retry_limit: u32,
    pub diff: DiffOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            join_retry_interval: Duration::from_millis(20),
            join_retry_limit: 50,
            diff: DiffOptions::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Shared handles every connection task needs.
#[derive(Clone)]
struct ServerContext {
    config: ServerConfig,
    service: Arc<SyncService>,
    presence: Arc<PresenceService>,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The sync server.
pub struct SyncServer {
    ctx: ServerContext,
    /// Taken by the first call to `serve`
    events: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, adapter: Arc<dyn DataAdapter>) -> Self {
        let engine = Arc::new(JsonDiffPatch::new(config.diff.clone()));
        let mut service = SyncService::with_engine(adapter, engine);
        let events = service.take_event_rx();

        Self {
            ctx: ServerContext {
                room_manager: Arc::new(RoomManager::new(config.broadcast_capacity)),
                config,
                service: Arc::new(service),
                presence: Arc::new(PresenceService::new()),
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
            events: Mutex::new(events),
        }
    }

    /// In-memory storage, default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(InMemoryDataAdapter::new()))
    }

    /// Bind to `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.ctx.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(events) = self.events.lock().await.take() {
            let ctx = self.ctx.clone();
            tokio::spawn(async move { Self::handle_events(events, ctx).await });
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.ctx.stats.read().await.clone();
        stats.active_rooms = self.ctx.room_manager.room_count().await;
        stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.ctx.service
    }

    pub fn presence(&self) -> &Arc<PresenceService> {
        &self.ctx.presence
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.ctx.room_manager
    }

    /// Route sync engine events to presence and room broadcasts.
    async fn handle_events(mut events: mpsc::UnboundedReceiver<ServerEvent>, ctx: ServerContext) {
        while let Some(event) = events.recv().await {
            log::trace!("Server event: {event:?}");
            match event {
                ServerEvent::UserJoined { connection, room } => {
                    let users = ctx.presence.add_user(connection.id(), &room).await;
                    let update = ServerMessage::UpdateUsers {
                        room: room.clone(),
                        users,
                    };
                    ctx.room_manager.broadcast_to(&room, &update).await;
                }
                ServerEvent::ServerSyncRequested { connection, room } => {
                    let notice = ServerMessage::RemoteUpdateIncoming {
                        from: connection.id(),
                    };
                    ctx.room_manager.broadcast_to(&room, &notice).await;
                }
                ServerEvent::InvalidConnection { connection, room } => {
                    log::warn!("Connection {} must rejoin room '{room}'", connection.id());
                    connection.send(ServerMessage::Error {
                        message: RECONNECT_MESSAGE.to_string(),
                    });
                }
            }
        }
        log::debug!("Server event loop stopped");
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ServerContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();
        let connection = Arc::new(WsConnection {
            id: Uuid::new_v4(),
            outgoing: out_tx,
            room_manager: ctx.room_manager.clone(),
            forwarders: Mutex::new(Vec::new()),
        });
        let handle: Arc<dyn Connection> = connection.clone();
        log::info!("WebSocket connection {} established from {addr}", connection.id);

        handle.send(ServerMessage::Welcome {
            connection_id: connection.id,
        });

        let mut rooms: Vec<String> = Vec::new();
        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            Self::dispatch(&ctx, &handle, &bytes, &mut rooms).await;
                        }

                        Some(Ok(Message::Text(text))) => {
                            Self::dispatch(&ctx, &handle, text.as_str().as_bytes(), &mut rooms).await;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }

                        _ => {}
                    }
                }

                // Outgoing frames: direct replies and room broadcasts
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break Ok(()) };
                    if let Err(e) = ws_sender.send(Message::Binary(frame.to_vec().into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        Self::cleanup(&ctx, &connection, rooms).await;
        result
    }

    async fn dispatch(
        ctx: &ServerContext,
        connection: &Arc<dyn Connection>,
        bytes: &[u8],
        rooms: &mut Vec<String>,
    ) {
        let id = connection.id();
        let message = match ClientMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Failed to decode message from {id}: {e}");
                connection.send(ServerMessage::Error {
                    message: e.to_string(),
                });
                return;
            }
        };

        {
            let mut s = ctx.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }

        match message {
            ClientMessage::Join { room, .. } => {
                if Self::join_with_retry(ctx, connection, &room).await && !rooms.contains(&room) {
                    rooms.push(room);
                }
            }

            ClientMessage::SyncWithServer { message } => {
                log::trace!("{id} sent {} edits for room '{}'", message.edits.len(), message.room);
                let reply_to = connection.clone();
                ctx.service
                    .receive_edit(connection, message, move |response| {
                        reply_to.send(ServerMessage::ServerEdits { response });
                    })
                    .await;
            }

            ClientMessage::KeepAlive { room } => {
                if let Some(users) = ctx.presence.keep_alive(id, &room).await {
                    let update = ServerMessage::UpdateUsers {
                        room: room.clone(),
                        users,
                    };
                    ctx.room_manager.broadcast_to(&room, &update).await;
                }
            }

            ClientMessage::UpdateUserData { room, meta } => {
                if let Some(users) = ctx.presence.update_meta(id, &room, meta).await {
                    let update = ServerMessage::UpdateUsers {
                        room: room.clone(),
                        users,
                    };
                    ctx.room_manager.broadcast_to(&room, &update).await;
                }
            }

            ClientMessage::Ping => connection.send(ServerMessage::Pong),
        }
    }

    /// Join, retrying while another join is loading the room.
    async fn join_with_retry(
        ctx: &ServerContext,
        connection: &Arc<dyn Connection>,
        room: &str,
    ) -> bool {
        for attempt in 0..=ctx.config.join_retry_limit {
            let reply_to = connection.clone();
            let joined_room = room.to_string();
            let outcome = ctx
                .service
                .join_connection(connection.clone(), room, move |document| {
                    reply_to.send(ServerMessage::Joined {
                        room: joined_room,
                        document,
                    });
                })
                .await;

            match outcome {
                JoinOutcome::Joined => return true,
                JoinOutcome::Failed => {
                    connection.send(ServerMessage::Error {
                        message: format!("Failed to load room '{room}'"),
                    });
                    return false;
                }
                JoinOutcome::NotReady => {
                    log::debug!(
                        "Room '{room}' not ready for {} (attempt {attempt})",
                        connection.id()
                    );
                    tokio::time::sleep(ctx.config.join_retry_interval).await;
                }
            }
        }

        connection.send(ServerMessage::Error {
            message: format!("Room '{room}' is not ready"),
        });
        false
    }

    async fn cleanup(ctx: &ServerContext, connection: &WsConnection, rooms: Vec<String>) {
        let id = connection.id;
        for room in rooms {
            let remaining = ctx.service.leave_connection(id, &room).await;

            if let Some(users) = ctx.presence.remove_user(id, &room).await {
                let update = ServerMessage::UpdateUsers {
                    room: room.clone(),
                    users,
                };
                ctx.room_manager.broadcast_to(&room, &update).await;
            }

            if let Some(group) = ctx.room_manager.get(&room).await {
                group.remove_member(&id).await;
            }
            ctx.room_manager.remove_if_empty(&room).await;

            if remaining == 0 {
                ctx.service.close(&room).await;
            }
        }

        connection.stop_forwarders().await;

        let mut s = ctx.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = ctx.room_manager.room_count().await;
        log::info!("Connection {id} cleaned up");
    }
}

/// Server-side handle of one WebSocket.
struct WsConnection {
    id: ConnectionId,
    /// Frames for the socket writer
    outgoing: mpsc::UnboundedSender<Arc<Vec<u8>>>,
    room_manager: Arc<RoomManager>,
    /// Room broadcast → `outgoing` pumps, one per joined room
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl WsConnection {
    async fn stop_forwarders(&self) {
        for handle in self.forwarders.lock().await.drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn join(&self, room: &str) {
        let group = self.room_manager.get_or_create(room).await;
        if group.has_member(&self.id).await {
            return;
        }

        let mut rx = group.add_member(self.id).await;
        let outgoing = self.outgoing.clone();
        let id = self.id;
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if outgoing.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Connection {id} lagged, {skipped} broadcast frames lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.forwarders.lock().await.push(handle);
    }

    fn send(&self, message: ServerMessage) {
        match message.encode() {
            Ok(encoded) => {
                if self.outgoing.send(Arc::new(encoded)).is_err() {
                    log::debug!("Connection {} gone, message dropped", self.id);
                }
            }
            Err(e) => log::error!("Failed to encode message for {}: {e}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.join_retry_limit > 0);
        assert!(config.diff.detect_move);
    }

    #[tokio::test]
    async fn test_fresh_server_stats() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_ws_connection_forwards_broadcasts() {
        let room_manager = Arc::new(RoomManager::new(16));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let connection = WsConnection {
            id: Uuid::new_v4(),
            outgoing: out_tx,
            room_manager: room_manager.clone(),
            forwarders: Mutex::new(Vec::new()),
        };

        connection.join("r1").await;
        connection.join("r1").await;
        assert_eq!(room_manager.get("r1").await.unwrap().member_count().await, 1);

        room_manager.broadcast_to("r1", &ServerMessage::Pong).await;
        let frame = out_rx.recv().await.unwrap();
        assert_eq!(ServerMessage::decode(&frame).unwrap(), ServerMessage::Pong);

        connection.send(ServerMessage::Pong);
        assert!(out_rx.recv().await.is_some());

        connection.stop_forwarders().await;
    }
}
