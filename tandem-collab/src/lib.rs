//! # tandem-collab: differential synchronization of JSON documents
//!
//! Keeps one shared JSON document per room consistent across clients by
//! exchanging version-stamped deltas against per-connection shadows.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient       │ ◄────────────────► │ SyncServer       │
//! │  ClientSync-     │    JSON frames     │  SyncService     │
//! │  Service         │                    │  PresenceService │
//! └────────┬─────────┘                    └────────┬─────────┘
//!          │                                       │
//!          ▼                                       ▼
//! ┌──────────────────┐                    ┌──────────────────┐
//! │ local copy       │                    │ RoomCache        │
//! │ shadow           │                    │  server copy     │
//! └──────────────────┘                    │  shadow per conn │
//!                                         └────────┬─────────┘
//!                                                  │
//!                                         ┌────────┴─────────┐
//!                                         │ SnapshotScheduler│
//!                                         │ → DataAdapter    │
//!                                         └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`sync`]: client and server sync engines, room cache, snapshot scheduler
//! - [`protocol`]: JSON wire protocol
//! - [`broadcast`]: room-based fan-out
//! - [`presence`]: who is in which room
//! - [`storage`]: persistence adapters
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod broadcast;
pub mod client;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use error::SyncError;
pub use presence::{PresenceService, UserPresence};
pub use protocol::{
    ClientMessage, ConnectionId, Edit, EditMessage, ProtocolError, ServerEditResponse,
    ServerMessage,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{DataAdapter, InMemoryDataAdapter, StoreError};
#[cfg(feature = "rocksdb")]
pub use storage::{RocksDataAdapter, RoomMetadata, StoreConfig};
pub use sync::{
    ClientSyncEvent, ClientSyncService, Connection, JoinOutcome, ServerEvent, SyncService,
};
pub use tandem_core::{Delta, DeltaEngine, DiffOptions, Document, JsonDiffPatch};
