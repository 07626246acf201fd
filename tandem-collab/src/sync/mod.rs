//! Differential synchronization engines.
//!
//! - [`client`]: per-client state machine over a local copy and its shadow.
//! - [`server`]: per-room reconciliation of every connection's channel.
//! - [`cache`]: room documents and channels, loaded from the adapter on miss.
//! - [`snapshot`]: at most one in-flight save per room.

pub mod cache;
pub mod client;
pub mod server;
pub mod snapshot;

pub use cache::{ClientChannel, RoomCache, RoomState};
pub use client::{ClientSyncEvent, ClientSyncService};
pub use server::{Connection, JoinOutcome, ServerEvent, SyncService};
pub use snapshot::SnapshotScheduler;
