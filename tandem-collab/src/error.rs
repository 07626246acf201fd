//! Sync engine error taxonomy.

use tandem_core::DeltaError;
use thiserror::Error;

use crate::protocol::{ConnectionId, ProtocolError};
use crate::storage::StoreError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// A server response is stamped for a different local version than the client holds.
    #[error("rejected patch from server: response local version {received}, expected {expected}")]
    VersionMismatch { expected: u64, received: u64 },

    /// The server has no client channel for this connection; the client must rejoin.
    #[error("connection {connection} is not joined to room '{room}'")]
    InvalidConnection {
        connection: ConnectionId,
        room: String,
    },

    /// A single edit's version stamps do not match the shadow it would apply to.
    #[error(
        "edit rejected: stamped {server_version}/{local_version}, shadow at {shadow_server_version}/{shadow_local_version}"
    )]
    RejectedEdit {
        server_version: u64,
        local_version: u64,
        shadow_server_version: u64,
        shadow_local_version: u64,
    },

    #[error("adapter failure: {0}")]
    Adapter(#[from] StoreError),

    #[error("initial document must be an object or array, got {0}")]
    InvalidInitialData(&'static str),

    #[error("sync engine already initialized")]
    AlreadyInitialized,

    #[error(transparent)]
    Delta(#[from] DeltaError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
