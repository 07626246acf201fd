//! Persistence adapters for room documents.
//!
//! ```text
//! ┌─────────────┐   get_data(room)    ┌──────────────────────┐
//! │ RoomCache   │ ──────────────────► │ dyn DataAdapter      │
//! │ (cold miss) │                     │                      │
//! └─────────────┘                     │ InMemoryDataAdapter  │
//! ┌─────────────┐   store_data(room)  │ RocksDataAdapter     │
//! │ Snapshot    │ ──────────────────► │   CF "documents"     │
//! │ Scheduler   │                     │   CF "metadata"      │
//! └─────────────┘                     └──────────────────────┘
//! ```
//!
//! Adapters define create-if-absent behaviour; both bundled adapters return
//! an empty object for rooms they have never stored.

use async_trait::async_trait;
use tandem_core::Document;
use thiserror::Error;

pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use memory::InMemoryDataAdapter;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksDataAdapter, RoomMetadata, StoreConfig};

/// Loads and stores one document per room.
#[async_trait]
pub trait DataAdapter: Send + Sync {
    async fn get_data(&self, room: &str) -> Result<Document, StoreError>;

    async fn store_data(&self, room: &str, document: &Document) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("room not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(String),
}
