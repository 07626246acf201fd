//! RocksDB-backed room store.
//!
//! Column families:
//! - `documents`: room snapshots, serialized JSON, LZ4 compressed
//! - `metadata`: per-room metadata (bincode: version, sizes, timestamps)
//!
//! Both are keyed by the room id's UTF-8 bytes. A snapshot and its metadata
//! are written in one atomic batch.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tandem_core::Document;

use super::{DataAdapter, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync on every snapshot write
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Metadata stored alongside each room snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room: String,
    /// Number of snapshots written for this room.
    pub version: u64,
    /// Serialized JSON size in bytes.
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room: &str) -> Self {
        let now = now_secs();
        Self {
            room: room.to_string(),
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable [`DataAdapter`] on RocksDB.
pub struct RocksDataAdapter {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksDataAdapter {
    /// Open (or create) the store and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened room store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    // ─── Snapshots ───────────────────────────────────────────────────

    /// Persist the full room document and bump its metadata.
    pub fn save_snapshot(&self, room: &str, document: &Document) -> Result<RoomMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json = serde_json::to_vec(document)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut meta = match self.load_metadata(room) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => RoomMetadata::new(room),
            Err(e) => return Err(e),
        };
        meta.version += 1;
        meta.snapshot_size = json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, room.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, room.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Stored snapshot v{} for room '{room}' ({} → {} bytes)",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    pub fn load_snapshot(&self, room: &str) -> Result<Document, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = self
            .db
            .get_cf(&cf, room.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(room.to_string()))?;

        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    pub fn room_exists(&self, room: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, room.as_bytes())?.is_some())
    }

    // ─── Metadata ────────────────────────────────────────────────────

    pub fn load_metadata(&self, room: &str) -> Result<RoomMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room.as_bytes())? {
            Some(bytes) => RoomMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(room.to_string())),
        }
    }

    /// All rooms with a stored snapshot.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let room = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            rooms.push(room);
        }
        Ok(rooms)
    }

    pub fn delete_room(&self, room: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, room.as_bytes());
        batch.delete_cf(&cf_meta, room.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

#[async_trait]
impl DataAdapter for RocksDataAdapter {
    async fn get_data(&self, room: &str) -> Result<Document, StoreError> {
        match self.load_snapshot(room) {
            Ok(doc) => Ok(doc),
            Err(StoreError::NotFound(_)) => Ok(json!({})),
            Err(e) => Err(e),
        }
    }

    async fn store_data(&self, room: &str, document: &Document) -> Result<(), StoreError> {
        self.save_snapshot(room, document).map(|_| ())
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
    use tempfile::tempdir;

    fn open(dir: &Path) -> RocksDataAdapter {
        RocksDataAdapter::open(StoreConfig::for_testing(dir.join("db"))).unwrap()
    }

    #[test]
    fn test_snapshot_save_load() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let doc = json!({"todos": [{"id": 1, "title": "write tests"}], "owner": "x"});

        let meta = store.save_snapshot("r1", &doc).unwrap();
        assert_eq!(meta.room, "r1");
        assert_eq!(meta.version, 1);
        assert!(meta.compressed_size > 0);

        assert_eq!(store.load_snapshot("r1").unwrap(), doc);
    }

    #[test]
    fn test_snapshot_not_found() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        assert_eq!(
            store.load_snapshot("missing"),
            Err(StoreError::NotFound("missing".into()))
        );
    }

    #[test]
    fn test_metadata_versions_increase() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        store.save_snapshot("r1", &json!({"v": 1})).unwrap();
        store.save_snapshot("r1", &json!({"v": 2})).unwrap();
        let meta = store.load_metadata("r1").unwrap();
        assert_eq!(meta.version, 2);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_list_and_delete_rooms() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        store.save_snapshot("a", &json!({})).unwrap();
        store.save_snapshot("b", &json!([])).unwrap();

        let mut rooms = store.list_rooms().unwrap();
        rooms.sort();
        assert_eq!(rooms, vec!["a", "b"]);

        store.delete_room("a").unwrap();
        assert!(!store.room_exists("a").unwrap());
        assert!(store.room_exists("b").unwrap());
    }

    #[tokio::test]
    async fn test_adapter_unknown_room_is_empty_object() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        assert_eq!(store.get_data("fresh").await.unwrap(), json!({}));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.save_snapshot("r1", &json!({"kept": true})).unwrap();
            store.sync().unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.load_snapshot("r1").unwrap(), json!({"kept": true}));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("tandem_data"));
        assert!(!config.sync_writes);
        assert_eq!(config.max_open_files, 512);
    }
}
