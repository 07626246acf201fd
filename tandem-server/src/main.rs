//! tandem sync server binary.
//!
//! Serves differential sync over WebSocket. Rooms live in memory unless a
//! storage path is given and the binary was built with `--features rocksdb`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::storage::{DataAdapter, InMemoryDataAdapter};

/// Server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(about = "Differential synchronization server for JSON documents")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory for room snapshots
    #[arg(short, long, value_name = "PATH")]
    storage: Option<PathBuf>,

    /// Frames a lagging client may fall behind per room
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn open_adapter(storage: Option<PathBuf>) -> Result<Arc<dyn DataAdapter>, BoxError> {
    match storage {
        #[cfg(feature = "rocksdb")]
        Some(path) => {
            use tandem_collab::storage::{RocksDataAdapter, StoreConfig};
            let config = StoreConfig {
                path,
                ..StoreConfig::default()
            };
            Ok(Arc::new(RocksDataAdapter::open(config)?))
        }
        #[cfg(not(feature = "rocksdb"))]
        Some(path) => Err(format!(
            "storage at {} needs a build with --features rocksdb",
            path.display()
        )
        .into()),
        None => {
            log::warn!("No storage configured, rooms are kept in memory only");
            Ok(Arc::new(InMemoryDataAdapter::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let adapter = open_adapter(args.storage)?;
    let config = ServerConfig {
        bind_addr: args.bind,
        broadcast_capacity: args.broadcast_capacity,
        ..ServerConfig::default()
    };

    log::info!("Starting tandem-server on {}", config.bind_addr);
    let server = SyncServer::new(config, adapter);
    server.run().await
}
