//! Persistence integration tests against RocksDB.
//!
//! Verifies:
//! - Room documents reach the store when the last client leaves
//! - A closed room is reloaded from the store on the next join
//! - Rooms stay isolated from each other

#![cfg(feature = "rocksdb")]

use std::sync::Arc;

use serde_json::json;
use tandem_collab::client::SyncClient;
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::storage::{DataAdapter, RocksDataAdapter, StoreConfig};
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

async fn start_server(adapter: Arc<RocksDataAdapter>) -> (String, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(SyncServer::new(ServerConfig::default(), adapter));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (url, server)
}

async fn edit_and_leave(url: &str, room: &str, key: &str, server: &SyncServer) {
    let mut client = SyncClient::new(room, url);
    client.connect().await.unwrap();
    client.join(json!({})).await.unwrap();

    client.with_data(|doc| doc[key] = json!(true)).await;
    client.sync().await;
    timeout(Duration::from_secs(5), async {
        loop {
            let stored = server.service().document(room).await;
            if !client.is_syncing().await && stored.is_some_and(|doc| doc[key] == json!(true)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("edit reached the server");

    client.disconnect().await;
    timeout(Duration::from_secs(5), async {
        while server.service().document(room).await.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room closed after last leave");
}

#[tokio::test]
async fn test_last_leave_writes_snapshot() {
    let dir = tempdir().unwrap();
    let adapter = Arc::new(RocksDataAdapter::open(StoreConfig::for_testing(dir.path())).unwrap());
    let (url, server) = start_server(adapter.clone()).await;

    edit_and_leave(&url, "notes", "saved", &server).await;

    assert_eq!(adapter.load_snapshot("notes").unwrap(), json!({"saved": true}));
    let meta = adapter.load_metadata("notes").unwrap();
    assert_eq!(meta.room, "notes");
    assert!(meta.version >= 1);
    assert!(meta.compressed_size > 0);
}

#[tokio::test]
async fn test_closed_room_reloads_from_store() {
    let dir = tempdir().unwrap();
    let adapter = Arc::new(RocksDataAdapter::open(StoreConfig::for_testing(dir.path())).unwrap());
    let (url, server) = start_server(adapter.clone()).await;

    edit_and_leave(&url, "notes", "first", &server).await;

    let mut client = SyncClient::new("notes", &url);
    client.connect().await.unwrap();
    client.join(json!({})).await.unwrap();
    assert_eq!(client.data().await, json!({"first": true}));
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let dir = tempdir().unwrap();
    let adapter = Arc::new(RocksDataAdapter::open(StoreConfig::for_testing(dir.path())).unwrap());
    let (url, server) = start_server(adapter.clone()).await;

    edit_and_leave(&url, "a", "in_a", &server).await;
    edit_and_leave(&url, "b", "in_b", &server).await;

    assert_eq!(adapter.get_data("a").await.unwrap(), json!({"in_a": true}));
    assert_eq!(adapter.get_data("b").await.unwrap(), json!({"in_b": true}));

    let mut rooms = adapter.list_rooms().unwrap();
    rooms.sort();
    assert_eq!(rooms, vec!["a", "b"]);
}
