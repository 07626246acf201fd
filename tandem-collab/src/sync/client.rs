//! Client side of differential synchronization.
//!
//! ```text
//!            initialize(doc)            sync_with_server()
//! uninitialized ──────────────► idle ─────────────────────► syncing
//!                                ▲                             │
//!                                └──── apply_server_edits() ◄──┘
//!                                      (chains when scheduled)
//! ```
//!
//! The engine holds the live local copy plus a private shadow of what the
//! server is known to have. Each cycle diffs shadow → local, queues the delta
//! as a version-stamped [`Edit`], and sends every unacknowledged edit. The
//! transport feeds the server's reply back through [`ClientSyncService::apply_server_edits`].

use std::sync::Arc;

use tandem_core::{DeltaEngine, Document, JsonDiffPatch};
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::protocol::{Edit, EditMessage, ServerEditResponse};

/// Events emitted by the client engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientSyncEvent {
    /// An edit message is ready to be sent to the server.
    SyncEdits(EditMessage),
    /// A round trip completed.
    Synced,
    Error(SyncError),
}

pub struct ClientSyncService {
    room: String,
    engine: Arc<dyn DeltaEngine>,

    local_copy: Document,
    shadow: Document,
    local_version: u64,
    server_version: u64,
    edits: Vec<Edit>,

    syncing: bool,
    scheduled: bool,
    initialized: bool,

    event_tx: mpsc::UnboundedSender<ClientSyncEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ClientSyncEvent>>,
}

impl ClientSyncService {
    pub fn new(room: impl Into<String>) -> Self {
        Self::with_engine(room, Arc::new(JsonDiffPatch::default()))
    }

    pub fn with_engine(room: impl Into<String>, engine: Arc<dyn DeltaEngine>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            room: room.into(),
            engine,
            local_copy: Document::Null,
            shadow: Document::Null,
            local_version: 0,
            server_version: 0,
            edits: Vec::new(),
            syncing: false,
            scheduled: false,
            initialized: false,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ClientSyncEvent>> {
        self.event_rx.take()
    }

    /// Seed local copy and shadow from the server's document.
    pub fn initialize(&mut self, server_doc: Document) -> Result<(), SyncError> {
        if self.initialized {
            return Err(SyncError::AlreadyInitialized);
        }
        if !(server_doc.is_object() || server_doc.is_array()) {
            return Err(SyncError::InvalidInitialData(type_name(&server_doc)));
        }

        self.shadow = server_doc.clone();
        self.local_copy = server_doc;
        self.server_version = 0;
        self.initialized = true;
        self.syncing = false;
        log::debug!("Client engine initialized for room '{}'", self.room);
        Ok(())
    }

    /// Back to `uninitialized`, dropping all sync state.
    pub fn reset(&mut self) {
        self.local_copy = Document::Null;
        self.shadow = Document::Null;
        self.local_version = 0;
        self.server_version = 0;
        self.edits.clear();
        self.syncing = false;
        self.scheduled = false;
        self.initialized = false;
    }

    /// Request a sync; coalesces into the running cycle if one is in flight.
    pub fn schedule(&mut self) {
        if self.syncing {
            self.scheduled = true;
            return;
        }
        self.sync_with_server();
    }

    /// Start a sync cycle. Returns false when not initialized or already syncing.
    pub fn sync_with_server(&mut self) -> bool {
        if !self.initialized || self.syncing {
            return false;
        }
        self.scheduled = false;
        self.syncing = true;

        let delta = self.engine.diff(&self.shadow, &self.local_copy);
        let base_local_version = self.local_version;
        let changed = !self.engine.is_empty(&delta);

        if changed {
            self.edits.push(Edit {
                server_version: self.server_version,
                local_version: base_local_version,
                diff: delta.clone(),
            });
            self.local_version += 1;
        }

        let message = EditMessage {
            room: self.room.clone(),
            edits: self.edits.clone(),
            local_version: base_local_version,
            server_version: self.server_version,
        };

        if changed {
            if let Err(e) = self.engine.patch(&mut self.shadow, delta) {
                log::error!("Failed to patch shadow with own diff: {e}");
                self.shadow = self.local_copy.clone();
            }
        }

        self.emit(ClientSyncEvent::SyncEdits(message));
        true
    }

    /// Round-trip completion: apply the server's edits and release `syncing`.
    pub fn apply_server_edits(&mut self, response: ServerEditResponse) {
        if response.local_version == self.local_version {
            self.edits.clear();
            for edit in response.edits {
                self.apply_server_edit(edit);
            }
        } else {
            log::warn!(
                "Rejected server response for local version {} (at {})",
                response.local_version,
                self.local_version
            );
            self.emit(ClientSyncEvent::Error(SyncError::VersionMismatch {
                expected: self.local_version,
                received: response.local_version,
            }));
        }

        self.syncing = false;
        self.emit(ClientSyncEvent::Synced);

        if self.scheduled {
            self.sync_with_server();
        }
    }

    /// Apply one server edit if it is stamped for exactly the current versions.
    pub fn apply_server_edit(&mut self, edit: Edit) -> bool {
        if edit.local_version != self.local_version || edit.server_version != self.server_version {
            log::debug!(
                "Dropped server edit {}/{} (at {}/{})",
                edit.server_version,
                edit.local_version,
                self.server_version,
                self.local_version
            );
            return false;
        }

        if self.engine.is_empty(&edit.diff) {
            return true;
        }

        if let Err(e) = self.engine.patch(&mut self.shadow, edit.diff.clone()) {
            log::error!("Failed to patch shadow with server edit: {e}");
            self.emit(ClientSyncEvent::Error(SyncError::Delta(e)));
            return false;
        }
        self.server_version += 1;

        // Local edits made during the round trip stay; they go out next cycle.
        for skipped in self.engine.fuzzy_patch(&mut self.local_copy, edit.diff) {
            log::debug!("Skipped entry conflicting with local edits: {skipped}");
        }
        true
    }

    /// The live local copy.
    pub fn get_data(&self) -> &Document {
        &self.local_copy
    }

    /// Mutable access to the live local copy, the editing surface.
    pub fn data_mut(&mut self) -> &mut Document {
        &mut self.local_copy
    }

    pub fn shadow(&self) -> &Document {
        &self.shadow
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn local_version(&self) -> u64 {
        self.local_version
    }

    pub fn server_version(&self) -> u64 {
        self.server_version
    }

    pub fn pending_edits(&self) -> &[Edit] {
        &self.edits
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn emit(&self, event: ClientSyncEvent) {
        // Receiver dropped means nobody is listening; the engine keeps working.
        let _ = self.event_tx.send(event);
    }
}

fn type_name(doc: &Document) -> &'static str {
    match doc {
        Document::Null => "null",
        Document::Bool(_) => "boolean",
        Document::Number(_) => "number",
        Document::String(_) => "string",
        Document::Array(_) => "array",
        Document::Object(_) => "object",
    }
}
