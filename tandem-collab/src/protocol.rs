//! JSON wire protocol between `SyncClient` and `SyncServer`.
//!
//! Every frame is one tagged JSON object carried in a WebSocket binary frame:
//! ```text
//! client → server                      server → client
//! ───────────────                      ───────────────
//! { "type": "join", ... }              { "type": "welcome", "connectionId": ... }
//! { "type": "syncWithServer", ... }    { "type": "joined", "room", "document" }
//! { "type": "keepAlive", "room" }      { "type": "serverEdits", "response" }
//! { "type": "updateUserData", ... }    { "type": "remoteUpdateIncoming", "from" }
//! { "type": "ping" }                   { "type": "updateUsers", "room", "users" }
//!                                      { "type": "error", "message" }
//!                                      { "type": "pong" }
//! ```
//!
//! Field names are camelCase on the wire; `Edit`, `EditMessage` and
//! `ServerEditResponse` are the version-stamped sync payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::{Delta, Document};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::UserPresence;

/// Server-assigned identity of one client connection.
pub type ConnectionId = Uuid;

/// One version-stamped delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edit {
    pub server_version: u64,
    pub local_version: u64,
    pub diff: Delta,
}

/// Client → server sync request: every unacknowledged local edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub room: String,
    pub edits: Vec<Edit>,
    /// Local version the newest edit is based on.
    pub local_version: u64,
    pub server_version: u64,
}

/// Server → client reply to an [`EditMessage`]: every unacknowledged server edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEditResponse {
    pub local_version: u64,
    pub server_version: u64,
    pub edits: Vec<Edit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        #[serde(default)]
        credentials: Value,
        room: String,
    },
    SyncWithServer {
        message: EditMessage,
    },
    KeepAlive {
        room: String,
    },
    UpdateUserData {
        room: String,
        meta: Value,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome {
        connection_id: ConnectionId,
    },
    Joined {
        room: String,
        document: Document,
    },
    ServerEdits {
        response: ServerEditResponse,
    },
    RemoteUpdateIncoming {
        from: ConnectionId,
    },
    UpdateUsers {
        room: String,
        users: Vec<UserPresence>,
    },
    Error {
        message: String,
    },
    Pong,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(message).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edit_message_wire_names() {
        let message = EditMessage {
            room: "r1".into(),
            edits: vec![Edit {
                server_version: 0,
                local_version: 0,
                diff: Delta::from_value(json!({"a": [1, 2]})),
            }],
            local_version: 0,
            server_version: 0,
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "room": "r1",
                "edits": [{"serverVersion": 0, "localVersion": 0, "diff": {"a": [1, 2]}}],
                "localVersion": 0,
                "serverVersion": 0,
            })
        );
    }

    #[test]
    fn test_empty_diff_is_null_on_wire() {
        let edit = Edit {
            server_version: 3,
            local_version: 1,
            diff: Delta::empty(),
        };
        let value = serde_json::to_value(&edit).unwrap();
        assert_eq!(value["diff"], Value::Null);
    }

    #[test]
    fn test_client_message_tags() {
        let join = ClientMessage::Join {
            credentials: json!("token"),
            room: "r1".into(),
        };
        let value = serde_json::to_value(&join).unwrap();
        assert_eq!(value, json!({"type": "join", "credentials": "token", "room": "r1"}));

        let ping = serde_json::to_value(ClientMessage::Ping).unwrap();
        assert_eq!(ping, json!({"type": "ping"}));
    }

    #[test]
    fn test_join_without_credentials() {
        let decoded = ClientMessage::decode(br#"{"type":"join","room":"r1"}"#).unwrap();
        assert_eq!(
            decoded,
            ClientMessage::Join {
                credentials: Value::Null,
                room: "r1".into(),
            }
        );
    }

    #[test]
    fn test_server_message_fields_camel_case() {
        let id = Uuid::new_v4();
        let value = serde_json::to_value(ServerMessage::Welcome { connection_id: id }).unwrap();
        assert_eq!(value, json!({"type": "welcome", "connectionId": id.to_string()}));

        let value = serde_json::to_value(ServerMessage::RemoteUpdateIncoming { from: id }).unwrap();
        assert_eq!(value["type"], "remoteUpdateIncoming");
    }

    #[test]
    fn test_server_edits_decode() {
        let frame = br#"{"type":"serverEdits","response":{"localVersion":2,"serverVersion":1,"edits":[{"serverVersion":1,"localVersion":2,"diff":{"x":[1]}}]}}"#;
        match ServerMessage::decode(frame).unwrap() {
            ServerMessage::ServerEdits { response } => {
                assert_eq!(response.local_version, 2);
                assert_eq!(response.edits.len(), 1);
                assert_eq!(response.edits[0].diff.as_value(), &json!({"x": [1]}));
            }
            other => panic!("expected serverEdits, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let err = ServerMessage::decode(&[0xFF, 0xFE]).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));

        let err = ClientMessage::decode(br#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
