//! JSON wire protocol for room-based schema collaboration.
//!
//! Every frame is one envelope:
//! ```text
//! { "type": "<snake_case tag>", "data": { ...camelCase payload... } }
//! ```
//!
//! Decoding is two-stage so the server can tell the two failure modes
//! apart: a frame that does not parse as an envelope (or whose payload does
//! not match the tag) is a protocol error and earns an `error` reply; an
//! envelope with an unrecognized tag is logged and dropped without a reply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence::{CursorPosition, UserPresence};

/// Identity supplied by the host application. Relayed, never validated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: String,
}

impl User {
    pub fn new(
        id: impl Into<String>,
        username: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            role: role.into(),
        }
    }
}

/// Kinds of schema mutation the protocol relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    TableCreated,
    TableUpdated,
    TableDeleted,
    RelationshipAdded,
    RelationshipRemoved,
}

/// A schema mutation in flight. `data` is opaque to this layer; the schema
/// editor owns its shape and the CRUD API owns persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub data: Value,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

/// `user_join` payload (client → server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub user: User,
    pub schema_id: String,
}

/// `user_joined` payload (server → room).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoined {
    pub user_id: String,
    pub username: String,
}

/// `user_left` payload (server → room).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub user_id: String,
}

/// `schema_shared` payload. Inbound (client → server) it names the invitee;
/// the direct notification to the invitee carries only the schema id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaShared {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invitee_username: Option<String>,
    pub schema_id: String,
}

/// `access_revoked` payload; relayed to the target user verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRevoked {
    pub user_id: String,
    pub schema_id: String,
}

/// `cursor_update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorFrame {
    pub user_id: String,
    pub position: CursorPosition,
    pub timestamp: DateTime<Utc>,
}

/// `user_selection` payload: the ids of the objects a user has selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionFrame {
    pub user_id: String,
    pub selection: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// `error` payload (server → offending client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply {
    pub message: String,
}

/// The closed union of protocol messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    UserJoin(JoinRequest),
    UserJoined(UserJoined),
    UserLeft(UserLeft),
    SchemaChange(SchemaChange),
    SchemaShared(SchemaShared),
    AccessRevoked(AccessRevoked),
    CursorUpdate(CursorFrame),
    UserSelection(SelectionFrame),
    PresenceUpdate(UserPresence),
    Ping,
    Pong,
    Error(ErrorReply),
}

/// The raw `{type, data}` wire shape, before the tag is interpreted.
#[derive(Debug, Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl Message {
    /// The envelope type tag for this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::UserJoin(_) => "user_join",
            Message::UserJoined(_) => "user_joined",
            Message::UserLeft(_) => "user_left",
            Message::SchemaChange(_) => "schema_change",
            Message::SchemaShared(_) => "schema_shared",
            Message::AccessRevoked(_) => "access_revoked",
            Message::CursorUpdate(_) => "cursor_update",
            Message::UserSelection(_) => "user_selection",
            Message::PresenceUpdate(_) => "presence_update",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Error(_) => "error",
        }
    }

    /// Create an `error` reply.
    pub fn error(message: impl Into<String>) -> Self {
        Message::Error(ErrorReply {
            message: message.into(),
        })
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = match self {
            Message::UserJoin(p) => Some(to_payload(p)?),
            Message::UserJoined(p) => Some(to_payload(p)?),
            Message::UserLeft(p) => Some(to_payload(p)?),
            Message::SchemaChange(p) => Some(to_payload(p)?),
            Message::SchemaShared(p) => Some(to_payload(p)?),
            Message::AccessRevoked(p) => Some(to_payload(p)?),
            Message::CursorUpdate(p) => Some(to_payload(p)?),
            Message::UserSelection(p) => Some(to_payload(p)?),
            Message::PresenceUpdate(p) => Some(to_payload(p)?),
            Message::Ping | Message::Pong => None,
            Message::Error(p) => Some(to_payload(p)?),
        };
        let envelope = RawEnvelope {
            tag: self.tag().to_string(),
            data,
        };
        serde_json::to_string(&envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a JSON text frame into a typed message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: RawEnvelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let data = envelope.data.unwrap_or(Value::Null);
        match envelope.tag.as_str() {
            "user_join" => Ok(Message::UserJoin(from_payload(data)?)),
            "user_joined" => Ok(Message::UserJoined(from_payload(data)?)),
            "user_left" => Ok(Message::UserLeft(from_payload(data)?)),
            "schema_change" => Ok(Message::SchemaChange(from_payload(data)?)),
            "schema_shared" => Ok(Message::SchemaShared(from_payload(data)?)),
            "access_revoked" => Ok(Message::AccessRevoked(from_payload(data)?)),
            "cursor_update" => Ok(Message::CursorUpdate(from_payload(data)?)),
            "user_selection" => Ok(Message::UserSelection(from_payload(data)?)),
            "presence_update" => Ok(Message::PresenceUpdate(from_payload(data)?)),
            "ping" => Ok(Message::Ping),
            "pong" => Ok(Message::Pong),
            "error" => Ok(Message::Error(from_payload(data)?)),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

fn to_payload<T: Serialize>(payload: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(payload).map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn from_payload<T: for<'de> Deserialize<'de>>(data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// The frame is not a valid envelope, or the payload does not match the tag.
    Malformed(String),
    /// The envelope parsed, but the tag is not in the catalog.
    UnknownType(String),
    Encode(String),
    Connection(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "Malformed message: {e}"),
            Self::UnknownType(tag) => write!(f, "Unknown message type: {tag}"),
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::Connection(e) => write!(f, "Connection error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_user_join_roundtrip() {
        let msg = Message::UserJoin(JoinRequest {
            user: User::new("u1", "alice", "editor"),
            schema_id: "s1".into(),
        });
        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_user_join_wire_shape() {
        let msg = Message::UserJoin(JoinRequest {
            user: User::new("u1", "alice", "editor"),
            schema_id: "s1".into(),
        });
        let encoded = msg.encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "user_join");
        assert_eq!(value["data"]["schemaId"], "s1");
        assert_eq!(value["data"]["user"]["username"], "alice");
    }

    #[test]
    fn test_schema_change_roundtrip() {
        let msg = Message::SchemaChange(SchemaChange {
            kind: ChangeKind::TableUpdated,
            data: serde_json::json!({"tableId": "t1", "name": "orders"}),
            user_id: "u1".into(),
            timestamp: ts(),
        });
        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_schema_change_wire_shape() {
        let msg = Message::SchemaChange(SchemaChange {
            kind: ChangeKind::RelationshipAdded,
            data: serde_json::json!({"from": "t1", "to": "t2"}),
            user_id: "u1".into(),
            timestamp: ts(),
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["data"]["type"], "relationship_added");
        assert_eq!(value["data"]["userId"], "u1");
        assert!(value["data"]["timestamp"].as_str().unwrap().starts_with("2024-05-01T12:30:00"));
    }

    #[test]
    fn test_cursor_update_roundtrip() {
        let msg = Message::CursorUpdate(CursorFrame {
            user_id: "u1".into(),
            position: CursorPosition {
                x: 10.0,
                y: 20.5,
                table_id: Some("t1".into()),
                column_id: None,
            },
            timestamp: ts(),
        });
        let encoded = msg.encode().unwrap();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_ping_has_no_data() {
        let encoded = Message::Ping.encode().unwrap();
        assert_eq!(encoded, r#"{"type":"ping"}"#);
        assert_eq!(Message::decode(&encoded).unwrap(), Message::Ping);
        assert_eq!(Message::decode(r#"{"type":"pong"}"#).unwrap(), Message::Pong);
    }

    #[test]
    fn test_schema_shared_notice_omits_invitee() {
        let notice = Message::SchemaShared(SchemaShared {
            invitee_username: None,
            schema_id: "s1".into(),
        });
        let value: Value = serde_json::from_str(&notice.encode().unwrap()).unwrap();
        assert!(value["data"].get("inviteeUsername").is_none());
        assert_eq!(value["data"]["schemaId"], "s1");
    }

    #[test]
    fn test_schema_shared_request_roundtrip() {
        let msg = Message::SchemaShared(SchemaShared {
            invitee_username: Some("bob".into()),
            schema_id: "s1".into(),
        });
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = Message::decode(r#"{"type":"warp_drive","data":{}}"#).unwrap_err();
        match err {
            ProtocolError::UnknownType(tag) => assert_eq!(tag, "warp_drive"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_malformed_json() {
        let err = Message::decode("not json at all").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_decode_payload_mismatch_is_malformed() {
        // Known tag, but the payload is missing required fields.
        let err = Message::decode(r#"{"type":"user_join","data":{"schemaId":"s1"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_error_reply_roundtrip() {
        let msg = Message::error("bad frame");
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::Error(reply) => assert_eq!(reply.message, "bad frame"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_change_kind_tags() {
        let json = serde_json::to_value(ChangeKind::TableCreated).unwrap();
        assert_eq!(json, "table_created");
        let kind: ChangeKind = serde_json::from_value(serde_json::json!("relationship_removed")).unwrap();
        assert_eq!(kind, ChangeKind::RelationshipRemoved);
    }
}
