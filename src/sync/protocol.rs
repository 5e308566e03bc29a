//! Room event vocabulary and JSON envelope codec.
//!
//! Event names are bit-exact with the room server. Payloads are plain JSON
//! objects; on the WebSocket transport each event travels as one text frame
//! shaped `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{RoomId, SessionId};

/// Maximum encoded message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Room the server falls back to when a join carries no room
pub const DEFAULT_ROOM: &str = "default";

/// Event names shared with the room server
pub mod events {
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const DIAGRAM_UPDATE: &str = "diagram_update";
    pub const CURSOR_UPDATE: &str = "cursor_update";

    pub const CONNECTED: &str = "connected";
    pub const USER_JOINED: &str = "user_joined";
    pub const USER_LEFT: &str = "user_left";
}

/// How the outbound gate treats an event name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Captured as the pending join, forwarded only while sync is on
    Join,
    /// Forwarded only while sync is on, dropped otherwise
    Sync,
    /// Not governed by the gate
    Passthrough,
}

pub fn classify(event: &str) -> EventClass {
    match event {
        events::JOIN => EventClass::Join,
        events::DIAGRAM_UPDATE | events::CURSOR_UPDATE => EventClass::Sync,
        _ => EventClass::Passthrough,
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// A join request as emitted by the embedding editor.
///
/// Unknown keys are carried in `extra` so a deferred join is replayed with the
/// exact payload the editor asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(default = "default_room")]
    pub room: RoomId,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_room() -> RoomId {
    DEFAULT_ROOM.to_string()
}

impl JoinRequest {
    pub fn new(room: impl Into<RoomId>) -> Self {
        Self {
            room: room.into(),
            extra: Map::new(),
        }
    }

    /// Read a join payload, tolerating payloads that are not objects
    pub fn from_payload(payload: &Value) -> Self {
        match serde_json::from_value(payload.clone()) {
            Ok(join) => join,
            Err(_) => Self::new(DEFAULT_ROOM),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub room: RoomId,
}

/// The unit of outbound synchronization: the full buffer, not a diff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditEvent {
    pub room: RoomId,
    pub text: String,
    pub cursor: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorEvent {
    pub room: RoomId,
    pub cursor: usize,
}

/// A full-buffer update relayed from another participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteUpdate {
    pub text: String,
    #[serde(default)]
    pub cursor: Option<usize>,
    #[serde(default)]
    pub from_sid: Option<SessionId>,
}

/// Room events delivered by the server
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connected { sid: SessionId },
    UserJoined { users_count: usize },
    UserLeft { users_count: usize },
    DiagramUpdate(RemoteUpdate),
    CursorUpdate { cursor: Option<usize>, from_sid: Option<SessionId> },
    Other { event: String, payload: Value },
}

impl InboundEvent {
    pub fn decode(event: &str, payload: Value) -> Result<Self, ProtocolError> {
        match event {
            events::CONNECTED => Ok(InboundEvent::Connected {
                sid: string_field(&payload, "sid")?,
            }),
            events::USER_JOINED => Ok(InboundEvent::UserJoined {
                users_count: count_field(&payload)?,
            }),
            events::USER_LEFT => Ok(InboundEvent::UserLeft {
                users_count: count_field(&payload)?,
            }),
            events::DIAGRAM_UPDATE => {
                if !payload.get("text").map_or(false, Value::is_string) {
                    return Err(ProtocolError::MissingField("text"));
                }
                Ok(InboundEvent::DiagramUpdate(serde_json::from_value(payload)?))
            }
            events::CURSOR_UPDATE => Ok(InboundEvent::CursorUpdate {
                cursor: payload
                    .get("cursor")
                    .and_then(Value::as_u64)
                    .map(|c| c as usize),
                from_sid: payload
                    .get("from_sid")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            _ => Ok(InboundEvent::Other {
                event: event.to_string(),
                payload,
            }),
        }
    }
}

fn string_field(payload: &Value, field: &'static str) -> Result<String, ProtocolError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProtocolError::MissingField(field))
}

fn count_field(payload: &Value) -> Result<usize, ProtocolError> {
    payload
        .get("users_count")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .ok_or(ProtocolError::MissingField("users_count"))
}

/// One event as framed on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Protocol codec for the WebSocket transport
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode an event and its payload into a text frame
    pub fn encode(event: &str, data: Value) -> Result<String, ProtocolError> {
        let envelope = Envelope {
            event: event.to_string(),
            data,
        };
        let text = serde_json::to_string(&envelope)?;

        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }

        Ok(text)
    }

    /// Decode a text frame into an envelope
    pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }

        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(ProtocolError::InvalidFormat(
                "Envelope is not an object".to_string(),
            ));
        }
        if !value.get("event").map_or(false, Value::is_string) {
            return Err(ProtocolError::MissingField("event"));
        }

        Ok(serde_json::from_value(value)?)
    }
}
