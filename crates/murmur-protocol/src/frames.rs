//! Frame types for the murmur protocol.
//!
//! A frame is the unit exchanged over the socket. Every frame has a kind
//! discriminant; RPC frames additionally carry a correlation id that ties a
//! response to the request it answers.

use serde::de::{self, Unexpected, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::ProtocolError;
use crate::payload::{
    ChatMessage, Heartbeat, PresenceUpdate, RoomEvent, RoomRef, RpcRequest, RpcResponse,
    TypingEvent,
};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Frame kind identifiers.
///
/// The numeric value is the tag byte of the binary layout; [`FrameKind::as_tag`]
/// is the `kind` field of the text layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0x01,
    Response = 0x02,
    ChatMessage = 0x03,
    PresenceUpdate = 0x04,
    Typing = 0x05,
    RoomEvent = 0x06,
    JoinRoom = 0x07,
    LeaveRoom = 0x08,
    Ping = 0x09,
    Pong = 0x0A,
}

impl FrameKind {
    /// All kinds, in tag order.
    pub const ALL: [FrameKind; 10] = [
        FrameKind::Request,
        FrameKind::Response,
        FrameKind::ChatMessage,
        FrameKind::PresenceUpdate,
        FrameKind::Typing,
        FrameKind::RoomEvent,
        FrameKind::JoinRoom,
        FrameKind::LeaveRoom,
        FrameKind::Ping,
        FrameKind::Pong,
    ];

    /// The text-frame tag for this kind.
    #[must_use]
    pub fn as_tag(self) -> &'static str {
        match self {
            FrameKind::Request => "request",
            FrameKind::Response => "response",
            FrameKind::ChatMessage => "chatMessage",
            FrameKind::PresenceUpdate => "presenceUpdate",
            FrameKind::Typing => "typing",
            FrameKind::RoomEvent => "roomEvent",
            FrameKind::JoinRoom => "joinRoom",
            FrameKind::LeaveRoom => "leaveRoom",
            FrameKind::Ping => "ping",
            FrameKind::Pong => "pong",
        }
    }

    /// Look up a kind by its text-frame tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_tag() == tag)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameKind::Request),
            0x02 => Ok(FrameKind::Response),
            0x03 => Ok(FrameKind::ChatMessage),
            0x04 => Ok(FrameKind::PresenceUpdate),
            0x05 => Ok(FrameKind::Typing),
            0x06 => Ok(FrameKind::RoomEvent),
            0x07 => Ok(FrameKind::JoinRoom),
            0x08 => Ok(FrameKind::LeaveRoom),
            0x09 => Ok(FrameKind::Ping),
            0x0A => Ok(FrameKind::Pong),
            _ => Err("Invalid frame kind"),
        }
    }
}

/// Client-generated identifier pairing an RPC request with its response.
///
/// Written as a decimal string in text frames; integers are accepted too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Serialize for CorrelationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CorrelationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = CorrelationId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a correlation id as a decimal string or unsigned integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(CorrelationId(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(CorrelationId)
                    .map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse()
                    .map(CorrelationId)
                    .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

/// A protocol frame.
///
/// In text form the variant name (camelCase) is the `kind` field and the
/// payload record's fields sit next to it in the same JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Frame {
    /// RPC request sent by the client.
    Request(RpcRequest),
    /// RPC response echoing the request id.
    Response(RpcResponse),
    /// Chat message in a room.
    ChatMessage(ChatMessage),
    /// A user's presence status changed.
    PresenceUpdate(PresenceUpdate),
    /// Typing indicator.
    Typing(TypingEvent),
    /// Room lifecycle event (member joined, topic changed, ...).
    RoomEvent(RoomEvent),
    /// Ask the server to deliver a room's events.
    JoinRoom(RoomRef),
    /// Stop receiving a room's events.
    LeaveRoom(RoomRef),
    /// Keepalive ping.
    Ping(Heartbeat),
    /// Keepalive pong.
    Pong(Heartbeat),
}

impl Frame {
    /// Get the frame kind.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Request(_) => FrameKind::Request,
            Frame::Response(_) => FrameKind::Response,
            Frame::ChatMessage(_) => FrameKind::ChatMessage,
            Frame::PresenceUpdate(_) => FrameKind::PresenceUpdate,
            Frame::Typing(_) => FrameKind::Typing,
            Frame::RoomEvent(_) => FrameKind::RoomEvent,
            Frame::JoinRoom(_) => FrameKind::JoinRoom,
            Frame::LeaveRoom(_) => FrameKind::LeaveRoom,
            Frame::Ping(_) => FrameKind::Ping,
            Frame::Pong(_) => FrameKind::Pong,
        }
    }

    /// The correlation id of RPC frames.
    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Frame::Request(request) => Some(request.id),
            Frame::Response(response) => Some(response.id),
            _ => None,
        }
    }

    /// Create a new Request frame stamped with the current time.
    #[must_use]
    pub fn request(id: CorrelationId, method: impl Into<String>, params: Value) -> Self {
        Frame::Request(RpcRequest {
            id,
            method: method.into(),
            params,
            timestamp: now_millis(),
        })
    }

    /// Create a successful Response frame.
    #[must_use]
    pub fn response_ok(id: CorrelationId, result: Value) -> Self {
        Frame::Response(RpcResponse {
            id,
            success: true,
            result,
            error: None,
        })
    }

    /// Create a failed Response frame.
    #[must_use]
    pub fn response_err(id: CorrelationId, error: impl Into<String>) -> Self {
        Frame::Response(RpcResponse {
            id,
            success: false,
            result: Value::Null,
            error: Some(error.into()),
        })
    }

    #[must_use]
    pub fn join_room(room_id: impl Into<String>) -> Self {
        Frame::JoinRoom(RoomRef {
            room_id: room_id.into(),
        })
    }

    #[must_use]
    pub fn leave_room(room_id: impl Into<String>) -> Self {
        Frame::LeaveRoom(RoomRef {
            room_id: room_id.into(),
        })
    }

    /// Create a new Ping frame stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping(Heartbeat {
            timestamp: Some(now_millis()),
        })
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong(Heartbeat { timestamp })
    }

    /// Check field presence and the RPC response invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Frame::Request(request) => require("method", &request.method),
            Frame::Response(response) => match (response.success, &response.error) {
                (true, Some(_)) => Err(ProtocolError::Invalid(format!(
                    "response {} is successful but carries an error",
                    response.id
                ))),
                (false, None) => Err(ProtocolError::Invalid(format!(
                    "response {} failed without an error",
                    response.id
                ))),
                (false, Some(_)) if !response.result.is_null() => {
                    Err(ProtocolError::Invalid(format!(
                        "response {} carries both a result and an error",
                        response.id
                    )))
                }
                _ => Ok(()),
            },
            Frame::ChatMessage(message) => {
                require("id", &message.id)?;
                require("roomId", &message.room_id)?;
                require("senderId", &message.sender_id)
            }
            Frame::PresenceUpdate(update) => require("userId", &update.user_id),
            Frame::Typing(typing) => {
                require("userId", &typing.user_id)?;
                require("roomId", &typing.room_id)
            }
            Frame::RoomEvent(event) => {
                require("roomId", &event.room_id)?;
                require("event", &event.event)
            }
            Frame::JoinRoom(room) | Frame::LeaveRoom(room) => require("roomId", &room.room_id),
            Frame::Ping(_) | Frame::Pong(_) => Ok(()),
        }
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.is_empty() {
        return Err(ProtocolError::Invalid(format!("field `{field}` is empty")));
    }
    Ok(())
}
