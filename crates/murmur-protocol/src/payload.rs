//! Payload records, one per frame kind.
//!
//! Field names follow the camelCase text schema. Free-form values
//! (`params`, `result`, `data`) default to JSON `null` and are omitted from
//! text frames when null.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frames::CorrelationId;

/// RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    /// Correlation id, unique among in-flight calls.
    pub id: CorrelationId,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// When the request was built, in ms since epoch.
    pub timestamp: u64,
}

/// RPC response. Exactly one of `result` / `error` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    /// Correlation id of the answered request.
    pub id: CorrelationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// File attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub url: String,
    pub content_type: String,
    /// Size in bytes.
    pub size: u64,
}

/// A chat message posted to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Mentioned user ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    /// Id of the message this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Presence status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum PresenceStatus {
    Online = 0,
    Away = 1,
    Busy = 2,
    DoNotDisturb = 3,
    Offline = 4,
}

impl From<PresenceStatus> for u8 {
    fn from(status: PresenceStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for PresenceStatus {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceStatus::Online),
            1 => Ok(PresenceStatus::Away),
            2 => Ok(PresenceStatus::Busy),
            3 => Ok(PresenceStatus::DoNotDisturb),
            4 => Ok(PresenceStatus::Offline),
            _ => Err("Invalid presence status"),
        }
    }
}

/// A user's presence changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: String,
    pub status: PresenceStatus,
    /// Last activity, in ms since epoch.
    pub last_seen: u64,
}

/// Typing indicator for one user in one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub user_id: String,
    pub room_id: String,
    pub is_typing: bool,
    pub timestamp: u64,
}

/// Room lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomEvent {
    pub room_id: String,
    /// Event name, e.g. `memberJoined`.
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    pub timestamp: u64,
}

/// Reference to a room, used by join/leave requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: String,
}

/// Ping/pong body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_status_conversion() {
        assert_eq!(PresenceStatus::try_from(0), Ok(PresenceStatus::Online));
        assert_eq!(PresenceStatus::try_from(3), Ok(PresenceStatus::DoNotDisturb));
        assert_eq!(PresenceStatus::try_from(4), Ok(PresenceStatus::Offline));
        assert!(PresenceStatus::try_from(5).is_err());
    }

    #[test]
    fn test_presence_status_text_form() {
        let status: PresenceStatus = serde_json::from_str("\"doNotDisturb\"").unwrap();
        assert_eq!(status, PresenceStatus::DoNotDisturb);
        assert_eq!(
            serde_json::to_string(&PresenceStatus::Away).unwrap(),
            "\"away\""
        );
    }
}
