use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, UserId};

/// Identifier as sent by the backend: document ids are strings, older
/// records carry numeric ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Text(String),
    Number(i64),
}

impl WireId {
    pub fn into_string(self) -> Option<String> {
        let value = match self {
            Self::Text(text) => text.trim().to_string(),
            Self::Number(number) => number.to_string(),
        };
        (!value.is_empty()).then_some(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireProfile {
    #[serde(default)]
    pub id: Option<WireId>,
    #[serde(default, rename = "_id")]
    pub object_id: Option<WireId>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Message author, either a bare id or a populated profile document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireSender {
    Id(WireId),
    Profile(WireProfile),
}

impl WireSender {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::Id(id) => id.clone().into_string().map(UserId),
            Self::Profile(profile) => profile
                .object_id
                .clone()
                .or_else(|| profile.id.clone())
                .and_then(WireId::into_string)
                .map(UserId),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(i64),
    Text(String),
}

impl WireTimestamp {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(millis) => Utc.timestamp_millis_opt(*millis).single(),
            Self::Text(text) => {
                let text = text.trim();
                if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                    return Some(parsed.with_timezone(&Utc));
                }
                text.parse::<i64>()
                    .ok()
                    .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            }
        }
    }
}

/// A message record as the backend sends it, over REST or the live channel.
/// Every field is optional; normalization into the client's message type
/// applies the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<WireId>,
    #[serde(default, rename = "_id", skip_serializing_if = "Option::is_none")]
    pub object_id: Option<WireId>,
    #[serde(default, rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<WireId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<WireSender>,
    #[serde(default, alias = "recipientId", skip_serializing_if = "Option::is_none")]
    pub recipient: Option<WireSender>,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl WireMessageRecord {
    /// First usable id among `messageId`, `_id` and `id`.
    pub fn record_id(&self) -> Option<MessageId> {
        [&self.message_id, &self.object_id, &self.id]
            .into_iter()
            .flatten()
            .find_map(|id| id.clone().into_string())
            .map(MessageId)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub messages: Vec<WireMessageRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
    pub recipient: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMessageResponse {
    #[serde(default)]
    pub data: Option<WireMessageRecord>,
}

/// Frames the client writes to the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientFrame {
    Authenticate {
        token: String,
    },
    Register {
        user_id: UserId,
    },
    SendMessage {
        message: String,
        recipient_id: UserId,
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
    MessageRead {
        message_id: MessageId,
    },
}

impl ClientFrame {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Register { .. } => "register",
            Self::SendMessage { .. } => "send_message",
            Self::MessageRead { .. } => "message_read",
        }
    }
}

/// Frames the backend pushes over the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerFrame {
    Authenticated {
        #[serde(default)]
        user_id: Option<UserId>,
    },
    Unauthorized {
        #[serde(default)]
        reason: Option<String>,
    },
    ReceiveMessage(WireMessageRecord),
    MessageStatusUpdated {
        message_id: WireId,
        status: String,
    },
    Error {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
