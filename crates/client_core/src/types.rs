use chrono::{DateTime, Utc};
use shared::domain::{MessageId, MessageStatus, UserId};

/// Canonical message entry of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub sender: UserId,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub provisional: bool,
    /// Id the entry was created under locally, kept after confirmation.
    pub client_id: Option<MessageId>,
}

impl Message {
    pub fn confirmed(
        id: MessageId,
        text: impl Into<String>,
        sender: UserId,
        timestamp: DateTime<Utc>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            sender,
            timestamp,
            status,
            provisional: false,
            client_id: None,
        }
    }

    pub fn provisional(
        local_id: MessageId,
        text: impl Into<String>,
        sender: UserId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: local_id.clone(),
            text: text.into(),
            sender,
            timestamp,
            status: MessageStatus::Sent,
            provisional: true,
            client_id: Some(local_id),
        }
    }

    /// Key a UI should use for this entry; stable across confirmation.
    pub fn render_key(&self) -> &MessageId {
        self.client_id.as_ref().unwrap_or(&self.id)
    }

    pub fn is_from(&self, user: &UserId) -> bool {
        &self.sender == user
    }
}

/// Lifecycle of the live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
}

/// Lifecycle of a conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Closed,
    Opening {
        history_loaded: bool,
        channel_ready: bool,
    },
    Active,
}

impl SessionPhase {
    pub fn opening() -> Self {
        Self::Opening {
            history_loaded: false,
            channel_ready: false,
        }
    }
}
