use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("no authenticated session available")]
    NoSession,
    #[error("message history unavailable: {reason}")]
    HistoryUnavailable { reason: String },
    #[error("failed to send message: {reason}")]
    SendFailed { reason: String },
    #[error("channel authentication failed: {reason}")]
    ChannelAuth { reason: String },
    #[error("channel transport error: {0}")]
    Transport(String),
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("channel is not authenticated; sending is disabled")]
    ChannelNotReady,
    #[error("conversation session is closed")]
    SessionClosed,
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ChatError {
    /// Whether the conversation view can keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::NoSession | Self::Config(_))
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
