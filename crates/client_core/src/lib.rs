pub mod channel;
pub mod config;
pub mod credentials;
pub mod dates;
pub mod error;
pub mod history;
pub mod reconciler;
pub mod rest;
pub mod session;
pub mod transport;
pub mod types;

use shared::domain::{MessageId, UserId};

pub use channel::{ChannelEvent, ChannelHandler, ChannelManager, OutboundMessage};
pub use config::{load_settings, load_settings_from, ClientSettings};
pub use credentials::{
    AuthSession, BearerToken, CredentialProvider, MissingCredentialProvider, SessionStore,
};
pub use dates::{date_key, day_label, group_by_day, time_label, DayGroup};
pub use error::{ChatError, ChatResult};
pub use reconciler::{MergeOutcome, Reconciler, SendReceipt};
pub use rest::{ChatApi, HttpChatApi};
pub use session::{ConversationController, ConversationSession, SessionContext};
pub use transport::{ChannelConnector, ChannelLink, TransportEvent, WebSocketConnector};
pub use types::{ChannelState, Message, SessionPhase};

/// Notifications for the presentation layer. The message sequence itself
/// is observed through [`ConversationSession::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    SessionPhaseChanged {
        peer: UserId,
        phase: SessionPhase,
    },
    ChannelStateChanged {
        peer: UserId,
        state: ChannelState,
    },
    ReadReceiptSent {
        peer: UserId,
        message_id: MessageId,
    },
    /// A recoverable failure worth showing as a transient notice.
    Notice {
        peer: UserId,
        error: ChatError,
    },
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
