//! Wire types for the subscription protocol.
//!
//! Every frame is a JSON text message tagged by `type`.
//!
//! Client to server:
//!
//! ```json
//! {"type": "subscribe", "channel": "conversations"}
//! {"type": "unsubscribe", "channel": "conversation:6e45a55c"}
//! ```
//!
//! Server to client (payload under `data`):
//!
//! ```json
//! {"type": "connection", "data": {"clientId": "…"}}
//! {"type": "subscription_confirmed", "data": {"channel": "conversations"}}
//! {"type": "conversation_state_change", "data": {"conversationId": "…", "previousState": "idle", "newState": "assistant_working", "context": {…}, "timestamp": "…"}}
//! ```

use std::fmt;

use chatpulse_monitor::types::StateChangeEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel carrying every conversation's state changes.
pub const ALL_CONVERSATIONS_CHANNEL: &str = "conversations";

/// Prefix of per-conversation channels (`conversation:<id>`).
pub const CONVERSATION_CHANNEL_PREFIX: &str = "conversation:";

/// Per-conversation channel name.
#[must_use]
pub fn conversation_channel(conversation_id: &str) -> String {
    format!("{CONVERSATION_CHANNEL_PREFIX}{conversation_id}")
}

/// Returns `true` for channel names clients may subscribe to.
#[must_use]
pub fn is_valid_channel(channel: &str) -> bool {
    channel == ALL_CONVERSATIONS_CHANNEL
        || channel
            .strip_prefix(CONVERSATION_CHANNEL_PREFIX)
            .is_some_and(|id| !id.is_empty())
}

/// Identifier assigned to each live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Messages pushed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Sent once, immediately after the connection is accepted.
    Connection { client_id: ConnectionId },

    SubscriptionConfirmed { channel: String },

    UnsubscriptionConfirmed { channel: String },

    ConversationStateChange(StateChangeEvent),

    /// A control message could not be understood.
    Error { message: String },
}

/// Control messages accepted from clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
}
