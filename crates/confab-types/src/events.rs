use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An addressable pub/sub topic. Sessions subscribe to topics; the
/// dispatcher delivers a published event to every session whose subscription
/// set contains the event's topic. Private error delivery bypasses topics
/// entirely and goes over the session's targeted channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Topic {
    /// `conversation/{id}` — message, read-receipt and typing traffic.
    Conversation(Uuid),
    /// `user/{id}/status` — presence transitions for one user.
    UserStatus(Uuid),
}

/// Events sent from the server to subscribed sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Connection is bound to an identity and ready for commands.
    Ready { user_id: Uuid, phone: String },

    /// A new message was appended to a conversation's ledger.
    MessageCreate {
        id: Uuid,
        conversation_id: Uuid,
        sender_id: Uuid,
        sender_phone: String,
        content: String,
        delivered: bool,
        read: bool,
        timestamp: DateTime<Utc>,
    },

    /// A message transitioned to read.
    MessageRead {
        conversation_id: Uuid,
        message_id: Uuid,
        reader_id: Uuid,
    },

    /// A participant started typing.
    TypingStart {
        conversation_id: Uuid,
        user_id: Uuid,
        phone: String,
    },

    /// A user came online or went offline.
    PresenceUpdate {
        user_id: Uuid,
        phone: String,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    },

    /// Command handling failed; delivered only to the acting session.
    Error { kind: String, message: String },
}

impl ServerEvent {
    /// The topic this event is published on. Events that return `None`
    /// (`Ready`, `Error`) are never broadcast — they only travel over a
    /// session's targeted channel.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            Self::MessageCreate { conversation_id, .. }
            | Self::MessageRead { conversation_id, .. }
            | Self::TypingStart { conversation_id, .. } => {
                Some(Topic::Conversation(*conversation_id))
            }
            Self::PresenceUpdate { user_id, .. } => Some(Topic::UserStatus(*user_id)),
            Self::Ready { .. } | Self::Error { .. } => None,
        }
    }
}

/// Commands sent from a client to the server over an established connection.
/// The connection's identity was bound once at upgrade time; commands carry
/// no credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Replace this session's subscription set. Conversation ids map to
    /// `conversation/{id}` topics, user ids to `user/{id}/status`.
    Subscribe {
        #[serde(default)]
        conversation_ids: Vec<Uuid>,
        #[serde(default)]
        user_ids: Vec<Uuid>,
    },

    /// Append a message to a conversation.
    SendMessage {
        conversation_id: Uuid,
        content: String,
    },

    /// Acknowledge a message as read.
    MarkRead {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    /// Indicate typing in a conversation.
    Typing { conversation_id: Uuid },

    /// Refresh presence without re-authenticating.
    Heartbeat,
}
