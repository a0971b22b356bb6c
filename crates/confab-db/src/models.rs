//! Database row types — these map directly to SQLite rows. Distinct from
//! the confab-types projections to keep the storage layer independent.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use confab_types::models::{Conversation, Message, PresenceRecord, User};
use uuid::Uuid;

pub struct UserRow {
    pub id: String,
    pub phone: String,
    pub display_name: String,
    pub online: bool,
    pub last_seen: Option<String>,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub pair_key: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_phone: String,
    pub content: String,
    pub delivered: bool,
    pub read: bool,
    pub created_at: String,
}

/// Parse a stored timestamp. Inserts write RFC 3339, but columns defaulted
/// by SQLite come back as "YYYY-MM-DD HH:MM:SS" without a timezone, so fall
/// back to parsing that as naive UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .with_context(|| format!("corrupt timestamp '{}'", raw))
}

impl UserRow {
    pub fn into_user(self) -> Result<User> {
        let last_seen = match self.last_seen {
            Some(raw) => Some(parse_timestamp(&raw)?),
            None => None,
        };
        Ok(User {
            id: self
                .id
                .parse::<Uuid>()
                .with_context(|| format!("corrupt user id '{}'", self.id))?,
            phone: self.phone,
            display_name: self.display_name,
            online: self.online,
            last_seen,
        })
    }

    pub fn into_presence(self) -> Result<PresenceRecord> {
        let user = self.into_user()?;
        Ok(PresenceRecord {
            user_id: user.id,
            online: user.online,
            last_seen: user.last_seen,
        })
    }
}

impl ConversationRow {
    pub fn into_conversation(self, participant_ids: [Uuid; 2]) -> Result<Conversation> {
        Ok(Conversation {
            id: self
                .id
                .parse::<Uuid>()
                .with_context(|| format!("corrupt conversation id '{}'", self.id))?,
            participant_ids,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: self
                .id
                .parse::<Uuid>()
                .with_context(|| format!("corrupt message id '{}'", self.id))?,
            conversation_id: self
                .conversation_id
                .parse::<Uuid>()
                .with_context(|| format!("corrupt conversation_id on message '{}'", self.id))?,
            sender_id: self
                .sender_id
                .parse::<Uuid>()
                .with_context(|| format!("corrupt sender_id on message '{}'", self.id))?,
            sender_phone: self.sender_phone,
            content: self.content,
            delivered: self.delivered,
            read: self.read,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}
