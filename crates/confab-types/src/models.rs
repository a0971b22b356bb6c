use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity Store projection. The chat core only ever writes `online` and
/// `last_seen`; everything else belongs to the profile layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub phone: String,
    pub display_name: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Two-party conversation. Participants are referenced by id only — no
/// back-pointers, so the type serializes without cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participant_ids: [Uuid; 2],
    pub created_at: DateTime<Utc>,
}

/// A stored message. `read == true` always implies `delivered == true`;
/// both flags only ever move forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_phone: String,
    pub content: String,
    pub delivered: bool,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Transient presence state; shadows `users.online` / `users.last_seen`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}
