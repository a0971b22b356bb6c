use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, User};

// -- JWT Claims --

/// JWT claims shared between confab-api (REST middleware) and the gateway
/// upgrade handler. Canonical definition lives here in confab-types to
/// eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub phone: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestCodeRequest {
    pub phone: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RequestCodeResponse {
    pub sent: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub phone: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub phone: String,
    pub token: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartConversationRequest {
    pub other_phone: String,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub participant_ids: [Uuid; 2],
    pub created_at: DateTime<Utc>,
}

/// One row of the caller's conversation list: the conversation, the peer's
/// identity projection, and how many messages the caller has not read yet.
#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub peer: User,
    pub unread_count: u64,
    pub created_at: DateTime<Utc>,
}

/// A conversation's history partitioned relative to the caller.
#[derive(Debug, Serialize)]
pub struct PartitionedMessages {
    pub sent_by_me: Vec<Message>,
    pub sent_by_others: Vec<Message>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub conversation_id: Uuid,
    pub unread_count: u64,
}

#[derive(Debug, Serialize)]
pub struct MarkAllReadResponse {
    pub conversation_id: Uuid,
    pub marked_read: Vec<Uuid>,
}

// -- Presence --

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}
