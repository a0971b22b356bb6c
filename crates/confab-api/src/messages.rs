use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use confab_types::api::{Claims, MarkAllReadResponse, SendMessageRequest, UnreadCountResponse};
use confab_types::events::{ServerEvent, Topic};
use confab_types::models::Message;

use crate::auth::AppState;
use crate::blocking;
use crate::error::{ApiError, ApiResult};

/// Append a message to a conversation's ledger and fan it out.
///
/// The stored record is the source of truth: it is written with
/// `delivered=true, read=false` before anything is published, so a client
/// that misses the broadcast still finds the message on its next fetch.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.content.trim().is_empty() {
        return Err(ApiError::Validation("message content is required".into()));
    }

    let db = state.db.clone();
    let sender_phone = claims.phone.clone();
    let content = req.content.clone();
    let message = blocking(move || {
        if db.get_conversation(&conversation_id.to_string())?.is_none() {
            return Err(ApiError::NotFound("conversation not found".into()));
        }
        let sender = db
            .get_user_by_phone(&sender_phone)?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;

        let message_id = Uuid::new_v4();
        let now = Utc::now();
        db.insert_message(
            &message_id.to_string(),
            &conversation_id.to_string(),
            &sender.id,
            &content,
            &now.to_rfc3339(),
        )?;

        Ok(Message {
            id: message_id,
            conversation_id,
            sender_id: sender.id.parse::<Uuid>().map_err(anyhow::Error::from)?,
            sender_phone,
            content,
            delivered: true,
            read: false,
            created_at: now,
        })
    })
    .await?;

    state.dispatcher.publish(
        Topic::Conversation(conversation_id),
        ServerEvent::MessageCreate {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender_phone: message.sender_phone.clone(),
            content: message.content.clone(),
            delivered: message.delivered,
            read: message.read,
            timestamp: message.created_at,
        },
    );

    Ok((StatusCode::CREATED, Json(message)))
}

/// Idempotent read transition; re-marking a read message is a no-op.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let message = blocking(move || {
        let row = db
            .mark_read(&message_id.to_string())?
            .ok_or_else(|| ApiError::NotFound("message not found".into()))?;
        Ok(row.into_message()?)
    })
    .await?;

    state.dispatcher.publish(
        Topic::Conversation(message.conversation_id),
        ServerEvent::MessageRead {
            conversation_id: message.conversation_id,
            message_id: message.id,
            reader_id: claims.sub,
        },
    );

    Ok(Json(message))
}

/// Idempotent delivered transition. REST-only acknowledgment path; nothing
/// is fanned out.
pub async fn mark_delivered(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let message = blocking(move || {
        let row = db
            .mark_delivered(&message_id.to_string())?
            .ok_or_else(|| ApiError::NotFound("message not found".into()))?;
        Ok(row.into_message()?)
    })
    .await?;

    Ok(Json(message))
}

/// Best-effort bulk sweep: everything in the conversation the caller has
/// not read transitions to read, one independent update per message.
pub async fn mark_all_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let reader_phone = claims.phone.clone();
    let marked = blocking(move || {
        if db.get_conversation(&conversation_id.to_string())?.is_none() {
            return Err(ApiError::NotFound("conversation not found".into()));
        }
        let reader = db
            .get_user_by_phone(&reader_phone)?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;

        let mut marked = Vec::new();
        for id in db.mark_all_read(&conversation_id.to_string(), &reader.id)? {
            match id.parse::<Uuid>() {
                Ok(id) => marked.push(id),
                Err(e) => tracing::warn!("corrupt message id '{}': {}", id, e),
            }
        }
        Ok(marked)
    })
    .await?;

    for message_id in &marked {
        state.dispatcher.publish(
            Topic::Conversation(conversation_id),
            ServerEvent::MessageRead {
                conversation_id,
                message_id: *message_id,
                reader_id: claims.sub,
            },
        );
    }

    Ok(Json(MarkAllReadResponse {
        conversation_id,
        marked_read: marked,
    }))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let reader_phone = claims.phone.clone();
    let count = blocking(move || {
        if db.get_conversation(&conversation_id.to_string())?.is_none() {
            return Err(ApiError::NotFound("conversation not found".into()));
        }
        let reader = db
            .get_user_by_phone(&reader_phone)?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;
        Ok(db.unread_count(&conversation_id.to_string(), &reader.id)?)
    })
    .await?;

    Ok(Json(UnreadCountResponse {
        conversation_id,
        unread_count: count,
    }))
}

/// Every unread message addressed to the caller, across all conversations.
pub async fn unread_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let reader_phone = claims.phone.clone();
    let messages = blocking(move || {
        let reader = db
            .get_user_by_phone(&reader_phone)?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;

        let mut messages = Vec::new();
        for row in db.unread_messages_for(&reader.id)? {
            messages.push(row.into_message()?);
        }
        Ok(messages)
    })
    .await?;

    Ok(Json(messages))
}

/// Hard delete — the record is gone, no tombstone.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let removed = blocking(move || Ok(db.delete_message(&message_id.to_string())?)).await?;

    if !removed {
        return Err(ApiError::NotFound("message not found".into()));
    }

    Ok(StatusCode::NO_CONTENT)
}
