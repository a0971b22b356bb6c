use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use confab_types::api::{
    Claims, ConversationResponse, ConversationSummary, PartitionedMessages,
    StartConversationRequest,
};

use crate::auth::AppState;
use crate::blocking;
use crate::error::{ApiError, ApiResult};

/// Start-or-get the unique conversation between the caller and another
/// phone. Lazily created on first contact; repeated calls converge on the
/// same conversation id regardless of which side asks.
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> ApiResult<impl IntoResponse> {
    let other_phone = req.other_phone.trim().to_string();
    if other_phone.is_empty() {
        return Err(ApiError::Validation("other_phone is required".into()));
    }
    if other_phone == claims.phone {
        return Err(ApiError::Validation(
            "cannot start a conversation with yourself".into(),
        ));
    }

    let db = state.db.clone();
    let caller_phone = claims.phone.clone();
    let (response, created) = blocking(move || {
        let caller = db
            .get_user_by_phone(&caller_phone)?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;
        let other = db
            .get_user_by_phone(&other_phone)?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;

        let (row, created) = db.resolve_conversation(&caller.id, &other.id)?;
        let participant_ids = participant_pair(&db, &row.id)?;
        let conversation = row.into_conversation(participant_ids)?;

        Ok((
            ConversationResponse {
                id: conversation.id,
                participant_ids: conversation.participant_ids,
                created_at: conversation.created_at,
            },
            created,
        ))
    })
    .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

/// The caller's conversation list: peer projection plus unread count per
/// conversation.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let caller_phone = claims.phone.clone();
    let summaries = blocking(move || {
        let caller = db
            .get_user_by_phone(&caller_phone)?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;

        let mut summaries = Vec::new();
        for (row, peer_id) in db.conversations_for_user(&caller.id)? {
            let Some(peer_row) = db.get_user_by_id(&peer_id)? else {
                tracing::warn!("conversation {} references missing peer {}", row.id, peer_id);
                continue;
            };
            let unread_count = db.unread_count(&row.id, &caller.id)?;
            let created_at = confab_db::models::parse_timestamp(&row.created_at)?;
            summaries.push(ConversationSummary {
                id: row.id.parse::<Uuid>().map_err(anyhow::Error::from)?,
                peer: peer_row.into_user()?,
                unread_count,
                created_at,
            });
        }
        Ok(summaries)
    })
    .await?;

    Ok(Json(summaries))
}

/// A conversation's history, split into messages the caller sent and
/// messages the other side sent, both in ledger order.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let caller_phone = claims.phone.clone();
    let partitioned = blocking(move || {
        if db.get_conversation(&conversation_id.to_string())?.is_none() {
            return Err(ApiError::NotFound("conversation not found".into()));
        }

        let rows = db.messages_for_conversation(&conversation_id.to_string())?;
        let mut sent_by_me = Vec::new();
        let mut sent_by_others = Vec::new();
        for row in rows {
            let mine = row.sender_phone == caller_phone;
            let message = row.into_message()?;
            if mine {
                sent_by_me.push(message);
            } else {
                sent_by_others.push(message);
            }
        }
        Ok(PartitionedMessages {
            sent_by_me,
            sent_by_others,
        })
    })
    .await?;

    Ok(Json(partitioned))
}

pub(crate) fn participant_pair(
    db: &confab_db::Database,
    conversation_id: &str,
) -> Result<[Uuid; 2], ApiError> {
    let ids = db.participants(conversation_id)?;
    if ids.len() != 2 {
        return Err(ApiError::Database(anyhow::anyhow!(
            "conversation {} has {} participants",
            conversation_id,
            ids.len()
        )));
    }
    let a = ids[0].parse::<Uuid>().map_err(anyhow::Error::from)?;
    let b = ids[1].parse::<Uuid>().map_err(anyhow::Error::from)?;
    Ok([a, b])
}
