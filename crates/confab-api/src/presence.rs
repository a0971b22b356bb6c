use axum::{Extension, Json, extract::State, response::IntoResponse};

use confab_types::api::{Claims, HeartbeatResponse};
use confab_types::events::{ServerEvent, Topic};

use crate::auth::AppState;
use crate::blocking;
use crate::error::{ApiError, ApiResult};

/// Periodic client ping: refreshes `last_seen` and keeps the user online.
/// Identity comes from the bearer middleware — no re-authentication here.
pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();
    let record = blocking(move || {
        if !db.touch_presence(&user_id, true)? {
            return Err(ApiError::NotFound("user not found".into()));
        }
        let row = db
            .get_user_by_id(&user_id)?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;
        Ok(row.into_presence()?)
    })
    .await?;

    state.dispatcher.publish(
        Topic::UserStatus(claims.sub),
        ServerEvent::PresenceUpdate {
            user_id: claims.sub,
            phone: claims.phone.clone(),
            online: record.online,
            last_seen: record.last_seen,
        },
    );

    Ok(Json(HeartbeatResponse {
        online: record.online,
        last_seen: record.last_seen,
    }))
}
