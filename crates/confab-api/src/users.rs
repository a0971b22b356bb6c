use axum::{Json, extract::{Query, State}, response::IntoResponse};
use serde::Deserialize;

use crate::auth::AppState;
use crate::blocking;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct FindUserQuery {
    pub phone: String,
}

/// Identity lookup by phone number, used when starting a conversation with
/// someone new. Returns the projection only — no profile internals.
pub async fn find_user(
    State(state): State<AppState>,
    Query(query): Query<FindUserQuery>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let phone = query.phone.trim().to_string();
    if phone.is_empty() {
        return Err(ApiError::Validation("phone is required".into()));
    }

    let user = blocking(move || {
        let row = db
            .get_user_by_phone(&phone)?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;
        Ok(row.into_user()?)
    })
    .await?;

    Ok(Json(user))
}
