use std::sync::Arc;

use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

use confab_db::Database;
use confab_gateway::dispatcher::Dispatcher;
use confab_types::api::{
    Claims, LoginRequest, LoginResponse, RequestCodeRequest, RequestCodeResponse,
};
use confab_types::events::{ServerEvent, Topic};

use crate::blocking;
use crate::codes::{CodePurpose, CodeSender, CodeStore};
use crate::error::{ApiError, ApiResult};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
    pub codes: CodeStore,
    pub code_sender: Arc<dyn CodeSender>,
}

/// Request a one-time login code. First contact creates the identity
/// record; the code itself goes out through the delivery collaborator.
pub async fn request_code(
    State(state): State<AppState>,
    Json(req): Json<RequestCodeRequest>,
) -> ApiResult<impl IntoResponse> {
    let phone = req.phone.trim().to_string();
    if phone.is_empty() {
        return Err(ApiError::Validation("phone is required".into()));
    }

    let db = state.db.clone();
    let display_name = req.display_name.clone().unwrap_or_else(|| phone.clone());
    let lookup_phone = phone.clone();
    let purpose = blocking(move || {
        if db.phone_exists(&lookup_phone)? {
            return Ok(CodePurpose::Login);
        }
        db.create_user(&Uuid::new_v4().to_string(), &lookup_phone, &display_name)?;
        Ok(CodePurpose::Registration)
    })
    .await?;

    let code = state.codes.issue(&phone, purpose);
    state.code_sender.send_code(&phone, &code, purpose);

    Ok(Json(RequestCodeResponse {
        sent: true,
        message: format!("{} code sent", purpose.label()),
    }))
}

/// Verify a one-time code and mint a bearer token. A successful login is an
/// explicit presence write: the user goes online and their status topic
/// hears about it.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let phone = req.phone.trim().to_string();
    if phone.is_empty() || req.code.trim().is_empty() {
        return Err(ApiError::Validation("phone and code are required".into()));
    }

    // Codes are issued under the purpose that matched the subject at issue
    // time; either purpose proves control of the phone.
    let verified = state.codes.verify(&phone, CodePurpose::Login, &req.code)
        || state
            .codes
            .verify(&phone, CodePurpose::Registration, &req.code);
    if !verified {
        return Err(ApiError::Unauthenticated);
    }

    let db = state.db.clone();
    let lookup_phone = phone.clone();
    let user = blocking(move || {
        let row = db
            .get_user_by_phone(&lookup_phone)?
            .ok_or_else(|| ApiError::NotFound("user not found".into()))?;
        db.touch_presence(&row.id, true)?;
        Ok(row.into_user()?)
    })
    .await?;

    state.dispatcher.publish(
        Topic::UserStatus(user.id),
        ServerEvent::PresenceUpdate {
            user_id: user.id,
            phone: user.phone.clone(),
            online: true,
            last_seen: Some(chrono::Utc::now()),
        },
    );

    let token =
        create_token(&state.jwt_secret, user.id, &user.phone).map_err(ApiError::Database)?;

    Ok(Json(LoginResponse {
        user_id: user.id,
        phone: user.phone,
        token,
    }))
}

/// Explicit offline transition; stamps last-seen.
pub async fn logout(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();
    let known = blocking(move || Ok(db.touch_presence(&user_id, false)?)).await?;

    if !known {
        return Err(ApiError::NotFound("user not found".into()));
    }

    state.dispatcher.publish(
        Topic::UserStatus(claims.sub),
        ServerEvent::PresenceUpdate {
            user_id: claims.sub,
            phone: claims.phone.clone(),
            online: false,
            last_seen: Some(chrono::Utc::now()),
        },
    );

    Ok(StatusCode::NO_CONTENT)
}

pub fn create_token(secret: &str, user_id: Uuid, phone: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        phone: phone.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
