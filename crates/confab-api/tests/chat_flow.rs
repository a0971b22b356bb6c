//! End-to-end request/response tests: the routers are assembled exactly as
//! the server binary assembles them and driven with `tower::ServiceExt`.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    middleware,
    routing::{delete, get, post, put},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use confab_api::auth::{self, AppState, AppStateInner, create_token};
use confab_api::codes::{CodePurpose, CodeStore, LogCodeSender};
use confab_api::middleware::require_auth;
use confab_api::{conversations, messages, presence, users};
use confab_db::Database;
use confab_gateway::dispatcher::Dispatcher;

/// Must match the middleware's fallback when CONFAB_JWT_SECRET is unset.
const SECRET: &str = "dev-secret-change-me";

fn test_state() -> AppState {
    Arc::new(AppStateInner {
        db: Arc::new(Database::open_in_memory().unwrap()),
        dispatcher: Dispatcher::new(),
        jwt_secret: SECRET.into(),
        codes: CodeStore::new(),
        code_sender: Arc::new(LogCodeSender),
    })
}

fn app(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/code", post(auth::request_code))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/conversations", post(conversations::start_conversation))
        .route("/conversations", get(conversations::list_conversations))
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::get_messages),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            post(messages::send_message),
        )
        .route(
            "/conversations/{conversation_id}/read",
            put(messages::mark_all_read),
        )
        .route(
            "/conversations/{conversation_id}/unread-count",
            get(messages::unread_count),
        )
        .route("/messages/unread", get(messages::unread_messages))
        .route("/messages/{message_id}/read", put(messages::mark_read))
        .route(
            "/messages/{message_id}/delivered",
            put(messages::mark_delivered),
        )
        .route("/messages/{message_id}", delete(messages::delete_message))
        .route("/presence/heartbeat", post(presence::heartbeat))
        .route("/users/find", get(users::find_user))
        .layer(middleware::from_fn(require_auth))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}

fn seed_user(state: &AppState, phone: &str) -> Uuid {
    let id = Uuid::new_v4();
    state.db.create_user(&id.to_string(), phone, phone).unwrap();
    id
}

fn token_for(user_id: Uuid, phone: &str) -> String {
    create_token(SECRET, user_id, phone).unwrap()
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn resolve_converges_from_both_sides() {
    let state = test_state();
    let app = app(state.clone());
    let a = token_for(seed_user(&state, "+100"), "+100");
    let b = token_for(seed_user(&state, "+200"), "+200");

    let (status, first) = call(
        &app,
        "POST",
        "/conversations",
        Some(&a),
        Some(json!({"other_phone": "+200"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, second) = call(
        &app,
        "POST",
        "/conversations",
        Some(&b),
        Some(json!({"other_phone": "+100"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["id"], second["id"]);
}

#[tokio::test]
async fn send_read_unread_scenario() {
    let state = test_state();
    let app = app(state.clone());
    let a = token_for(seed_user(&state, "+100"), "+100");
    let b = token_for(seed_user(&state, "+200"), "+200");

    let (_, conversation) = call(
        &app,
        "POST",
        "/conversations",
        Some(&a),
        Some(json!({"other_phone": "+200"})),
    )
    .await;
    let conversation_id = conversation["id"].as_str().unwrap().to_string();

    // A sends "hi" — stored delivered, unread.
    let (status, message) = call(
        &app,
        "POST",
        &format!("/conversations/{}/messages", conversation_id),
        Some(&a),
        Some(json!({"content": "hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["content"], "hi");
    assert_eq!(message["delivered"], true);
    assert_eq!(message["read"], false);
    let message_id = message["id"].as_str().unwrap().to_string();

    // Unread for B is 1; for the sender it is 0.
    let (_, count) = call(
        &app,
        "GET",
        &format!("/conversations/{}/unread-count", conversation_id),
        Some(&b),
        None,
    )
    .await;
    assert_eq!(count["unread_count"], 1);
    let (_, count) = call(
        &app,
        "GET",
        &format!("/conversations/{}/unread-count", conversation_id),
        Some(&a),
        None,
    )
    .await;
    assert_eq!(count["unread_count"], 0);

    // B sees it under sent_by_others; A under sent_by_me.
    let (_, history) = call(
        &app,
        "GET",
        &format!("/conversations/{}/messages", conversation_id),
        Some(&b),
        None,
    )
    .await;
    assert_eq!(history["sent_by_others"].as_array().unwrap().len(), 1);
    assert!(history["sent_by_me"].as_array().unwrap().is_empty());

    // B acknowledges the read.
    let (status, updated) = call(
        &app,
        "PUT",
        &format!("/messages/{}/read", message_id),
        Some(&b),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["read"], true);
    assert_eq!(updated["delivered"], true);

    // Marking twice is a no-op, not an error.
    let (status, again) = call(
        &app,
        "PUT",
        &format!("/messages/{}/read", message_id),
        Some(&b),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["read"], true);

    let (_, count) = call(
        &app,
        "GET",
        &format!("/conversations/{}/unread-count", conversation_id),
        Some(&b),
        None,
    )
    .await;
    assert_eq!(count["unread_count"], 0);
}

#[tokio::test]
async fn mark_all_read_sweeps_only_the_callers_unread() {
    let state = test_state();
    let app = app(state.clone());
    let a = token_for(seed_user(&state, "+100"), "+100");
    let b = token_for(seed_user(&state, "+200"), "+200");

    let (_, conversation) = call(
        &app,
        "POST",
        "/conversations",
        Some(&a),
        Some(json!({"other_phone": "+200"})),
    )
    .await;
    let conversation_id = conversation["id"].as_str().unwrap().to_string();

    for i in 0..3 {
        call(
            &app,
            "POST",
            &format!("/conversations/{}/messages", conversation_id),
            Some(&a),
            Some(json!({"content": format!("msg {}", i)})),
        )
        .await;
    }
    // B's own message must survive the sweep untouched.
    call(
        &app,
        "POST",
        &format!("/conversations/{}/messages", conversation_id),
        Some(&b),
        Some(json!({"content": "mine"})),
    )
    .await;

    let (status, swept) = call(
        &app,
        "PUT",
        &format!("/conversations/{}/read", conversation_id),
        Some(&b),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(swept["marked_read"].as_array().unwrap().len(), 3);

    let (_, count) = call(
        &app,
        "GET",
        &format!("/conversations/{}/unread-count", conversation_id),
        Some(&b),
        None,
    )
    .await;
    assert_eq!(count["unread_count"], 0);

    // A still has B's message unread.
    let (_, unread) = call(&app, "GET", "/messages/unread", Some(&a), None).await;
    assert_eq!(unread.as_array().unwrap().len(), 1);
    assert_eq!(unread[0]["content"], "mine");

    // Sweeping again finds nothing.
    let (_, swept) = call(
        &app,
        "PUT",
        &format!("/conversations/{}/read", conversation_id),
        Some(&b),
        None,
    )
    .await;
    assert!(swept["marked_read"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn delete_is_permanent() {
    let state = test_state();
    let app = app(state.clone());
    let a = token_for(seed_user(&state, "+100"), "+100");
    seed_user(&state, "+200");

    let (_, conversation) = call(
        &app,
        "POST",
        "/conversations",
        Some(&a),
        Some(json!({"other_phone": "+200"})),
    )
    .await;
    let conversation_id = conversation["id"].as_str().unwrap().to_string();

    let (_, message) = call(
        &app,
        "POST",
        &format!("/conversations/{}/messages", conversation_id),
        Some(&a),
        Some(json!({"content": "oops"})),
    )
    .await;
    let message_id = message["id"].as_str().unwrap().to_string();

    let (status, _) = call(
        &app,
        "DELETE",
        &format!("/messages/{}", message_id),
        Some(&a),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(
        &app,
        "DELETE",
        &format!("/messages/{}", message_id),
        Some(&a),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn protected_routes_reject_missing_or_garbage_tokens() {
    let state = test_state();
    let app = app(state);

    let (status, body) = call(&app, "GET", "/conversations", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "unauthenticated");

    let (status, _) = call(&app, "GET", "/conversations", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn validation_failures_are_kind_tagged() {
    let state = test_state();
    let app = app(state.clone());
    let a = token_for(seed_user(&state, "+100"), "+100");

    // Self-conversation
    let (status, body) = call(
        &app,
        "POST",
        "/conversations",
        Some(&a),
        Some(json!({"other_phone": "+100"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");

    // Unknown peer
    let (status, body) = call(
        &app,
        "POST",
        "/conversations",
        Some(&a),
        Some(json!({"other_phone": "+999"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");

    // Empty message content
    let (_, conversation) = call(
        &app,
        "POST",
        "/conversations",
        Some(&a),
        Some(json!({"other_phone": "+200"})),
    )
    .await;
    // +200 does not exist yet, so the conversation wasn't created above.
    assert_eq!(conversation["error"]["kind"], "not_found");

    seed_user(&state, "+200");
    let (_, conversation) = call(
        &app,
        "POST",
        "/conversations",
        Some(&a),
        Some(json!({"other_phone": "+200"})),
    )
    .await;
    let conversation_id = conversation["id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        "POST",
        &format!("/conversations/{}/messages", conversation_id),
        Some(&a),
        Some(json!({"content": "   "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
}

#[tokio::test]
async fn code_login_issues_a_working_token() {
    let state = test_state();
    let app = app(state.clone());

    // First contact creates the identity record.
    let (status, _) = call(
        &app,
        "POST",
        "/auth/code",
        None,
        Some(json!({"phone": "+300", "display_name": "Cleo"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(state.db.get_user_by_phone("+300").unwrap().is_some());

    // The delivered code is opaque to the test; issue a fresh known one.
    let code = state.codes.issue("+300", CodePurpose::Login);
    let (status, login) = call(
        &app,
        "POST",
        "/auth/login",
        None,
        Some(json!({"phone": "+300", "code": code})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let token = login["token"].as_str().unwrap().to_string();
    let (status, heartbeat) = call(&app, "POST", "/presence/heartbeat", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(heartbeat["online"], true);

    // Login marked the user online and the lookup endpoint reflects it.
    let (status, user) = call(&app, "GET", "/users/find?phone=%2B300", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["online"], true);
    assert_eq!(user["display_name"], "Cleo");
}

#[tokio::test]
async fn expired_or_wrong_codes_do_not_log_in() {
    let state = test_state();
    let app = app(state.clone());
    seed_user(&state, "+300");

    state.codes.insert_with_expiry(
        "+300",
        CodePurpose::Login,
        "123456".into(),
        chrono::Utc::now() - chrono::Duration::seconds(1),
    );
    let (status, body) = call(
        &app,
        "POST",
        "/auth/login",
        None,
        Some(json!({"phone": "+300", "code": "123456"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "unauthenticated");

    let code = state.codes.issue("+300", CodePurpose::Login);
    let wrong = if code == "000000" { "000001" } else { "000000" };
    let (status, _) = call(
        &app,
        "POST",
        "/auth/login",
        None,
        Some(json!({"phone": "+300", "code": wrong})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn conversation_list_carries_peer_and_unread_count() {
    let state = test_state();
    let app = app(state.clone());
    let a = token_for(seed_user(&state, "+100"), "+100");
    let b = token_for(seed_user(&state, "+200"), "+200");

    let (_, conversation) = call(
        &app,
        "POST",
        "/conversations",
        Some(&a),
        Some(json!({"other_phone": "+200"})),
    )
    .await;
    let conversation_id = conversation["id"].as_str().unwrap().to_string();

    call(
        &app,
        "POST",
        &format!("/conversations/{}/messages", conversation_id),
        Some(&a),
        Some(json!({"content": "hello"})),
    )
    .await;

    let (status, list) = call(&app, "GET", "/conversations", Some(&b), None).await;
    assert_eq!(status, StatusCode::OK);
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["peer"]["phone"], "+100");
    assert_eq!(list[0]["unread_count"], 1);

    // The sender's own list shows nothing unread.
    let (_, list) = call(&app, "GET", "/conversations", Some(&a), None).await;
    assert_eq!(list[0]["unread_count"], 0);
}
