use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use confab_api::auth::{self, AppState, AppStateInner};
use confab_api::codes::{CODE_SWEEP_INTERVAL, CodeStore, LogCodeSender, run_code_sweeper};
use confab_api::middleware::require_auth;
use confab_api::{conversations, messages, presence, users};
use confab_gateway::connection::{self, authenticate_bearer};
use confab_gateway::dispatcher::Dispatcher;
use confab_gateway::presence::{STALE_AFTER_SECS, SWEEP_INTERVAL, run_presence_reaper};

/// Placeholder JWT secret that should never reach production.
const PLACEHOLDER_SECRET: &str = "dev-secret-change-me";

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    db: Arc<confab_db::Database>,
    jwt_secret: String,
    auth_permissive: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "confab=debug,confab_api=debug,confab_gateway=debug,confab_db=debug,tower_http=debug"
                    .into()
            }),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("CONFAB_JWT_SECRET").unwrap_or_else(|_| PLACEHOLDER_SECRET.into());
    if jwt_secret == PLACEHOLDER_SECRET {
        warn!("CONFAB_JWT_SECRET is unset or still the placeholder; do not run this in production");
    }
    let db_path = std::env::var("CONFAB_DB_PATH").unwrap_or_else(|_| "confab.db".into());
    let host = std::env::var("CONFAB_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("CONFAB_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let auth_permissive = std::env::var("CONFAB_AUTH_PERMISSIVE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if auth_permissive {
        warn!("permissive auth is enabled: failed gateway handshakes bind the guest identity");
    }

    // Init database
    let db = Arc::new(confab_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let codes = CodeStore::new();
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        dispatcher: dispatcher.clone(),
        jwt_secret: jwt_secret.clone(),
        codes: codes.clone(),
        code_sender: Arc::new(LogCodeSender),
    });

    let state = ServerState {
        dispatcher: dispatcher.clone(),
        db: db.clone(),
        jwt_secret: jwt_secret.clone(),
        auth_permissive,
    };

    // Background tasks: presence reaper + one-time-code eviction
    tokio::spawn(run_presence_reaper(
        db.clone(),
        dispatcher.clone(),
        SWEEP_INTERVAL,
        STALE_AFTER_SECS,
    ));
    tokio::spawn(run_code_sweeper(codes.clone(), CODE_SWEEP_INTERVAL));

    // Routes
    let public_routes = Router::new()
        .route("/auth/code", post(auth::request_code))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

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
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Confab server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Connection Auth Gate: the bearer credential is checked exactly once,
/// here, before the upgrade completes. Everything on the socket afterwards
/// inherits the bound identity.
async fn ws_upgrade(
    State(state): State<ServerState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(identity) = authenticate_bearer(auth_header, &state.jwt_secret, state.auth_permissive)
    else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.db, identity)
    })
    .into_response()
}
