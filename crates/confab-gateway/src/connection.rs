use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use confab_db::Database;
use confab_types::events::{ClientCommand, ServerEvent, Topic};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Identity bound to a connection by the auth gate at upgrade time.
/// Immutable for the connection's lifetime — commands carry no credentials
/// and there is no path back to an unauthenticated state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: Uuid,
    pub phone: String,
}

/// The labeled identity permissive mode binds on a failed handshake. Never
/// the identity from the rejected token, and it owns no user row, so it
/// cannot write presence or impersonate anyone.
pub const GUEST_PHONE: &str = "+00000000000";

pub fn guest_identity() -> SessionIdentity {
    SessionIdentity {
        user_id: Uuid::nil(),
        phone: GUEST_PHONE.to_string(),
    }
}

/// Connection Auth Gate: one bearer check at upgrade time.
///
/// Strict mode (the default) returns None on a missing or invalid token and
/// the caller rejects the upgrade with 401. Permissive mode is an explicit
/// dev configuration that binds the guest identity instead.
pub fn authenticate_bearer(
    header: Option<&str>,
    jwt_secret: &str,
    permissive: bool,
) -> Option<SessionIdentity> {
    use confab_types::api::Claims;
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let identity = header
        .and_then(|value| value.strip_prefix("Bearer "))
        .and_then(|token| {
            decode::<Claims>(
                token,
                &DecodingKey::from_secret(jwt_secret.as_bytes()),
                &Validation::default(),
            )
            .ok()
        })
        .map(|data| SessionIdentity {
            user_id: data.claims.sub,
            phone: data.claims.phone,
        });

    match identity {
        Some(identity) => Some(identity),
        None if permissive => {
            warn!("unauthenticated gateway connect bound to guest (permissive mode)");
            Some(guest_identity())
        }
        None => None,
    }
}

/// Handle a pre-authenticated WebSocket connection. The bearer token was
/// already validated at the HTTP upgrade layer, so we go straight to Ready
/// and the event loop.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    identity: SessionIdentity,
) {
    let (mut sender, receiver) = socket.split();

    info!(
        "{} ({}) connected to gateway",
        identity.phone, identity.user_id
    );

    let ready = ServerEvent::Ready {
        user_id: identity.user_id,
        phone: identity.phone.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Register the targeted channel before going online so nothing
    // addressed to this user races the handshake.
    let (conn_id, mut user_rx) = dispatcher.register_session(identity.user_id).await;

    // Send currently-online users so the client starts with a presence
    // snapshot; everything after this arrives as PresenceUpdate events.
    match db.online_users() {
        Ok(rows) => {
            for row in rows {
                let event = match snapshot_presence(row) {
                    Some(event) => event,
                    None => continue,
                };
                if sender
                    .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
        Err(e) => warn!("presence snapshot failed: {}", e),
    }

    // Now mark ourselves online (broadcasts on our status topic).
    go_online(&db, &dispatcher, &identity);

    let mut broadcast_rx = dispatcher.subscribe();
    let dispatcher_clone = dispatcher.clone();
    let db_clone = db.clone();

    // Per-connection topic subscriptions (shared between send and recv tasks).
    let subscriptions: Arc<std::sync::RwLock<HashSet<Topic>>> =
        Arc::new(std::sync::RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward topic traffic + targeted events -> client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let published = match result {
                        Ok(published) => published,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    {
                        let subs = send_subscriptions.read()
                            .expect("subscription lock poisoned");
                        if !subs.contains(&published.topic) {
                            continue;
                        }
                    }

                    let text = serde_json::to_string(&published.event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };

                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(
                                "Heartbeat timeout (missed {} pongs), dropping connection",
                                missed_heartbeats
                            );
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client.
    let identity_recv = identity.clone();
    let recv_subscriptions = subscriptions.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut receiver = receiver;
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(
                            &dispatcher_clone,
                            &db_clone,
                            &identity_recv,
                            cmd,
                            &recv_subscriptions,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            identity_recv.phone,
                            identity_recv.user_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                        send_error(
                            &dispatcher_clone,
                            identity_recv.user_id,
                            "validation",
                            "malformed command frame",
                        )
                        .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Only the connection that still owns the session drives the offline
    // transition; a reconnect that displaced us keeps the user online.
    if dispatcher.unregister_session(identity.user_id, conn_id).await {
        go_offline(&db, &dispatcher, &identity);
    }
    info!(
        "{} ({}) disconnected from gateway",
        identity.phone, identity.user_id
    );
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Database,
    identity: &SessionIdentity,
    cmd: ClientCommand,
    subscriptions: &Arc<std::sync::RwLock<HashSet<Topic>>>,
) {
    match cmd {
        ClientCommand::Subscribe {
            conversation_ids,
            user_ids,
        } => {
            info!(
                "{} ({}) subscribing to {} conversations, {} status feeds",
                identity.phone,
                identity.user_id,
                conversation_ids.len(),
                user_ids.len()
            );
            let topics: HashSet<Topic> = conversation_ids
                .into_iter()
                .map(Topic::Conversation)
                .chain(user_ids.into_iter().map(Topic::UserStatus))
                .collect();
            let mut subs = subscriptions.write().expect("subscription lock poisoned");
            *subs = topics;
        }

        ClientCommand::SendMessage {
            conversation_id,
            content,
        } => {
            if content.trim().is_empty() {
                send_error(dispatcher, identity.user_id, "validation", "empty message content")
                    .await;
                return;
            }
            match append_message(db, identity, conversation_id, &content) {
                Ok(event) => dispatcher.publish(Topic::Conversation(conversation_id), event),
                Err(CommandError::NotFound(message)) => {
                    send_error(dispatcher, identity.user_id, "not_found", &message).await;
                }
                Err(CommandError::Internal(e)) => {
                    warn!("send failed for {}: {}", identity.phone, e);
                    send_error(dispatcher, identity.user_id, "internal", "could not send message")
                        .await;
                }
            }
        }

        ClientCommand::MarkRead {
            conversation_id,
            message_id,
        } => match db.mark_read(&message_id.to_string()) {
            Ok(Some(row)) => {
                // Trust the ledger, not the client, for where this lands.
                let conversation_id = row
                    .conversation_id
                    .parse::<Uuid>()
                    .unwrap_or(conversation_id);
                dispatcher.publish(
                    Topic::Conversation(conversation_id),
                    ServerEvent::MessageRead {
                        conversation_id,
                        message_id,
                        reader_id: identity.user_id,
                    },
                );
            }
            Ok(None) => {
                send_error(dispatcher, identity.user_id, "not_found", "message not found").await;
            }
            Err(e) => {
                warn!("mark_read failed for {}: {}", identity.phone, e);
                send_error(dispatcher, identity.user_id, "internal", "could not mark read").await;
            }
        },

        ClientCommand::Typing { conversation_id } => {
            dispatcher.publish(
                Topic::Conversation(conversation_id),
                ServerEvent::TypingStart {
                    conversation_id,
                    user_id: identity.user_id,
                    phone: identity.phone.clone(),
                },
            );
        }

        ClientCommand::Heartbeat => {
            // Refresh presence on the already-bound identity; no re-auth.
            go_online(db, dispatcher, identity);
        }
    }
}

enum CommandError {
    NotFound(String),
    Internal(anyhow::Error),
}

fn append_message(
    db: &Database,
    identity: &SessionIdentity,
    conversation_id: Uuid,
    content: &str,
) -> Result<ServerEvent, CommandError> {
    let exists = db
        .get_conversation(&conversation_id.to_string())
        .map_err(CommandError::Internal)?;
    if exists.is_none() {
        return Err(CommandError::NotFound("conversation not found".into()));
    }

    let message_id = Uuid::new_v4();
    let now = Utc::now();
    db.insert_message(
        &message_id.to_string(),
        &conversation_id.to_string(),
        &identity.user_id.to_string(),
        content,
        &now.to_rfc3339(),
    )
    .map_err(CommandError::Internal)?;

    Ok(ServerEvent::MessageCreate {
        id: message_id,
        conversation_id,
        sender_id: identity.user_id,
        sender_phone: identity.phone.clone(),
        content: content.to_string(),
        delivered: true,
        read: false,
        timestamp: now,
    })
}

fn go_online(db: &Database, dispatcher: &Dispatcher, identity: &SessionIdentity) {
    match db.touch_presence(&identity.user_id.to_string(), true) {
        Ok(true) => {
            dispatcher.publish(
                Topic::UserStatus(identity.user_id),
                ServerEvent::PresenceUpdate {
                    user_id: identity.user_id,
                    phone: identity.phone.clone(),
                    online: true,
                    last_seen: Some(Utc::now()),
                },
            );
        }
        // Unknown identity (e.g. the permissive-mode guest) has no row.
        Ok(false) => {}
        Err(e) => warn!("presence update failed for {}: {}", identity.phone, e),
    }
}

fn go_offline(db: &Database, dispatcher: &Dispatcher, identity: &SessionIdentity) {
    match db.touch_presence(&identity.user_id.to_string(), false) {
        Ok(true) => {
            dispatcher.publish(
                Topic::UserStatus(identity.user_id),
                ServerEvent::PresenceUpdate {
                    user_id: identity.user_id,
                    phone: identity.phone.clone(),
                    online: false,
                    last_seen: Some(Utc::now()),
                },
            );
        }
        Ok(false) => {}
        Err(e) => warn!("presence update failed for {}: {}", identity.phone, e),
    }
}

async fn send_error(dispatcher: &Dispatcher, user_id: Uuid, kind: &str, message: &str) {
    dispatcher
        .send_to_user(
            user_id,
            ServerEvent::Error {
                kind: kind.to_string(),
                message: message.to_string(),
            },
        )
        .await;
}

fn snapshot_presence(row: confab_db::models::UserRow) -> Option<ServerEvent> {
    let user = match row.into_user() {
        Ok(user) => user,
        Err(e) => {
            warn!("skipping corrupt presence row: {}", e);
            return None;
        }
    };
    Some(ServerEvent::PresenceUpdate {
        user_id: user.id,
        phone: user.phone,
        online: user.online,
        last_seen: user.last_seen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_types::api::Claims;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "gateway-test-secret";

    fn bearer(sub: Uuid, exp_offset_secs: i64) -> String {
        let claims = Claims {
            sub,
            phone: "+100".into(),
            exp: (Utc::now().timestamp() + exp_offset_secs) as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        format!("Bearer {}", token)
    }

    #[test]
    fn valid_token_binds_its_subject() {
        let sub = Uuid::new_v4();
        let header = bearer(sub, 3600);

        let identity = authenticate_bearer(Some(&header), SECRET, false).unwrap();
        assert_eq!(identity.user_id, sub);
        assert_eq!(identity.phone, "+100");
    }

    #[test]
    fn missing_or_garbage_header_is_rejected_in_strict_mode() {
        assert!(authenticate_bearer(None, SECRET, false).is_none());
        assert!(authenticate_bearer(Some("Bearer not-a-jwt"), SECRET, false).is_none());
        assert!(authenticate_bearer(Some("Basic abc"), SECRET, false).is_none());
    }

    #[test]
    fn expired_token_is_rejected_in_strict_mode() {
        let header = bearer(Uuid::new_v4(), -3600);
        assert!(authenticate_bearer(Some(&header), SECRET, false).is_none());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let header = bearer(Uuid::new_v4(), 3600);
        assert!(authenticate_bearer(Some(&header), "other-secret", false).is_none());
    }

    #[test]
    fn permissive_mode_binds_the_guest_not_the_token_subject() {
        let sub = Uuid::new_v4();
        let header = bearer(sub, -3600);

        let identity = authenticate_bearer(Some(&header), SECRET, true).unwrap();
        assert_eq!(identity, guest_identity());
        assert_ne!(identity.user_id, sub);

        let identity = authenticate_bearer(None, SECRET, true).unwrap();
        assert_eq!(identity, guest_identity());
    }
}
