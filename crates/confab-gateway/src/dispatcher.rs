use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use confab_types::events::{ServerEvent, Topic};

/// An event paired with the topic it was published on. Every connected
/// session receives every `Published` from the broadcast channel and drops
/// the ones whose topic it has not subscribed to.
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: Topic,
    pub event: ServerEvent,
}

/// Manages all connected sessions and fans events out to them.
///
/// Delivery is best-effort, fire-and-forget: no acknowledgment, no retry,
/// and nothing is replayed for a subscriber that was disconnected — clients
/// recover missed state by re-reading the message ledger.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Topic-tagged broadcast channel; sessions filter on their own side.
    broadcast_tx: broadcast::Sender<Published>,

    /// Per-user targeted channels: user_id -> (conn_id, sender). Used for
    /// `Ready` and for the private error path — never for topic traffic.
    sessions: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<ServerEvent>)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the published-event stream. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Publish an event on a topic. Fire-and-forget: a send with no
    /// receivers is not an error.
    pub fn publish(&self, topic: Topic, event: ServerEvent) {
        let _ = self.inner.broadcast_tx.send(Published { topic, event });
    }

    /// Register a session's targeted channel. Returns (conn_id, receiver).
    /// A newer connection for the same user displaces the older channel.
    pub async fn register_session(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .sessions
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        (conn_id, rx)
    }

    /// Unregister a session, but only if conn_id still owns the channel.
    /// Returns true if this call removed the registration — the caller uses
    /// that to decide whether it owns the user's offline transition.
    pub async fn unregister_session(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get(&user_id) {
            Some((stored, _)) if *stored == conn_id => {
                sessions.remove(&user_id);
                true
            }
            // A newer connection has taken over — don't touch anything.
            _ => false,
        }
    }

    /// Deliver an event to one user's session only. This is the private
    /// error channel: failures during command handling go here, never to
    /// the conversation topic.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) {
        let sessions = self.inner.sessions.read().await;
        if let Some((_, tx)) = sessions.get(&user_id) {
            let _ = tx.send(event);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
