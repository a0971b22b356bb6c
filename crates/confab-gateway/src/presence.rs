use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use confab_db::Database;
use confab_db::models::parse_timestamp;
use confab_types::events::{ServerEvent, Topic};

use crate::dispatcher::Dispatcher;

/// How often the reaper scans for stale sessions.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A user whose last activity is older than this is considered gone.
pub const STALE_AFTER_SECS: i64 = 300;

/// Background task that flips inactive users offline.
///
/// This is the only writer that can take a user offline without an explicit
/// client action — it models crash/disconnect detection without relying on
/// transport-level disconnect events. Expiry is evaluated on each pass, not
/// enforced by a per-user timer.
pub async fn run_presence_reaper(
    db: Arc<Database>,
    dispatcher: Dispatcher,
    interval: Duration,
    stale_after_secs: i64,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        match reap_stale(&db, &dispatcher, stale_after_secs) {
            Ok(count) => {
                if count > 0 {
                    info!("Presence reaper: {} users flipped offline", count);
                }
            }
            Err(e) => {
                warn!("Presence reaper error: {}", e);
            }
        }
    }
}

/// One reaper pass. Each flip is an independent best-effort write: a failed
/// row is logged and the rest of the batch proceeds. Returns how many users
/// went offline.
pub fn reap_stale(
    db: &Database,
    dispatcher: &Dispatcher,
    stale_after_secs: i64,
) -> anyhow::Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::seconds(stale_after_secs);
    let online = db.online_users()?;

    let mut flipped = 0;
    for row in online {
        let Some(raw) = row.last_seen.as_deref() else {
            // Online with no activity stamp: nothing to age against.
            continue;
        };
        let last_seen = match parse_timestamp(raw) {
            Ok(ts) => ts,
            Err(e) => {
                warn!("Presence reaper: skipping user {}: {}", row.id, e);
                continue;
            }
        };
        if last_seen >= cutoff {
            continue;
        }

        match db.reap_offline(&row.id) {
            Ok(true) => {
                flipped += 1;
                if let Ok(user_id) = row.id.parse::<Uuid>() {
                    dispatcher.publish(
                        Topic::UserStatus(user_id),
                        ServerEvent::PresenceUpdate {
                            user_id,
                            phone: row.phone.clone(),
                            online: false,
                            last_seen: Some(last_seen),
                        },
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Presence reaper: failed to flip user {}: {}", row.id, e);
            }
        }
    }

    Ok(flipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_user(db: &Database, phone: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), phone, phone).unwrap();
        id
    }

    fn backdate_last_seen(db: &Database, user_id: Uuid, secs_ago: i64) {
        let stamp = (Utc::now() - chrono::Duration::seconds(secs_ago)).to_rfc3339();
        db.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET last_seen = ?1 WHERE id = ?2",
                (&stamp, user_id.to_string()),
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn stale_user_is_flipped_offline_in_one_pass() {
        let db = Database::open_in_memory().unwrap();
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();

        let stale = add_user(&db, "+100");
        db.touch_presence(&stale.to_string(), true).unwrap();
        backdate_last_seen(&db, stale, STALE_AFTER_SECS + 60);

        let flipped = reap_stale(&db, &dispatcher, STALE_AFTER_SECS).unwrap();
        assert_eq!(flipped, 1);

        let row = db.get_user_by_id(&stale.to_string()).unwrap().unwrap();
        assert!(!row.online);

        let published = rx.recv().await.unwrap();
        assert_eq!(published.topic, Topic::UserStatus(stale));
        match published.event {
            ServerEvent::PresenceUpdate { online, .. } => assert!(!online),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn recent_heartbeat_survives_the_sweep() {
        let db = Database::open_in_memory().unwrap();
        let dispatcher = Dispatcher::new();

        let fresh = add_user(&db, "+200");
        db.touch_presence(&fresh.to_string(), true).unwrap();

        let flipped = reap_stale(&db, &dispatcher, STALE_AFTER_SECS).unwrap();
        assert_eq!(flipped, 0);

        let row = db.get_user_by_id(&fresh.to_string()).unwrap().unwrap();
        assert!(row.online);
    }

    #[tokio::test]
    async fn offline_users_are_ignored() {
        let db = Database::open_in_memory().unwrap();
        let dispatcher = Dispatcher::new();

        let gone = add_user(&db, "+300");
        db.touch_presence(&gone.to_string(), false).unwrap();
        backdate_last_seen(&db, gone, STALE_AFTER_SECS * 2);

        let flipped = reap_stale(&db, &dispatcher, STALE_AFTER_SECS).unwrap();
        assert_eq!(flipped, 0);
    }
}
