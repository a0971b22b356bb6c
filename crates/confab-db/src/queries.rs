use anyhow::Result;
use chrono::Utc;
use rusqlite::Connection;
use tracing::warn;
use uuid::Uuid;

use crate::Database;
use crate::models::{ConversationRow, MessageRow, UserRow};

/// Canonical key for an unordered participant pair: the two ids sorted
/// lexicographically and joined with ':'. Stored UNIQUE on conversations,
/// so two concurrent first-contact resolves cannot both create a row.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

impl Database {
    // -- Users (Identity Store) --

    pub fn create_user(&self, id: &str, phone: &str, display_name: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, phone, display_name) VALUES (?1, ?2, ?3)",
                (id, phone, display_name),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_phone(&self, phone: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "phone", phone))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn phone_exists(&self, phone: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE phone = ?1",
                [phone],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    // -- Presence --

    /// Explicit/heartbeat presence write: sets the online flag and stamps
    /// `last_seen`. Returns false if the user does not exist.
    pub fn touch_presence(&self, user_id: &str, online: bool) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET online = ?1, last_seen = ?2 WHERE id = ?3",
                rusqlite::params![online, Utc::now().to_rfc3339(), user_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Reaper write: flips a user offline without touching `last_seen`, so
    /// the stored timestamp keeps reflecting the last actual activity.
    pub fn reap_offline(&self, user_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute("UPDATE users SET online = 0 WHERE id = ?1", [user_id])?;
            Ok(changed > 0)
        })
    }

    pub fn online_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, phone, display_name, online, last_seen, created_at
                 FROM users WHERE online = 1",
            )?;
            let rows = stmt
                .query_map([], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Conversations (Chat Resolver) --

    /// Find or create the unique conversation for an unordered pair of user
    /// ids. Creation inserts the conversation and both participant rows in
    /// one transaction; a loser of the concurrent-create race hits the
    /// pair_key UNIQUE constraint and re-reads the winner's row. Returns
    /// `(row, created)`.
    pub fn resolve_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<(ConversationRow, bool)> {
        let key = pair_key(user_a, user_b);
        self.with_conn_mut(|conn| {
            if let Some(row) = query_conversation_by_pair_key(conn, &key)? {
                return Ok((row, false));
            }

            let id = Uuid::new_v4().to_string();
            let created_at = Utc::now().to_rfc3339();

            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO conversations (id, pair_key, created_at) VALUES (?1, ?2, ?3)",
                (&id, &key, &created_at),
            );
            match inserted {
                Ok(_) => {
                    tx.execute(
                        "INSERT INTO conversation_participants (conversation_id, user_id)
                         VALUES (?1, ?2)",
                        (&id, user_a),
                    )?;
                    tx.execute(
                        "INSERT INTO conversation_participants (conversation_id, user_id)
                         VALUES (?1, ?2)",
                        (&id, user_b),
                    )?;
                    tx.commit()?;
                    Ok((
                        ConversationRow {
                            id,
                            pair_key: key,
                            created_at,
                        },
                        true,
                    ))
                }
                Err(e) if is_unique_violation(&e) => {
                    drop(tx);
                    let row = query_conversation_by_pair_key(conn, &key)?.ok_or_else(|| {
                        anyhow::anyhow!("conversation vanished after pair_key conflict: {}", key)
                    })?;
                    Ok((row, false))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, pair_key, created_at FROM conversations WHERE id = ?1")?;
            let row = stmt.query_row([id], conversation_from_row).optional()?;
            Ok(row)
        })
    }

    pub fn participants(&self, conversation_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM conversation_participants
                 WHERE conversation_id = ?1 ORDER BY user_id",
            )?;
            let ids = stmt
                .query_map([conversation_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// All conversations the user participates in, with the peer's user id.
    pub fn conversations_for_user(&self, user_id: &str) -> Result<Vec<(ConversationRow, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.pair_key, c.created_at, other.user_id
                 FROM conversations c
                 JOIN conversation_participants me
                   ON me.conversation_id = c.id AND me.user_id = ?1
                 JOIN conversation_participants other
                   ON other.conversation_id = c.id AND other.user_id != ?1
                 ORDER BY c.created_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok((
                        ConversationRow {
                            id: row.get(0)?,
                            pair_key: row.get(1)?,
                            created_at: row.get(2)?,
                        },
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages (ledger) --

    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, delivered, read, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, 0, ?5)",
                (id, conversation_id, sender_id, content, created_at),
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE m.id = ?1", MESSAGE_SELECT))?;
            let row = stmt.query_row([id], message_from_row).optional()?;
            Ok(row)
        })
    }

    /// Ascending insertion-order retrieval — the ledger is the ordering
    /// source of truth; fan-out delivery order is not relied on.
    pub fn messages_for_conversation(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE m.conversation_id = ?1 ORDER BY m.created_at ASC, m.id ASC",
                MESSAGE_SELECT
            ))?;
            let rows = stmt
                .query_map([conversation_id], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Idempotent read transition. Also raises `delivered`, preserving the
    /// invariant that a read message is always delivered. Returns the
    /// updated row, or None if the message does not exist.
    pub fn mark_read(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET read = 1, delivered = 1 WHERE id = ?1",
                [id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let mut stmt = conn.prepare(&format!("{} WHERE m.id = ?1", MESSAGE_SELECT))?;
            let row = stmt.query_row([id], message_from_row).optional()?;
            Ok(row)
        })
    }

    /// Idempotent delivered transition.
    pub fn mark_delivered(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute("UPDATE messages SET delivered = 1 WHERE id = ?1", [id])?;
            if changed == 0 {
                return Ok(None);
            }
            let mut stmt = conn.prepare(&format!("{} WHERE m.id = ?1", MESSAGE_SELECT))?;
            let row = stmt.query_row([id], message_from_row).optional()?;
            Ok(row)
        })
    }

    /// Bulk read sweep: every unread message in the conversation authored by
    /// someone other than the reader transitions to read. Each row is an
    /// independent update — one failure is logged and the rest proceed.
    /// Returns the ids that transitioned.
    pub fn mark_all_read(&self, conversation_id: &str, reader_id: &str) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let ids: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT id FROM messages
                     WHERE conversation_id = ?1 AND sender_id != ?2 AND read = 0",
                )?;
                stmt.query_map((conversation_id, reader_id), |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let mut marked = Vec::with_capacity(ids.len());
            for id in ids {
                match conn.execute(
                    "UPDATE messages SET read = 1, delivered = 1 WHERE id = ?1",
                    [&id],
                ) {
                    Ok(_) => marked.push(id),
                    Err(e) => warn!("mark_all_read: skipping message {}: {}", id, e),
                }
            }
            Ok(marked)
        })
    }

    pub fn unread_count(&self, conversation_id: &str, reader_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND read = 0",
                (conversation_id, reader_id),
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Every unread message addressed to the reader, across all
    /// conversations they participate in.
    pub fn unread_messages_for(&self, reader_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} JOIN conversation_participants cp
                    ON cp.conversation_id = m.conversation_id AND cp.user_id = ?1
                  WHERE m.sender_id != ?1 AND m.read = 0
                  ORDER BY m.created_at ASC, m.id ASC",
                MESSAGE_SELECT
            ))?;
            let rows = stmt
                .query_map([reader_id], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Hard delete; no tombstone. Returns false if the message was absent.
    pub fn delete_message(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            Ok(changed > 0)
        })
    }
}

// JOIN users to fetch the sender phone in a single query (no N+1)
const MESSAGE_SELECT: &str = "SELECT m.id, m.conversation_id, m.sender_id, u.phone,
        m.content, m.delivered, m.read, m.created_at
   FROM messages m
   LEFT JOIN users u ON m.sender_id = u.id";

fn message_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_phone: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        content: row.get(4)?,
        delivered: row.get(5)?,
        read: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn user_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<UserRow, rusqlite::Error> {
    Ok(UserRow {
        id: row.get(0)?,
        phone: row.get(1)?,
        display_name: row.get(2)?,
        online: row.get(3)?,
        last_seen: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn conversation_from_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<ConversationRow, rusqlite::Error> {
    Ok(ConversationRow {
        id: row.get(0)?,
        pair_key: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, phone, display_name, online, last_seen, created_at
         FROM users WHERE {} = ?1",
        column
    ))?;
    let row = stmt.query_row([value], user_from_row).optional()?;
    Ok(row)
}

fn query_conversation_by_pair_key(
    conn: &Connection,
    key: &str,
) -> Result<Option<ConversationRow>> {
    let mut stmt =
        conn.prepare("SELECT id, pair_key, created_at FROM conversations WHERE pair_key = ?1")?;
    let row = stmt.query_row([key], conversation_from_row).optional()?;
    Ok(row)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
