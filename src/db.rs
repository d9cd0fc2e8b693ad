use crate::error::{Error, Result};
use crate::models::{Message, NewMessage, Origin, PollMode, PollState};
use chrono::{DateTime, SubsecRound, Utc};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, sqlite::SqliteRow};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LIMIT: i64 = 50;
/// Ceiling on any single query response.
pub const MAX_LIMIT: i64 = 500;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    sender_name TEXT NOT NULL,
    sender_email TEXT,
    text TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    fetched_at INTEGER NOT NULL,
    origin TEXT NOT NULL DEFAULT 'poll' CHECK(origin IN ('poll', 'sent'))
);

CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at, id);

CREATE TABLE IF NOT EXISTS read_marker (
    id INTEGER PRIMARY KEY CHECK(id = 1),
    at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS poll_state (
    id INTEGER PRIMARY KEY CHECK(id = 1),
    mode TEXT NOT NULL DEFAULT 'idle',
    last_poll_at INTEGER,
    last_activity_at INTEGER
);

CREATE TABLE IF NOT EXISTS auth (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Filters for [`MessageStore::query`]. Deserializes straight from a query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageQuery {
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub sender: Option<String>,
}

/// Durable, deduplicated message record plus the read marker and poll bookkeeping.
#[derive(Debug, Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Inserts `msg` unless a row with the same id exists. Message fields of
    /// existing rows are never updated.
    ///
    /// Returns whether a new row was added. The conditional insert is a single
    /// statement, so concurrent callers with the same id see exactly one `true`.
    /// A polled copy of a locally sent message only flips its origin to `poll`,
    /// which lets it count toward [`MessageStore::latest_polled_at`].
    pub async fn insert_if_new(&self, msg: &NewMessage, origin: Origin) -> Result<bool> {
        if msg.id.trim().is_empty() {
            return Err(Error::validation("message id is required"));
        }
        if msg.sender_name.trim().is_empty() {
            return Err(Error::validation(format!(
                "message {} has no sender name",
                msg.id
            )));
        }

        let result = sqlx::query(
            "INSERT INTO messages (id, sender_name, sender_email, text, created_at, fetched_at, origin)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&msg.id)
        .bind(&msg.sender_name)
        .bind(&msg.sender_email)
        .bind(&msg.text)
        .bind(micros(msg.created_at))
        .bind(micros(now()))
        .bind(origin.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if origin == Origin::Poll {
            sqlx::query("UPDATE messages SET origin = 'poll' WHERE id = ? AND origin = 'sent'")
                .bind(&msg.id)
                .execute(&self.pool)
                .await?;
        }
        Ok(false)
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, sender_name, sender_email, text, created_at, fetched_at
             FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| message_from_row(&r)))
    }

    /// Messages created strictly after `since`, oldest first, ties broken by id.
    pub async fn query(&self, q: &MessageQuery) -> Result<Vec<Message>> {
        let limit = match q.limit {
            None => DEFAULT_LIMIT,
            Some(n) if n < 1 => return Err(Error::validation("limit must be at least 1")),
            Some(n) => n.min(MAX_LIMIT),
        };
        let sender = q
            .sender
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(s)));

        let rows = sqlx::query(
            r#"SELECT id, sender_name, sender_email, text, created_at, fetched_at
               FROM messages
               WHERE (?1 IS NULL OR created_at > ?1)
                 AND (?2 IS NULL OR sender_name LIKE ?2 ESCAPE '\' OR sender_email LIKE ?2 ESCAPE '\')
               ORDER BY created_at ASC, id ASC
               LIMIT ?3"#,
        )
        .bind(q.since.map(micros))
        .bind(sender)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Messages after the read marker (all messages if no marker is set).
    pub async fn unread(&self) -> Result<Vec<Message>> {
        let marker = self.read_marker().await?;
        self.query(&MessageQuery {
            since: marker,
            limit: Some(MAX_LIMIT),
            sender: None,
        })
        .await
    }

    pub async fn read_marker(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT at FROM read_marker WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| timestamp(r.get(0))))
    }

    /// Advances the read marker to `at` (or now). Never moves it backward.
    /// Returns the marker value in effect afterwards.
    pub async fn mark_read(&self, at: Option<DateTime<Utc>>) -> Result<DateTime<Utc>> {
        let candidate = at.unwrap_or_else(now);
        sqlx::query(
            "INSERT INTO read_marker (id, at) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET at = excluded.at WHERE excluded.at > read_marker.at",
        )
        .bind(micros(candidate))
        .execute(&self.pool)
        .await?;

        Ok(self.read_marker().await?.unwrap_or(candidate))
    }

    pub async fn message_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }

    pub async fn unread_count(&self) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM messages
             WHERE NOT EXISTS (SELECT 1 FROM read_marker)
                OR created_at > (SELECT at FROM read_marker WHERE id = 1)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get(0))
    }

    /// Creation time of the newest message seen by polling. A locally sent
    /// message counts once a poll has returned it, so a send can't hide
    /// unpolled history but also can't pin the lower bound.
    pub async fn latest_polled_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(created_at) FROM messages WHERE origin = 'poll'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<Option<i64>, _>(0).map(timestamp))
    }

    pub async fn record_poll(&self, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO poll_state (id, last_poll_at) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET last_poll_at = excluded.last_poll_at",
        )
        .bind(micros(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_poll_mode(
        &self,
        mode: PollMode,
        last_activity_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO poll_state (id, mode, last_activity_at) VALUES (1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET mode = excluded.mode, last_activity_at = excluded.last_activity_at",
        )
        .bind(mode.as_str())
        .bind(last_activity_at.map(micros))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_poll_state(&self) -> Result<PollState> {
        let row = sqlx::query(
            "SELECT mode, last_poll_at, last_activity_at FROM poll_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => PollState {
                mode: PollMode::parse(&r.get::<String, _>(0)).unwrap_or_default(),
                last_poll_at: r.get::<Option<i64>, _>(1).map(timestamp),
                last_activity_at: r.get::<Option<i64>, _>(2).map(timestamp),
            },
            None => PollState::default(),
        })
    }

    pub async fn get_auth(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM auth WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn set_auth(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO auth (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_auth(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM auth WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn message_from_row(row: &SqliteRow) -> Message {
    Message {
        id: row.get(0),
        sender_name: row.get(1),
        sender_email: row.get(2),
        text: row.get(3),
        created_at: timestamp(row.get(4)),
        fetched_at: timestamp(row.get(5)),
    }
}

/// Current time at storage precision, so in-memory and persisted values agree.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn micros(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

fn timestamp(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) async fn temp_store() -> (TempDir, MessageStore) {
        let temp = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", temp.path().join("test.db").display());
        let store = MessageStore::new(&url).await.unwrap();
        store.run_migrations().await.unwrap();
        (temp, store)
    }

    pub(crate) fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    pub(crate) fn msg(id: &str, secs: i64) -> NewMessage {
        NewMessage {
            id: id.to_string(),
            sender_name: "Ada Lovelace".to_string(),
            sender_email: Some("ada@example.com".to_string()),
            text: format!("message {}", id),
            created_at: at(secs),
        }
    }

    /// Runs raw SQL against the store, for fault injection.
    pub(crate) async fn exec(store: &MessageStore, sql: &str) {
        sqlx::query(sql).execute(&store.pool).await.unwrap();
    }

    /// Makes every later message insert fail with a database error.
    pub(crate) async fn reject_inserts(store: &MessageStore) {
        exec(
            store,
            "CREATE TRIGGER reject_inserts BEFORE INSERT ON messages
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .await;
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let (_temp, store) = temp_store().await;

        assert!(store.insert_if_new(&msg("m1", 10), Origin::Poll).await.unwrap());

        let mut changed = msg("m1", 99);
        changed.text = "edited".to_string();
        assert!(!store.insert_if_new(&changed, Origin::Poll).await.unwrap());

        let stored = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(stored.text, "message m1");
        assert_eq!(stored.created_at, at(10));
        assert_eq!(store.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_of_same_id() {
        let (_temp, store) = temp_store().await;
        let message = msg("dup", 5);

        let results = futures::future::join_all(
            (0..16).map(|_| store.insert_if_new(&message, Origin::Poll)),
        )
        .await;

        let inserted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(inserted, 1);
        assert_eq!(store.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_validation() {
        let (_temp, store) = temp_store().await;

        let err = store
            .insert_if_new(&msg("", 1), Origin::Poll)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut nameless = msg("m1", 1);
        nameless.sender_name = " ".to_string();
        let err = store.insert_if_new(&nameless, Origin::Poll).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.message_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_orders_by_created_at_then_id() {
        let (_temp, store) = temp_store().await;
        for (id, t) in [("c", 3), ("b", 2), ("z", 1), ("a", 2), ("y", 1)] {
            store.insert_if_new(&msg(id, t), Origin::Poll).await.unwrap();
        }

        let all = store.query(&MessageQuery::default()).await.unwrap();
        assert_eq!(ids(&all), vec!["y", "z", "a", "b", "c"]);
        assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn test_query_since_is_strict_and_limited() {
        let (_temp, store) = temp_store().await;
        for t in 1..=5 {
            store
                .insert_if_new(&msg(&format!("m{}", t), t), Origin::Poll)
                .await
                .unwrap();
        }

        let after_two = store
            .query(&MessageQuery {
                since: Some(at(2)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ids(&after_two), vec!["m3", "m4", "m5"]);

        let limited = store
            .query(&MessageQuery {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ids(&limited), vec!["m1", "m2"]);

        let err = store
            .query(&MessageQuery {
                limit: Some(0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_query_sender_filter() {
        let (_temp, store) = temp_store().await;
        store.insert_if_new(&msg("m1", 1), Origin::Poll).await.unwrap();
        let mut other = msg("m2", 2);
        other.sender_name = "Grace Hopper".to_string();
        other.sender_email = None;
        store.insert_if_new(&other, Origin::Poll).await.unwrap();
        let mut pct = msg("m3", 3);
        pct.sender_name = "100% Bot".to_string();
        store.insert_if_new(&pct, Origin::Poll).await.unwrap();

        let by_name = |s: &str| MessageQuery {
            sender: Some(s.to_string()),
            ..Default::default()
        };
        assert_eq!(ids(&store.query(&by_name("grace")).await.unwrap()), vec!["m2"]);
        assert_eq!(
            ids(&store.query(&by_name("ada@example")).await.unwrap()),
            vec!["m1", "m3"]
        );
        assert_eq!(ids(&store.query(&by_name("0%")).await.unwrap()), vec!["m3"]);
    }

    #[tokio::test]
    async fn test_read_marker_is_monotonic() {
        let (_temp, store) = temp_store().await;
        assert_eq!(store.read_marker().await.unwrap(), None);

        assert_eq!(store.mark_read(Some(at(20))).await.unwrap(), at(20));
        assert_eq!(store.mark_read(Some(at(10))).await.unwrap(), at(20));
        assert_eq!(store.read_marker().await.unwrap(), Some(at(20)));

        let now = store.mark_read(None).await.unwrap();
        assert!(now > at(20));
        assert_eq!(store.read_marker().await.unwrap(), Some(now));
    }

    #[tokio::test]
    async fn test_unread_after_marker() {
        let (_temp, store) = temp_store().await;
        for t in 1..=3 {
            store
                .insert_if_new(&msg(&format!("m{}", t), t), Origin::Poll)
                .await
                .unwrap();
        }
        assert_eq!(store.unread().await.unwrap().len(), 3);
        assert_eq!(store.unread_count().await.unwrap(), 3);

        store.mark_read(Some(at(2))).await.unwrap();
        assert_eq!(ids(&store.unread().await.unwrap()), vec!["m3"]);
        assert_eq!(store.unread_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_latest_polled_ignores_sent_messages() {
        let (_temp, store) = temp_store().await;
        assert_eq!(store.latest_polled_at().await.unwrap(), None);

        store.insert_if_new(&msg("p1", 10), Origin::Poll).await.unwrap();
        store.insert_if_new(&msg("s1", 50), Origin::Sent).await.unwrap();
        assert_eq!(store.latest_polled_at().await.unwrap(), Some(at(10)));
    }

    #[tokio::test]
    async fn test_polled_copy_of_sent_message_advances_lower_bound() {
        let (_temp, store) = temp_store().await;
        store.insert_if_new(&msg("s1", 50), Origin::Sent).await.unwrap();
        assert_eq!(store.latest_polled_at().await.unwrap(), None);

        let mut polled = msg("s1", 50);
        polled.text = "edited upstream".to_string();
        assert!(!store.insert_if_new(&polled, Origin::Poll).await.unwrap());
        assert_eq!(store.latest_polled_at().await.unwrap(), Some(at(50)));

        let stored = store.get_message("s1").await.unwrap().unwrap();
        assert_eq!(stored.text, "message s1");
        assert_eq!(store.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stored_times_round_trip_exactly() {
        let (_temp, store) = temp_store().await;
        let t = now();
        assert_eq!(t, t.trunc_subsecs(6));

        store.record_poll(t).await.unwrap();
        assert_eq!(store.load_poll_state().await.unwrap().last_poll_at, Some(t));

        store.insert_if_new(&msg("m1", 1), Origin::Poll).await.unwrap();
        let fetched = store.get_message("m1").await.unwrap().unwrap().fetched_at;
        assert_eq!(fetched, fetched.trunc_subsecs(6));
    }

    #[tokio::test]
    async fn test_poll_state_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", temp.path().join("state.db").display());

        let store = MessageStore::new(&url).await.unwrap();
        store.run_migrations().await.unwrap();
        assert_eq!(store.load_poll_state().await.unwrap(), PollState::default());

        store.record_poll(at(100)).await.unwrap();
        store
            .save_poll_mode(PollMode::Active, Some(at(90)))
            .await
            .unwrap();
        store.close().await;

        let reopened = MessageStore::new(&url).await.unwrap();
        reopened.run_migrations().await.unwrap();
        let state = reopened.load_poll_state().await.unwrap();
        assert_eq!(state.mode, PollMode::Active);
        assert_eq!(state.last_poll_at, Some(at(100)));
        assert_eq!(state.last_activity_at, Some(at(90)));
    }

    #[tokio::test]
    async fn test_auth_values() {
        let (_temp, store) = temp_store().await;
        assert_eq!(store.get_auth("token").await.unwrap(), None);
        store.set_auth("token", "a").await.unwrap();
        store.set_auth("token", "b").await.unwrap();
        assert_eq!(store.get_auth("token").await.unwrap().as_deref(), Some("b"));
        store.delete_auth("token").await.unwrap();
        assert_eq!(store.get_auth("token").await.unwrap(), None);
    }
}
