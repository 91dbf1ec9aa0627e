use std::path::Path;

use parley_core::ids::unique_id;
use parley_core::store::{MessageQuery, MessageRecord, Store, SubscriptionRecord, TopicRecord};
use parley_core::{DefaultAccess, StoreError, StoreResult, TopicCat, Uid};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, instrument};

use crate::database::{db_err, parse_json_opt, parse_mode, parse_ts, to_json_opt, Database};

/// [`Store`] backed by a single SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        Ok(Self {
            db: Database::open(path)?,
        })
    }

    pub fn in_memory() -> StoreResult<Self> {
        Ok(Self {
            db: Database::in_memory()?,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

const TOPIC_COLUMNS: &str =
    "name, owner, access_auth, access_anon, seq_id, clear_id, public, created_at, updated_at";

const SUB_COLUMNS: &str =
    "topic, user_id, mode_want, mode_given, recv_id, read_id, clear_id, private, created_at, updated_at";

struct RawTopic {
    name: String,
    owner: Option<String>,
    access_auth: String,
    access_anon: String,
    seq_id: i64,
    clear_id: i64,
    public: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawTopic {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            owner: row.get(1)?,
            access_auth: row.get(2)?,
            access_anon: row.get(3)?,
            seq_id: row.get(4)?,
            clear_id: row.get(5)?,
            public: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_record(self) -> StoreResult<TopicRecord> {
        let cat = TopicCat::of(&self.name)
            .ok_or_else(|| StoreError::Serialization(format!("bad topic name {:?}", self.name)))?;
        Ok(TopicRecord {
            cat,
            owner: self.owner.map(Uid::from_raw),
            access: DefaultAccess {
                auth: parse_mode(&self.access_auth)?,
                anon: parse_mode(&self.access_anon)?,
            },
            seq_id: self.seq_id,
            clear_id: self.clear_id,
            public: parse_json_opt(self.public)?,
            created: parse_ts(&self.created_at)?,
            updated: parse_ts(&self.updated_at)?,
            name: self.name,
        })
    }
}

struct RawSub {
    topic: String,
    user_id: String,
    mode_want: String,
    mode_given: String,
    recv_id: i64,
    read_id: i64,
    clear_id: i64,
    private: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawSub {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            topic: row.get(0)?,
            user_id: row.get(1)?,
            mode_want: row.get(2)?,
            mode_given: row.get(3)?,
            recv_id: row.get(4)?,
            read_id: row.get(5)?,
            clear_id: row.get(6)?,
            private: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_record(self) -> StoreResult<SubscriptionRecord> {
        Ok(SubscriptionRecord {
            topic: self.topic,
            user: Uid::from_raw(self.user_id),
            mode_want: parse_mode(&self.mode_want)?,
            mode_given: parse_mode(&self.mode_given)?,
            recv_id: self.recv_id,
            read_id: self.read_id,
            clear_id: self.clear_id,
            private: parse_json_opt(self.private)?,
            created: parse_ts(&self.created_at)?,
            updated: parse_ts(&self.updated_at)?,
        })
    }
}

fn query_subs(conn: &Connection, filter: &str, arg: &str) -> StoreResult<Vec<SubscriptionRecord>> {
    let sql = format!("SELECT {SUB_COLUMNS} FROM subscriptions WHERE {filter} = ?1 ORDER BY topic, user_id");
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map([arg], RawSub::from_row)
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    rows.into_iter().map(RawSub::into_record).collect()
}

impl Store for SqliteStore {
    fn generate_unique_id(&self) -> String {
        unique_id()
    }

    // ── Topics ──────────────────────────────────────────────────────────

    #[instrument(skip(self))]
    fn load_topic(&self, name: &str) -> StoreResult<Option<TopicRecord>> {
        let raw = self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TOPIC_COLUMNS} FROM topics WHERE name = ?1"),
                [name],
                RawTopic::from_row,
            )
            .optional()
            .map_err(db_err)
        })?;
        raw.map(RawTopic::into_record).transpose()
    }

    #[instrument(skip(self, topic), fields(topic = %topic.name))]
    fn create_topic(&self, topic: &TopicRecord) -> StoreResult<()> {
        let public = to_json_opt(topic.public.as_ref())?;
        self.db.with_conn(|conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO topics (name, owner, access_auth, access_anon, seq_id, clear_id, public, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        topic.name,
                        topic.owner.as_ref().map(Uid::as_str),
                        topic.access.auth.to_string(),
                        topic.access.anon.to_string(),
                        topic.seq_id,
                        topic.clear_id,
                        public,
                        topic.created.to_rfc3339(),
                        topic.updated.to_rfc3339(),
                    ],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Err(StoreError::Conflict(topic.name.clone()));
            }
            debug!("topic created");
            Ok(())
        })
    }

    #[instrument(skip(self, topic), fields(topic = %topic.name))]
    fn update_topic(&self, topic: &TopicRecord) -> StoreResult<()> {
        let public = to_json_opt(topic.public.as_ref())?;
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE topics SET owner = ?2, access_auth = ?3, access_anon = ?4, seq_id = ?5,
                     clear_id = ?6, public = ?7, updated_at = ?8 WHERE name = ?1",
                    params![
                        topic.name,
                        topic.owner.as_ref().map(Uid::as_str),
                        topic.access.auth.to_string(),
                        topic.access.anon.to_string(),
                        topic.seq_id,
                        topic.clear_id,
                        public,
                        topic.updated.to_rfc3339(),
                    ],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(StoreError::NotFound(topic.name.clone()));
            }
            Ok(())
        })
    }

    #[instrument(skip(self))]
    fn delete_topic(&self, name: &str) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let _ = tx.execute("DELETE FROM messages WHERE topic = ?1", [name]).map_err(db_err)?;
            let _ = tx
                .execute("DELETE FROM subscriptions WHERE topic = ?1", [name])
                .map_err(db_err)?;
            let _ = tx.execute("DELETE FROM topics WHERE name = ?1", [name]).map_err(db_err)?;
            tx.commit().map_err(db_err)
        })
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    fn topic_subscriptions(&self, topic: &str) -> StoreResult<Vec<SubscriptionRecord>> {
        self.db.with_conn(|conn| query_subs(conn, "topic", topic))
    }

    fn user_subscriptions(&self, user: &Uid) -> StoreResult<Vec<SubscriptionRecord>> {
        self.db.with_conn(|conn| query_subs(conn, "user_id", user.as_str()))
    }

    #[instrument(skip(self, sub), fields(topic = %sub.topic, user = %sub.user))]
    fn save_subscription(&self, sub: &SubscriptionRecord) -> StoreResult<()> {
        let private = to_json_opt(sub.private.as_ref())?;
        self.db.with_conn(|conn| {
            let _ = conn
                .execute(
                    "INSERT INTO subscriptions (topic, user_id, mode_want, mode_given, recv_id, read_id, clear_id, private, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(topic, user_id) DO UPDATE SET
                        mode_want = excluded.mode_want,
                        mode_given = excluded.mode_given,
                        recv_id = excluded.recv_id,
                        read_id = excluded.read_id,
                        clear_id = excluded.clear_id,
                        private = excluded.private,
                        updated_at = excluded.updated_at",
                    params![
                        sub.topic,
                        sub.user.as_str(),
                        sub.mode_want.to_string(),
                        sub.mode_given.to_string(),
                        sub.recv_id,
                        sub.read_id,
                        sub.clear_id,
                        private,
                        sub.created.to_rfc3339(),
                        sub.updated.to_rfc3339(),
                    ],
                )
                .map_err(db_err)?;
            Ok(())
        })
    }

    fn delete_subscription(&self, topic: &str, user: &Uid) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            let _ = conn
                .execute(
                    "DELETE FROM subscriptions WHERE topic = ?1 AND user_id = ?2",
                    params![topic, user.as_str()],
                )
                .map_err(db_err)?;
            Ok(())
        })
    }

    // ── Messages ────────────────────────────────────────────────────────

    #[instrument(skip(self, msg), fields(topic = %msg.topic, seq = msg.seq_id))]
    fn save_message(&self, msg: &MessageRecord) -> StoreResult<()> {
        let content = serde_json::to_string(&msg.content)?;
        self.db.with_conn(|conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let changed = tx
                .execute(
                    "UPDATE topics SET seq_id = MAX(seq_id, ?2), updated_at = ?3 WHERE name = ?1",
                    params![msg.topic, msg.seq_id, msg.created.to_rfc3339()],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(StoreError::NotFound(msg.topic.clone()));
            }
            let _ = tx
                .execute(
                    "INSERT INTO messages (topic, seq_id, from_user, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        msg.topic,
                        msg.seq_id,
                        msg.from.as_ref().map(Uid::as_str),
                        content,
                        msg.created.to_rfc3339(),
                    ],
                )
                .map_err(db_err)?;
            tx.commit().map_err(db_err)
        })
    }

    fn messages(&self, topic: &str, query: &MessageQuery) -> StoreResult<Vec<MessageRecord>> {
        let before = query.before.unwrap_or(i64::MAX);
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT topic, seq_id, from_user, content, created_at FROM messages
                     WHERE topic = ?1 AND seq_id > ?2 AND seq_id < ?3 ORDER BY seq_id LIMIT ?4",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![topic, query.since, before, limit], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(topic, seq_id, from, content, created)| {
                Ok(MessageRecord {
                    topic,
                    seq_id,
                    from: from.map(Uid::from_raw),
                    content: serde_json::from_str(&content)?,
                    created: parse_ts(&created)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    fn delete_messages(&self, topic: &str, through: i64) -> StoreResult<usize> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM messages WHERE topic = ?1 AND seq_id <= ?2",
                params![topic, through],
            )
            .map_err(db_err)
        })
    }
}
