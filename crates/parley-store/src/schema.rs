/// SQL DDL for the parley database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
"#;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS topics (
    name TEXT PRIMARY KEY,
    owner TEXT,
    access_auth TEXT NOT NULL,
    access_anon TEXT NOT NULL,
    seq_id INTEGER NOT NULL DEFAULT 0,
    clear_id INTEGER NOT NULL DEFAULT 0,
    public TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
    topic TEXT NOT NULL REFERENCES topics(name) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    mode_want TEXT NOT NULL,
    mode_given TEXT NOT NULL,
    recv_id INTEGER NOT NULL DEFAULT 0,
    read_id INTEGER NOT NULL DEFAULT 0,
    clear_id INTEGER NOT NULL DEFAULT 0,
    private TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (topic, user_id)
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_user ON subscriptions(user_id);

CREATE TABLE IF NOT EXISTS messages (
    topic TEXT NOT NULL REFERENCES topics(name) ON DELETE CASCADE,
    seq_id INTEGER NOT NULL,
    from_user TEXT,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (topic, seq_id)
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;
