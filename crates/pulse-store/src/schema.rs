/// SQL DDL for the pulse database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS cursors (
    channel TEXT PRIMARY KEY,
    position INTEGER NOT NULL,
    advanced_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letters (
    id TEXT PRIMARY KEY,
    channel TEXT NOT NULL,
    object_type TEXT NOT NULL,
    change_type TEXT NOT NULL,
    record_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    payload TEXT NOT NULL,
    error TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_channel ON dead_letters(channel);
CREATE INDEX IF NOT EXISTS idx_dead_letters_record ON dead_letters(record_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
