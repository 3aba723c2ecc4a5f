//! SQLite schema
//!
//! Timestamps are stored as Unix epoch milliseconds (INTEGER).

/// Statements run in order by [`super::SqliteStore::migrate`]
pub const MIGRATIONS: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS jobs (
    id            TEXT PRIMARY KEY,
    resource_key  TEXT NOT NULL,
    kind          TEXT NOT NULL,
    status        TEXT NOT NULL CHECK (status IN ('queued', 'running', 'ok', 'error')),
    outcome       TEXT CHECK (outcome IN ('produced', 'duplicate')),
    error_code    TEXT,
    error_message TEXT,
    attempts      INTEGER NOT NULL DEFAULT 0,
    payload       TEXT NOT NULL,
    worker_id     TEXT,
    run_after     INTEGER NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
)
"#,
    // At most one queued/running job per resource
    r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_resource
    ON jobs (resource_key) WHERE status IN ('queued', 'running')
"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_jobs_claim
    ON jobs (status, run_after, created_at)
"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_jobs_resource_created
    ON jobs (resource_key, created_at)
"#,
    r#"
CREATE TABLE IF NOT EXISTS locks (
    lock_key    TEXT PRIMARY KEY,
    owner_token TEXT NOT NULL,
    expires_at  INTEGER NOT NULL
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS artifacts (
    resource_key        TEXT PRIMARY KEY,
    content             TEXT NOT NULL,
    provider_chain_used TEXT NOT NULL,
    origin_lat          REAL NOT NULL,
    origin_lng          REAL NOT NULL,
    valid_window_start  INTEGER NOT NULL,
    valid_window_end    INTEGER NOT NULL,
    generated_at        INTEGER NOT NULL,
    status              TEXT NOT NULL CHECK (status IN ('active', 'superseded')),
    generation          INTEGER NOT NULL DEFAULT 1,
    CHECK (valid_window_end >= valid_window_start)
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS notifications (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_key TEXT NOT NULL,
    status       TEXT NOT NULL,
    published_at INTEGER NOT NULL
)
"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_notifications_resource
    ON notifications (resource_key, seq)
"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_notifications_published
    ON notifications (published_at)
"#,
];
