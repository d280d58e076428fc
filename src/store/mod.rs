//! SQLite-backed persistence for every broker entity.
//!
//! The store exclusively owns entity records; other components hold ids and
//! fetch through it. Timestamps are stored as RFC 3339 UTC text (uniform
//! microsecond precision so lexicographic order matches chronological
//! order), ids as canonical UUID text, and scope sets as JSON arrays.
//!
//! Referenced entities are never deleted; deactivation flips `is_active`
//! so access log rows stay referentially valid. Log foreign keys carry no
//! cascade.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use uuid::Uuid;

pub mod access_log;
pub mod agents;
pub mod credentials;
pub mod policies;
pub mod requests;
pub mod tools;

pub use access_log::LogFilter;
pub use access_log::LogPage;
pub use tools::ToolFilter;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced row does not exist.
    #[error("not found")]
    NotFound,
    /// A uniqueness constraint was violated.
    #[error("{0}")]
    AlreadyExists(String),
    /// An optimistic-lock update lost the race.
    #[error("conflicting update")]
    ConflictingUpdate,
    /// Transient backend failure; safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Unrecoverable database or data error.
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Whether the caller may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Map an sqlx error onto the store error taxonomy.
pub(crate) fn map_sqlx(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::AlreadyExists(db.message().to_owned())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable("connection pool exhausted".to_owned())
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io: {e}")),
        other => StoreError::Database(other.to_string()),
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    agent_id    TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    roles       TEXT NOT NULL DEFAULT '[]',
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tools (
    tool_id        TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    description    TEXT NOT NULL DEFAULT '',
    api_endpoint   TEXT NOT NULL DEFAULT '',
    version        TEXT NOT NULL DEFAULT '1.0.0',
    owner_id       TEXT NOT NULL REFERENCES agents(agent_id),
    allowed_scopes TEXT NOT NULL DEFAULT '[]',
    tags           TEXT NOT NULL DEFAULT '[]',
    is_active      INTEGER NOT NULL DEFAULT 1,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tools_active_name
    ON tools(lower(name)) WHERE is_active = 1;

CREATE TABLE IF NOT EXISTS policies (
    policy_id      TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    tool_id        TEXT REFERENCES tools(tool_id),
    created_by     TEXT NOT NULL REFERENCES agents(agent_id),
    allowed_scopes TEXT NOT NULL DEFAULT '[]',
    conditions     TEXT NOT NULL DEFAULT '{}',
    rules          TEXT NOT NULL DEFAULT '{}',
    priority       INTEGER NOT NULL DEFAULT 0,
    is_active      INTEGER NOT NULL DEFAULT 1,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_policies_tool ON policies(tool_id);

CREATE TABLE IF NOT EXISTS access_requests (
    request_id       TEXT PRIMARY KEY,
    agent_id         TEXT NOT NULL REFERENCES agents(agent_id),
    tool_id          TEXT NOT NULL REFERENCES tools(tool_id),
    requested_scopes TEXT NOT NULL DEFAULT '[]',
    justification    TEXT,
    status           TEXT NOT NULL DEFAULT 'PENDING',
    matched_policy_id TEXT,
    created_at       TEXT NOT NULL,
    resolved_at      TEXT,
    resolver_id      TEXT
);

CREATE INDEX IF NOT EXISTS idx_access_requests_status ON access_requests(status);

CREATE TABLE IF NOT EXISTS credentials (
    credential_id     TEXT PRIMARY KEY,
    agent_id          TEXT NOT NULL REFERENCES agents(agent_id),
    tool_id           TEXT NOT NULL REFERENCES tools(tool_id),
    granted_scopes    TEXT NOT NULL DEFAULT '[]',
    fingerprint       TEXT NOT NULL UNIQUE,
    issued_at         TEXT NOT NULL,
    expires_at        TEXT NOT NULL,
    revoked_at        TEXT,
    source_policy_id  TEXT NOT NULL,
    source_request_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_credentials_expiry ON credentials(expires_at);

CREATE TABLE IF NOT EXISTS access_logs (
    log_id           TEXT PRIMARY KEY,
    timestamp        TEXT NOT NULL,
    request_id       TEXT,
    agent_id         TEXT REFERENCES agents(agent_id),
    tool_id          TEXT REFERENCES tools(tool_id),
    policy_id        TEXT,
    credential_id    TEXT,
    event            TEXT NOT NULL,
    decision         TEXT,
    reason_code      TEXT NOT NULL,
    request_ip       TEXT,
    user_agent       TEXT,
    requested_scopes TEXT NOT NULL DEFAULT '[]',
    granted_scopes   TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_access_logs_agent ON access_logs(agent_id);
CREATE INDEX IF NOT EXISTS idx_access_logs_tool ON access_logs(tool_id);
CREATE INDEX IF NOT EXISTS idx_access_logs_timestamp ON access_logs(timestamp);
"#;

/// SQLite-backed repository shared by every broker component.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

impl Store {
    /// Connect to `database_url` and ensure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::Database(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // A `:memory:` database lives per connection; cap the pool at one
        // connection so every query sees the same schema.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(map_sqlx)?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(map_sqlx)?;
        Ok(Self { pool })
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    /// The underlying pool. Internal modules use this for queries and
    /// transactions.
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ── Shared row helpers ──────────────────────────────────────────

/// Uniform timestamp encoding so lexicographic order is chronological.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("bad timestamp '{raw}': {e}")))
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_ts).transpose()
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Database(format!("bad uuid '{raw}': {e}")))
}

pub(crate) fn parse_uuid_opt(raw: Option<String>) -> Result<Option<Uuid>, StoreError> {
    raw.as_deref().map(parse_uuid).transpose()
}

pub(crate) fn scopes_to_json(scopes: &BTreeSet<String>) -> String {
    serde_json::to_string(scopes).unwrap_or_else(|_| "[]".to_owned())
}

pub(crate) fn scopes_from_json(raw: &str) -> Result<BTreeSet<String>, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Database(format!("bad scope list: {e}")))
}

pub(crate) fn strings_to_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_owned())
}

pub(crate) fn strings_from_json(raw: &str) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Database(format!("bad string list: {e}")))
}
