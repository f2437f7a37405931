use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::models::now_ms;

/// Initial schema. Later migrations that ALTER existing tables are also
/// reflected here so a fresh database comes up with the final shape in one
/// statement batch; re-running their ALTERs is harmless (see
/// `is_already_applied`).
const INITIAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS session (
    id TEXT PRIMARY KEY,
    session_name TEXT NOT NULL,
    title TEXT,
    repo_owner TEXT NOT NULL,
    repo_name TEXT NOT NULL,
    repo_id INTEGER,
    base_branch TEXT NOT NULL,
    branch_name TEXT,
    base_sha TEXT,
    current_sha TEXT,
    model TEXT NOT NULL,
    reasoning_effort TEXT,
    status TEXT NOT NULL DEFAULT 'created',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sandbox (
    id TEXT PRIMARY KEY,
    provider_sandbox_id TEXT,
    provider_object_id TEXT,
    snapshot_image_id TEXT,
    auth_token TEXT,
    auth_token_hash TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    git_sync_status TEXT NOT NULL DEFAULT 'idle',
    last_heartbeat INTEGER,
    last_activity INTEGER,
    last_spawn_error TEXT,
    last_spawn_error_at INTEGER,
    spawn_failure_count INTEGER NOT NULL DEFAULT 0,
    last_spawn_failure INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS participants (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL UNIQUE,
    scm_user_id TEXT,
    scm_login TEXT,
    scm_name TEXT,
    scm_email TEXT,
    scm_access_token_encrypted TEXT,
    scm_refresh_token_encrypted TEXT,
    scm_token_expires_at INTEGER,
    ws_auth_token_hash TEXT UNIQUE,
    ws_token_created_at INTEGER,
    role TEXT NOT NULL DEFAULT 'member',
    joined_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    author_id TEXT NOT NULL REFERENCES participants(id),
    content TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'web',
    model TEXT,
    reasoning_effort TEXT,
    attachments_json TEXT,
    callback_context_json TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_messages_status_created
    ON messages (status, created_at);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    data_json TEXT NOT NULL,
    message_id TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_created_id
    ON events (created_at DESC, id DESC);

CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY,
    artifact_type TEXT NOT NULL,
    url TEXT,
    metadata_json TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ws_client_mappings (
    ws_id TEXT PRIMARY KEY,
    participant_id TEXT NOT NULL,
    client_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_artifacts_single_pr
    ON artifacts (artifact_type) WHERE artifact_type = 'pr';
"#;

/// Numbered migrations, applied in order. Applied ids are recorded in
/// `_schema_migrations`; each entry must stay idempotent because a crash
/// between executing a migration and recording it replays the migration on
/// the next boot.
const MIGRATIONS: &[(i64, &str)] = &[
    (1, INITIAL_SCHEMA),
    // Hash column for the sandbox auth token. Fresh databases already have it
    // from the initial schema; the duplicate-column error is swallowed there.
    (2, "ALTER TABLE sandbox ADD COLUMN auth_token_hash TEXT"),
    // Context blob for messages injected by integration bots (Slack, Linear).
    (3, "ALTER TABLE messages ADD COLUMN callback_context_json TEXT"),
    // At most one pull-request artifact per session, enforced by the store.
    (
        4,
        "CREATE UNIQUE INDEX idx_artifacts_single_pr \
         ON artifacts (artifact_type) WHERE artifact_type = 'pr'",
    ),
];

/// Errors that mean a migration's effect is already present. Anything else
/// aborts initialization.
fn is_already_applied(err: &sqlx::Error) -> bool {
    let msg = err.to_string();
    msg.contains("duplicate column") || msg.contains("already exists")
}

/// Open (creating if missing) the private store for one session.
pub async fn create_session_pool(data_dir: &Path, session_id: &str) -> AppResult<SqlitePool> {
    let file_name: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if file_name.is_empty() {
        return Err(AppError::Validation("Invalid session id".into()));
    }

    let path = data_dir.join(format!("{file_name}.db"));
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
        .map_err(AppError::Database)?;

    debug!(session_id, path = %path.display(), "Opened session store");
    Ok(pool)
}

/// In-memory store for tests. A single connection is mandatory: every
/// connection to `sqlite::memory:` is a distinct database.
pub async fn create_memory_pool() -> AppResult<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(AppError::Database)
}

/// Bring the store up to the latest schema. Must run before any other access.
pub async fn run_migrations(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _schema_migrations (
             id INTEGER PRIMARY KEY,
             applied_at INTEGER NOT NULL
         )",
    )
    .execute(pool)
    .await?;

    let applied: Vec<i64> = sqlx::query_scalar("SELECT id FROM _schema_migrations")
        .fetch_all(pool)
        .await?;

    for (id, sql) in MIGRATIONS {
        if applied.contains(id) {
            continue;
        }

        match sqlx::raw_sql(sql).execute(pool).await {
            Ok(_) => {}
            Err(e) if is_already_applied(&e) => {
                debug!(migration = id, "Migration effect already present");
            }
            Err(e) => return Err(AppError::Database(e)),
        }

        sqlx::query("INSERT INTO _schema_migrations (id, applied_at) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING")
            .bind(id)
            .bind(now_ms())
            .execute(pool)
            .await?;

        info!(migration = id, "Applied schema migration");
    }

    Ok(())
}
