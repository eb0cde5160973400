//! Shared persistent state: per-day quota counters and per-user rate windows.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS api_requests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model TEXT NOT NULL,
        utc_date TEXT NOT NULL,
        request_count INTEGER NOT NULL DEFAULT 0,
        UNIQUE(model, utc_date)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_rate_limits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        request_time INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_api_requests_date ON api_requests(utc_date)",
    "CREATE INDEX IF NOT EXISTS idx_user_rate_limits_user ON user_rate_limits(user_id, request_time)",
];

/// Opens (creating if needed) the sqlite database at `path` and applies the schema.
pub async fn open(path: &Path, max_connections: u32) -> Result<SqlitePool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    info!(path = %path.display(), "state database ready");
    Ok(pool)
}

/// Single-connection in-memory database; the connection is pinned so the data survives.
pub async fn in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let pool = in_memory().await.unwrap();
        migrate(&pool).await.unwrap();
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["api_requests", "user_rate_limits"]);
    }

    #[tokio::test]
    async fn open_creates_database_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("data").join("state.db");
        let pool = open(&path, 2).await.unwrap();
        assert!(path.exists());
        pool.close().await;
    }
}
