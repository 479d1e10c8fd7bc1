//! Split reader/writer SQLite pools in WAL mode.

use crate::config::StoreConfig;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite connection pools for the job store.
///
/// Every write goes through `writer`, which holds one connection, so
/// transactions on job rows never contend with each other. `reader` holds
/// `StoreConfig::max_readers` read-only connections.
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Opens the database at `database_url` with the default pool settings.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::with_config(database_url, &StoreConfig::default()).await
    }

    /// Opens both pools with the sizes and timeouts of `config`.
    ///
    /// The schema is brought up to date on the writer before any reader
    /// connects, so readers never observe a partially migrated database.
    pub async fn with_config(database_url: &str, config: &StoreConfig) -> Result<Self, sqlx::Error> {
        let connect = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout())
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect.clone())
            .await?;
        MIGRATOR.run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(config.max_readers.max(1))
            .connect_with(connect.read_only(true))
            .await?;

        Ok(Self { reader, writer })
    }

    /// Closes both pools, waiting for checked out connections.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database_url(dir: &tempfile::TempDir) -> String {
        format!("sqlite://{}?mode=rwc", dir.path().join("jobs.db").display())
    }

    #[tokio::test]
    async fn test_pool_creates_tables_in_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&database_url(&dir)).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('jobs', 'job_tasks') ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(names, vec!["job_tasks", "jobs"]);

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        pool.close().await;
    }

    #[tokio::test]
    async fn test_pool_sizes_follow_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            max_readers: 2,
            busy_timeout_ms: 250,
            ..StoreConfig::default()
        };
        let pool = DatabasePool::with_config(&database_url(&dir), &config)
            .await
            .unwrap();

        assert_eq!(pool.reader.options().get_max_connections(), 2);
        assert_eq!(pool.writer.options().get_max_connections(), 1);

        let (timeout,): (i64,) = sqlx::query_as("PRAGMA busy_timeout")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(timeout, 250);

        let write = sqlx::query("CREATE TABLE scratch (id INTEGER)")
            .execute(&pool.reader)
            .await;
        assert!(write.is_err());

        pool.close().await;
    }
}
