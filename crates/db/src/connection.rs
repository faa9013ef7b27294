use std::time::Duration;

use fundflow_core::config::DatabaseConfig;
use sqlx::sqlite::SqlitePoolOptions;
use thiserror::Error;

pub type DbPool = sqlx::SqlitePool;

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 5, 30).await
}

pub async fn connect_from_config(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(&config.url, config.max_connections, config.timeout_secs).await
}

/// Opens a pool with foreign keys enforced and a busy timeout, so writers queue on the SQLite
/// lock instead of failing immediately.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("database probe timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    #[error("database probe failed: {0}")]
    Failed(String),
}

/// Round-trips `SELECT 1` under `timeout`. Used by health checks and `doctor`.
pub async fn probe(pool: &DbPool, timeout: Duration) -> Result<(), ProbeError> {
    match tokio::time::timeout(timeout, sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool))
        .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(error)) => Err(ProbeError::Failed(error.to_string())),
        Err(_) => Err(ProbeError::TimedOut(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fundflow_core::config::DatabaseConfig;

    use super::{connect_from_config, probe};

    #[tokio::test]
    async fn probe_succeeds_against_in_memory_pool() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            timeout_secs: 5,
        };
        let pool = connect_from_config(&config).await.expect("connect");

        probe(&pool, Duration::from_secs(1)).await.expect("probe");
    }

    #[tokio::test]
    async fn probe_reports_closed_pool() {
        let pool = super::connect_with_settings("sqlite::memory:", 1, 1).await.expect("connect");
        pool.close().await;

        let error = probe(&pool, Duration::from_secs(1)).await.expect_err("closed pool");
        assert!(error.to_string().contains("database probe"));
    }
}
