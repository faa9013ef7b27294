use std::sync::Arc;
use std::time::Duration;

use fundflow_core::audit::RingBufferAuditSink;
use fundflow_core::cache::CachedDirectory;
use fundflow_core::config::{AppConfig, ConfigError};
use fundflow_core::lookup::FallbackDirectory;
use fundflow_db::repositories::{RepositoryError, SqlDirectoryRepository, SqlWorkflowRepository};
use fundflow_db::{
    connect_from_config, migrations, ApprovalService, DbPool, RetryPolicy, ServiceParts,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::notifier::TracingDispatcher;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: Arc<ApprovalService>,
    pub audit: RingBufferAuditSink,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("directory snapshot failed: {0}")]
    DirectorySnapshot(#[source] RepositoryError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        max_connections = config.database.max_connections,
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let sql_directory = SqlDirectoryRepository::new(db_pool.clone());
    let snapshot = sql_directory.snapshot().await.map_err(BootstrapError::DirectorySnapshot)?;
    let directory = FallbackDirectory::new(
        CachedDirectory::new(
            sql_directory.clone(),
            Duration::from_secs(config.directory_cache.ttl_secs),
            config.directory_cache.capacity,
        ),
        snapshot,
        config.workflow.lookup_timeouts(),
    );
    info!(
        event_name = "system.bootstrap.directory_ready",
        correlation_id = "bootstrap",
        cache_ttl_secs = config.directory_cache.ttl_secs,
        cache_capacity = config.directory_cache.capacity,
        "approver directory initialized"
    );

    let audit = RingBufferAuditSink::new(config.audit.buffer_capacity);
    let parts = ServiceParts {
        workflows: Arc::new(SqlWorkflowRepository::new(db_pool.clone())),
        directory: Arc::new(directory),
        delegations: Arc::new(sql_directory),
        policy: config.workflow.resolution_policy,
        retry: RetryPolicy::from_config(&config.workflow),
        audit: Arc::new(audit.clone()),
        notifier: Arc::new(TracingDispatcher),
    };
    let service = Arc::new(ApprovalService::new(db_pool.clone(), parts));

    Ok(Application { config, db_pool, service, audit, shutdown: CancellationToken::new() })
}
