use crate::{
    backup::{ConfigStore, PostgresStore, RunStore},
    engine::BackupEngine,
    remote::{RemoteConnector, SshConnector},
    Config,
};
use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Dependency injection container for the application
pub struct DependencyContainer {
    // Core configuration
    pub config: Config,

    // Database layer
    pub db_pool: Arc<PgPool>,

    // Repository layer
    pub store: Arc<PostgresStore>,

    // Service layer
    pub engine: Arc<BackupEngine>,
}

impl DependencyContainer {
    pub async fn new() -> Result<Self> {
        let config = Config::from_env()?;
        Self::with_config(config).await
    }

    pub async fn with_config(config: Config) -> Result<Self> {
        info!("🔧 Initializing dependency container...");
        info!(database = %config.safe_database_url(), "Connecting to database");

        let db_pool = Arc::new(
            create_pool(&config.database_url, config.operational.max_db_connections).await?,
        );
        let store = Arc::new(PostgresStore::new(db_pool.clone()));

        let connector: Arc<dyn RemoteConnector> = Arc::new(SshConnector::new(config.ssh.clone()));
        let config_store: Arc<dyn ConfigStore> = store.clone();
        let run_store: Arc<dyn RunStore> = store.clone();
        let engine = Arc::new(
            BackupEngine::new(config_store, run_store, connector, &config.backup).await?,
        );

        info!("✅ Dependency container initialized");
        Ok(Self {
            config,
            db_pool,
            store,
            engine,
        })
    }

    /// Check that the database answers
    pub async fn health_check(&self) -> Result<bool> {
        let row: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(self.db_pool.as_ref())
            .await?;
        Ok(row.0 == 1)
    }
}

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Some(Duration::from_secs(300)))
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;
    Ok(pool)
}
