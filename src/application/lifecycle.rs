use crate::application::DependencyContainer;
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Manages application lifecycle events and graceful shutdown
pub struct ApplicationLifecycle {
    container: Arc<DependencyContainer>,
}

impl ApplicationLifecycle {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// Initialize the application
    pub async fn initialize(&self) -> Result<()> {
        info!("🚀 Initializing application...");

        self.container.config.validate()?;

        if !self.container.health_check().await? {
            return Err(anyhow::anyhow!("Initial health check failed"));
        }

        info!("✅ Application initialized successfully");
        Ok(())
    }

    /// Load schedules (when configured) and keep running until a shutdown signal
    pub async fn run_daemon(&self) -> Result<()> {
        if self.container.config.scheduler.load_on_startup {
            let report = self.container.engine.load_all_schedules().await?;
            if !report.failed.is_empty() {
                warn!(failed = ?report.failed, "Some profiles could not be scheduled");
            }
        } else {
            info!("Schedule loading on startup is disabled");
        }

        info!("Backup daemon running; press Ctrl+C to stop");
        self.wait_for_shutdown().await;
        Ok(())
    }

    /// Graceful shutdown
    pub async fn shutdown(&self) -> Result<()> {
        info!("🛑 Initiating graceful shutdown...");

        if let Err(e) = self.container.engine.shutdown().await {
            error!("Error stopping backup engine: {}", e);
        }
        self.container.db_pool.close().await;

        info!("🎉 Graceful shutdown completed");
        Ok(())
    }

    /// Wait for shutdown signals
    pub async fn wait_for_shutdown(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install terminate signal handler: {}", e);
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");
    }
}
