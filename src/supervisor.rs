//! Managed pool for detached backup executions.
//!
//! Scheduled fires and manual triggers are spawned here instead of on bare
//! `tokio::spawn`, so the process can bound how many runs execute at once,
//! survive a panicking run, and wait for in-flight runs on shutdown.

use crate::backup::{BackupError, Result};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct RunSupervisor {
    tasks: Mutex<JoinSet<()>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    shutdown_grace: Duration,
}

impl Default for RunSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_RUNS, DEFAULT_SHUTDOWN_GRACE)
    }
}

impl RunSupervisor {
    pub fn new(max_concurrent_runs: usize, shutdown_grace: Duration) -> Self {
        Self {
            tasks: Mutex::new(JoinSet::new()),
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            closed: AtomicBool::new(false),
            shutdown_grace,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tasks accepted and not yet reaped, whether running or waiting for a permit.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        reap(&mut tasks);
        tasks.len()
    }

    /// Spawn `task` once a concurrency permit is available.
    pub fn submit<F>(&self, label: impl Into<String>, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(BackupError::ShuttingDown);
        }

        let label = label.into();
        let permits = Arc::clone(&self.permits);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        reap(&mut tasks);

        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!(task = %label, "Supervisor closed before task started");
                return;
            };
            debug!(task = %label, "Task started");
            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                error!(task = %label, "Backup task panicked");
            }
        });
        Ok(())
    }

    /// Stop accepting work and wait up to the grace period for accepted tasks.
    /// Returns how many tasks were aborted because the grace period ran out.
    pub async fn shutdown(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let mut tasks =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if tasks.is_empty() {
            return 0;
        }
        info!(in_flight = tasks.len(), grace = ?self.shutdown_grace, "Waiting for in-flight backup runs");

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_ok() {
            info!("All backup runs finished");
            return 0;
        }

        let remaining = tasks.len();
        warn!(
            remaining,
            "Grace period elapsed; aborting backup runs still in flight (their records stay 'running')"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        remaining
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        log_join(joined);
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Supervised task panicked");
        } else {
            debug!(error = %e, "Supervised task cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_submitted_task_runs() {
        let supervisor = RunSupervisor::default();
        let (tx, rx) = oneshot::channel();
        supervisor
            .submit("one", async move {
                let _ = tx.send(42);
            })
            .unwrap();
        assert_eq!(rx.await.unwrap(), 42);
        assert_eq!(supervisor.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let supervisor = RunSupervisor::new(2, Duration::from_secs(5));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            supervisor
                .submit(format!("task-{i}"), async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert_eq!(supervisor.shutdown().await, 0);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let supervisor = RunSupervisor::new(1, Duration::from_secs(5));
        supervisor
            .submit("boom", async { panic!("backup exploded") })
            .unwrap();

        let (tx, rx) = oneshot::channel();
        supervisor
            .submit("after", async move {
                let _ = tx.send(());
            })
            .unwrap();
        rx.await.unwrap();

        assert_eq!(supervisor.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_then_rejects() {
        let supervisor = RunSupervisor::new(4, Duration::from_secs(5));
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        supervisor
            .submit("slow", async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(supervisor.shutdown().await, 0);
        assert!(done.load(Ordering::SeqCst));
        assert!(supervisor.is_closed());
        assert!(matches!(
            supervisor.submit("late", async {}),
            Err(BackupError::ShuttingDown)
        ));
        assert_eq!(supervisor.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_grace_period_bounds_shutdown() {
        let supervisor = RunSupervisor::new(4, Duration::from_millis(20));
        supervisor
            .submit("stuck", std::future::pending::<()>())
            .unwrap();
        assert_eq!(supervisor.shutdown().await, 1);
    }
}
