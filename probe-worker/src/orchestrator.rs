//! The lifecycle orchestrator: startup sequencing, signal handling,
//! graceful shutdown, and once-mode. Everything else in this crate is a
//! passive component the orchestrator wires together and drives.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use health::HealthRegistry;
use probe_common::MonitorConfig;
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::pool::{ReqwestRunner, WorkerPool};
use crate::scheduler::Scheduler;
use crate::store::{spawn_periodic_writer, ResultStore};

pub struct Orchestrator {
    scheduler: Arc<Scheduler>,
    pool: Arc<WorkerPool>,
    store: Arc<ResultStore>,
    writer: tokio::task::JoinHandle<()>,
    shutdown_deadline: Duration,
}

impl Orchestrator {
    /// Runs the startup sequence: load config, register health, build the
    /// store/pool/scheduler, schedule every service, spawn the periodic
    /// writer. Configuration failures are the caller's responsibility to
    /// turn into an exit(1); this function only returns `Err` for that
    /// class of failure.
    pub async fn startup(config_path: &Path, liveness: &HealthRegistry, config: &crate::config::Config) -> Result<Self, WorkerError> {
        let monitor_config = MonitorConfig::load(config_path)?;
        let service_configs = monitor_config.service_configs();

        let worker_liveness = liveness
            .register("scheduler".to_string(), time::Duration::seconds(120))
            .await;
        let store_liveness = liveness
            .register("result_store_writer".to_string(), time::Duration::seconds(120))
            .await;

        let store = ResultStore::new(config.snapshot_path.clone(), config.append_log_path.clone())?;

        for service in &service_configs {
            store.register(&service.name, service.expected_status, service.tags.clone());
        }

        let retry_policy = probe_common::RetryPolicy::new(
            monitor_config.settings.max_retries,
        );
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client with no-redirect policy is always constructible");
        let runner = Arc::new(ReqwestRunner::new(client, retry_policy));
        let pool = WorkerPool::new(monitor_config.settings.worker_pool_size, runner);

        let scheduler = Scheduler::new(pool.clone(), store.clone(), worker_liveness);
        for service in service_configs {
            scheduler
                .schedule(Arc::new(service))
                .await
                .expect("scheduler just started, schedule() cannot fail yet");
        }

        let writer = spawn_periodic_writer(
            store.clone(),
            Duration::from_secs(config.snapshot_interval_secs),
            store_liveness,
        );

        Ok(Self {
            scheduler,
            pool,
            store,
            writer,
            shutdown_deadline: Duration::from_secs(config.shutdown_deadline_secs),
        })
    }

    /// Start the scheduler and block until a shutdown signal arrives, then
    /// run the graceful shutdown sequence. A signal arriving while shutdown
    /// is already underway is logged and otherwise ignored — the sequence
    /// below runs exactly once.
    pub async fn run_until_signal(self) {
        self.scheduler.start().await.expect("scheduler starts exactly once at startup");

        wait_for_shutdown_signal().await;
        info!("shutdown signal received, beginning graceful shutdown");

        let repeat_signal_guard = tokio::spawn(async {
            loop {
                wait_for_shutdown_signal().await;
                warn!("shutdown already in progress, ignoring repeated signal");
            }
        });

        self.shutdown().await;
        repeat_signal_guard.abort();
    }

    /// Once-mode: identical through startup, then a single scheduling pass
    /// instead of `start()`, one final write, then shutdown.
    pub async fn run_once(self) {
        if let Err(error) = self.scheduler.run_once().await {
            error!(error = %error, "runOnce failed");
        }
        self.shutdown().await;
    }

    async fn shutdown(self) {
        let started_at = std::time::Instant::now();

        self.writer.abort();
        if let Err(error) = self.store.write_snapshot() {
            error!(error = %error, "final snapshot write failed");
        }

        if let Err(error) = self.scheduler.stop(self.shutdown_deadline).await {
            warn!(error = %error, "scheduler did not stop cleanly");
        }
        self.scheduler.join().await;

        let remaining = self.shutdown_deadline.saturating_sub(started_at.elapsed());
        self.pool.shutdown(remaining).await;
        info!("shutdown complete");
    }
}

/// Waits for SIGTERM/SIGINT (or Ctrl-C on platforms without Unix signals).
/// This function only ever resolves once, so a second signal arriving
/// while already shutting down has no separate handler to race against.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
