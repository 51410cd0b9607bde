//! The supervisor (`spec.md` §4.8): startup recovery, worker pool launch,
//! periodic stale-lock sweeping, and signal-driven graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use dashmap::DashSet;
use queuectl_core::{Clock, ConfigKey, ConfigStore, JobStore, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::worker::{Worker, WorkerOutcome};

/// Builds and launches a worker pool against a shared store and config.
pub struct Supervisor {
    store: Arc<dyn JobStore>,
    config: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
}

impl Supervisor {
    pub fn new(store: Arc<dyn JobStore>, config: Arc<dyn ConfigStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock }
    }

    /// Run the startup sequence of `spec.md` §4.8 and launch `worker_count`
    /// worker tasks. `drain` puts every worker in stop-when-empty mode.
    pub async fn start(self, worker_count: usize, drain: bool) -> Result<SupervisorHandle> {
        self.store.init().await?;
        self.config.seed_defaults().await?;

        let stale_secs = self.config.get(ConfigKey::StaleLockSeconds).await?;
        let threshold = self.clock.now() - ChronoDuration::seconds(stale_secs);
        let reclaimed = self.store.recover_stale_locks(threshold).await?;
        tracing::info!(reclaimed, "startup stale-lock recovery");

        let stopping = CancellationToken::new();
        let active: Arc<DashSet<String>> = Arc::new(DashSet::new());

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let id = queuectl_core::generate_worker_id(index);
            active.insert(id.clone());
            let worker = Worker {
                id: id.clone(),
                store: self.store.clone(),
                config: self.config.clone(),
                clock: self.clock.clone(),
                stopping: stopping.clone(),
                drain,
            };
            let active_for_task = active.clone();
            workers.push(tokio::spawn(async move {
                let outcome = worker.run().await;
                active_for_task.remove(&id);
                outcome
            }));
        }

        let sweeper = tokio::spawn(sweep_loop(
            self.store.clone(),
            self.config.clone(),
            self.clock.clone(),
            stopping.clone(),
        ));
        let signal_task = tokio::spawn(wait_for_signal(stopping.clone()));

        tracing::info!(worker_count, drain, "supervisor started");

        Ok(SupervisorHandle {
            workers,
            sweeper,
            signal_task,
            stopping,
            active,
        })
    }
}

/// A running pool: worker join handles, the periodic sweeper, the
/// signal-listening task, and the shared stop flag.
pub struct SupervisorHandle {
    workers: Vec<JoinHandle<WorkerOutcome>>,
    sweeper: JoinHandle<()>,
    signal_task: JoinHandle<()>,
    stopping: CancellationToken,
    active: Arc<DashSet<String>>,
}

impl SupervisorHandle {
    /// Request a graceful stop: workers finish their in-flight attempt and
    /// exit on their next loop head.
    pub fn stop(&self) {
        self.stopping.cancel();
    }

    /// Number of worker tasks that have not yet returned. Backs
    /// `Status().workers_active` (`spec.md` §6.1).
    pub fn active_worker_count(&self) -> usize {
        self.active.len()
    }

    /// Wait for every worker to exit (on drain quiescence or on `stop()`),
    /// then tear down the background sweeper and signal listener.
    pub async fn join(self) -> Vec<WorkerOutcome> {
        let results = futures::future::join_all(self.workers).await;
        self.sweeper.abort();
        self.signal_task.abort();
        results.into_iter().filter_map(|r| r.ok()).collect()
    }
}

async fn sweep_loop(
    store: Arc<dyn JobStore>,
    config: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    stopping: CancellationToken,
) {
    loop {
        let stale_secs = config.get(ConfigKey::StaleLockSeconds).await.unwrap_or(300);
        let interval = Duration::from_secs((stale_secs.max(2) as u64) / 2);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stopping.cancelled() => return,
        }
        let threshold = clock.now() - ChronoDuration::seconds(stale_secs);
        match store.recover_stale_locks(threshold).await {
            Ok(n) if n > 0 => tracing::info!(reclaimed = n, "periodic stale-lock sweep reclaimed jobs"),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "periodic stale-lock sweep failed"),
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal(stopping: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT, draining"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, draining"),
        _ = stopping.cancelled() => return,
    }
    stopping.cancel();
}

#[cfg(not(unix))]
async fn wait_for_signal(stopping: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    stopping.cancel();
}
