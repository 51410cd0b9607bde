//! # queuectl
//!
//! The operational API (`spec.md` §6.1) that wires the store, executor and
//! worker pool together: `Enqueue`, `List`, `Status`, `DLQList`,
//! `DLQRetry`, `DLQRetryAll`, `ConfigGet`, `ConfigSet`, `WorkerPoolStart`.
//! This crate is what an embedding CLI depends on; the CLI itself is out of
//! scope (`spec.md` §1).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use queuectl_core::{
    Clock, ConfigKey, ConfigStore, Job, JobSpec, JobState, JobStore, Result, StateCounts,
    SystemClock,
};
use queuectl_store::SqliteStore;
use queuectl_worker::{Supervisor, SupervisorHandle};

const DEFAULT_DB_PATH: &str = "./queuectl.db";
const DEFAULT_LOG_DIR: &str = "./logs";

/// Snapshot returned by [`Queue::status`] (`spec.md` §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub dead: i64,
    /// Workers currently running in a pool the caller started and handed
    /// back in; `0` if no handle is supplied. A `queuectl` deployment
    /// typically runs the worker pool and status queries as separate
    /// processes against the same database file, so this process has no
    /// general way to see another process's pool; callers that keep their
    /// [`SupervisorHandle`] in memory can pass it to see a live count.
    pub workers_active: usize,
}

impl From<StateCounts> for Status {
    fn from(c: StateCounts) -> Self {
        Status {
            total: c.total(),
            pending: c.pending,
            processing: c.processing,
            completed: c.completed,
            dead: c.dead,
            workers_active: 0,
        }
    }
}

/// A handle to the durable store, and the operational API over it.
pub struct Queue {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
}

impl Queue {
    /// Open (creating if absent) the SQLite store at `db_path`, writing
    /// per-job logs under `log_dir`.
    pub async fn open(db_path: impl AsRef<Path>, log_dir: impl AsRef<Path>) -> Result<Self> {
        let store = SqliteStore::connect(db_path.as_ref(), log_dir.as_ref().to_path_buf()).await?;
        Ok(Self {
            store,
            clock: Arc::new(SystemClock),
        })
    }

    /// Open using `QUEUECTL_DB_PATH`/`QUEUECTL_LOG_DIR` if set, else the
    /// documented defaults (`./queuectl.db`, `./logs`). Read once, at call
    /// time; there is no other environment surface (everything else flows
    /// through `ConfigGet`/`ConfigSet` against the store).
    pub async fn open_from_env() -> Result<Self> {
        let db_path: PathBuf = std::env::var("QUEUECTL_DB_PATH")
            .unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
            .into();
        let log_dir: PathBuf = std::env::var("QUEUECTL_LOG_DIR")
            .unwrap_or_else(|_| DEFAULT_LOG_DIR.to_string())
            .into();
        Self::open(db_path, log_dir).await
    }

    /// `InitStore()`: idempotent; creates schema and seeds default config.
    pub async fn init_store(&self) -> Result<()> {
        self.store.init().await?;
        self.store.seed_defaults().await?;
        Ok(())
    }

    /// `Enqueue(JobSpec)`. `max_retries` defaults from config when omitted.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<Job> {
        let default_max_retries = ConfigStore::get(&self.store, ConfigKey::MaxRetries).await?;
        self.store.enqueue(spec, default_max_retries).await
    }

    /// `List(state?, limit?)`.
    pub async fn list(&self, state: Option<JobState>, limit: Option<i64>) -> Result<Vec<Job>> {
        self.store.list(state, limit).await
    }

    /// `Status()`. `workers_active` is populated from `pool` when the caller
    /// supplies a live handle; see [`Status::workers_active`].
    pub async fn status(&self, pool: Option<&SupervisorHandle>) -> Result<Status> {
        let counts = self.store.count_by_state().await?;
        let mut status: Status = counts.into();
        if let Some(pool) = pool {
            status.workers_active = pool.active_worker_count();
        }
        Ok(status)
    }

    /// `DLQList()`: every job currently `dead`.
    pub async fn dlq_list(&self) -> Result<Vec<Job>> {
        self.store.list(Some(JobState::Dead), None).await
    }

    /// `DLQRetry(id)`.
    pub async fn dlq_retry(&self, id: &str) -> Result<Job> {
        self.store.retry_from_dlq(id, self.clock.now()).await
    }

    /// `DLQRetryAll()`: returns the count retried.
    pub async fn dlq_retry_all(&self) -> Result<u64> {
        self.store.retry_all_from_dlq(self.clock.now()).await
    }

    /// `ConfigGet(key?)`: all recognized keys if `key` is `None`.
    pub async fn config_get(&self, key: Option<ConfigKey>) -> Result<Vec<(ConfigKey, i64)>> {
        match key {
            Some(k) => {
                let v = ConfigStore::get(&self.store, k).await?;
                Ok(vec![(k, v)])
            }
            None => self.store.get_all().await,
        }
    }

    /// `ConfigSet(key, value)`.
    pub async fn config_set(&self, key: ConfigKey, value: i64) -> Result<()> {
        ConfigStore::set(&self.store, key, value).await
    }

    /// `WorkerPoolStart(count, drain)`: performs the supervisor's startup
    /// sequence (`spec.md` §4.8) and launches `count` workers. Returns a
    /// handle the caller uses to observe `workers_active`, request a stop,
    /// and join on completion; it does not block until drain/shutdown
    /// itself, so the caller decides whether to await the join immediately
    /// (blocking, matching "runs until signal or drain") or keep the handle
    /// around for concurrent status queries first.
    pub async fn start_worker_pool(&self, count: usize, drain: bool) -> Result<SupervisorHandle> {
        let store: Arc<dyn JobStore> = Arc::new(self.store.clone());
        let config: Arc<dyn ConfigStore> = Arc::new(self.store.clone());
        let supervisor = Supervisor::new(store, config, self.clock.clone());
        supervisor.start(count, drain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_init_enqueue_and_status_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(dir.path().join("q.db"), dir.path().join("logs"))
            .await
            .unwrap();
        queue.init_store().await.unwrap();

        queue
            .enqueue(JobSpec {
                id: "a".into(),
                command: "echo hi".into(),
                max_retries: None,
                priority: None,
                timeout_seconds: None,
                run_at: None,
            })
            .await
            .unwrap();

        let status = queue.status(None).await.unwrap();
        assert_eq!(status.total, 1);
        assert_eq!(status.pending, 1);
        assert_eq!(status.workers_active, 0);
    }

    #[tokio::test]
    async fn config_get_none_returns_all_keys() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(dir.path().join("q.db"), dir.path().join("logs"))
            .await
            .unwrap();
        queue.init_store().await.unwrap();

        let all = queue.config_get(None).await.unwrap();
        assert_eq!(all.len(), ConfigKey::ALL.len());
    }
}
