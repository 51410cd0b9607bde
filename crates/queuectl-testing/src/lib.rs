//! # queuectl-testing
//!
//! Shared test utilities: a fake clock that tests can advance by hand, and
//! a scratch SQLite store builder so every crate's integration tests open
//! their own throwaway database file instead of sharing global state.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use queuectl_core::Clock;
use queuectl_store::SqliteStore;

/// A clock tests can move forward explicitly, instead of sleeping real
/// wall-clock time to exercise backoff/timeout/stale-lock behavior.
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, delta: Duration) {
        let mut guard = self.now.lock().unwrap();
        *guard += delta;
    }

    pub fn advance_seconds(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// A scratch SQLite-backed store plus the temp directory it lives in. The
/// directory is removed when this value is dropped, so tests get automatic
/// cleanup as long as they hold it for their full duration.
pub struct ScratchStore {
    pub store: SqliteStore,
    _dir: tempfile::TempDir,
}

impl ScratchStore {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir for scratch store");
        let db_path = dir.path().join("queuectl.db");
        let log_dir = dir.path().join("logs");
        let store = SqliteStore::connect(&db_path, log_dir)
            .await
            .expect("open scratch sqlite store");
        queuectl_core::JobStore::init(&store)
            .await
            .expect("init scratch store schema");
        Self { store, _dir: dir }
    }

    pub fn log_dir(&self) -> PathBuf {
        self._dir.path().join("logs")
    }
}

/// Build a minimal valid [`queuectl_core::JobSpec`] for tests, with every
/// optional field left at its default so tests only set what they care
/// about.
pub fn spec(id: &str, command: &str) -> queuectl_core::JobSpec {
    queuectl_core::JobSpec {
        id: id.to_string(),
        command: command.to_string(),
        max_retries: None,
        priority: None,
        timeout_seconds: None,
        run_at: None,
    }
}
