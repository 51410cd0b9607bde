//! Storage-backend-agnostic traits implemented by `queuectl-store`
//! (`spec.md` §4.1, §4.3, §4.4, §4.5).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::ConfigKey;
use crate::error::Result;
use crate::job::{AttemptOutcome, Job, JobSpec, JobState, StateCounts};

/// Result of a claim attempt (`spec.md` §4.4).
#[derive(Debug)]
pub enum ClaimOutcome {
    /// A job was claimed and transitioned to `processing`.
    Claimed(Job),
    /// No claimable job was found (or contention exhausted the bounded
    /// retry budget); the worker should idle.
    Empty,
}

/// CRUD and query operations over the job table, plus the atomic claim
/// protocol that is the concurrency core of the whole system.
///
/// Implementations MUST provide the correctness guarantee of `spec.md`
/// §4.4: for any job row, at most one caller's `claim` ever observes that
/// row transition into `processing`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Idempotently create schema if absent.
    async fn init(&self) -> Result<()>;

    /// Insert a new `pending` row. `DuplicateId` if `spec.id` already
    /// exists; `InvalidArg` if `id` or `command` are empty.
    async fn enqueue(&self, spec: JobSpec, default_max_retries: i64) -> Result<Job>;

    /// Read-only selection, ordered `priority ASC, next_run_at ASC, id ASC`.
    async fn list(&self, state: Option<JobState>, limit: Option<i64>) -> Result<Vec<Job>>;

    /// Snapshot counts by state.
    async fn count_by_state(&self) -> Result<StateCounts>;

    /// Fetch a single row by id, if present.
    async fn get(&self, id: &str) -> Result<Option<Job>>;

    /// Atomically claim the next ready job for `worker_id`, or `Empty` if
    /// none is available (or contention exhausted the retry budget).
    async fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> Result<ClaimOutcome>;

    /// Apply the post-attempt transition of `spec.md` §4.5: increments
    /// `attempts` by one and writes either `completed`, a retry `pending`
    /// with a computed `next_run_at`, or terminal `dead`, depending on
    /// `outcome`, `max_retries`, `backoff_base` and `now`.
    async fn finish_attempt(
        &self,
        id: &str,
        outcome: AttemptOutcome,
        backoff_base: i64,
        now: DateTime<Utc>,
    ) -> Result<Job>;

    /// Reset a `dead` row back to `pending`. `NotFound` if missing,
    /// `InvalidState` if not currently `dead`.
    async fn retry_from_dlq(&self, id: &str, now: DateTime<Utc>) -> Result<Job>;

    /// `RetryFromDLQ` applied to every row currently `dead`; returns the
    /// count of rows retried.
    async fn retry_all_from_dlq(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Move every `processing` row whose `locked_at` predates `threshold`
    /// back to `pending`, clearing lock fields. Returns rows affected.
    async fn recover_stale_locks(&self, threshold: DateTime<Utc>) -> Result<u64>;
}

/// Durable scalar key/value config storage (`spec.md` §2.3, §3 Config
/// entry).
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Seed default values for any recognized key not already present.
    async fn seed_defaults(&self) -> Result<()>;

    /// Current value of `key`, falling back to its documented default if
    /// the row is absent.
    async fn get(&self, key: ConfigKey) -> Result<i64>;

    /// Validate and durably write `value` for `key`.
    async fn set(&self, key: ConfigKey, value: i64) -> Result<()>;

    /// All recognized keys with their current values, for `ConfigGet(None)`.
    async fn get_all(&self) -> Result<Vec<(ConfigKey, i64)>>;
}
