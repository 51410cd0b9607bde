//! The worker loop (`spec.md` §4.7): poll, claim, execute, apply transition.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use queuectl_core::{AttemptOutcome, ClaimOutcome, Clock, ConfigKey, ConfigStore, Job, JobStore};
use queuectl_executor::{execute, ExecutionRequest};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Bounded retries for applying the post-attempt transition against a
/// transiently busy store, on top of the store's own internal retry.
const FINISH_ATTEMPT_RETRIES: u32 = 3;

/// One long-running poll/claim/execute loop, identified to the store by
/// `id` so its claims and locks are attributable.
pub struct Worker {
    pub id: String,
    pub store: Arc<dyn JobStore>,
    pub config: Arc<dyn ConfigStore>,
    pub clock: Arc<dyn Clock>,
    pub stopping: CancellationToken,
    /// Drain mode (`stop-when-empty`): exit once the queue is quiescent
    /// instead of idling forever.
    pub drain: bool,
}

/// Why a worker's loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The shared `stopping` flag was observed set.
    Stopped,
    /// Drain mode and the queue snapshot was quiescent (`spec.md` §4.7,
    /// §9 drain quiescence).
    Drained,
}

impl Worker {
    pub async fn run(self) -> WorkerOutcome {
        loop {
            if self.stopping.is_cancelled() {
                return WorkerOutcome::Stopped;
            }

            let poll_interval = self.read_poll_interval().await;
            let now = self.clock.now();

            match self.store.claim(&self.id, now).await {
                Ok(ClaimOutcome::Claimed(job)) => {
                    self.run_attempt(job).await;
                }
                Ok(ClaimOutcome::Empty) => {
                    if self.drain && self.queue_is_quiescent().await {
                        return WorkerOutcome::Drained;
                    }
                    self.sleep_interruptible(poll_interval).await;
                }
                Err(e) => {
                    tracing::error!(worker = %self.id, error = %e, "claim failed");
                    self.sleep_interruptible(poll_interval).await;
                }
            }
        }
    }

    async fn read_poll_interval(&self) -> Duration {
        let secs = self.config.get(ConfigKey::PollInterval).await.unwrap_or_else(|e| {
            tracing::error!(worker = %self.id, error = %e, "failed to read poll_interval, using default of 1s");
            1
        });
        Duration::from_secs(secs.max(0) as u64)
    }

    async fn queue_is_quiescent(&self) -> bool {
        match self.store.count_by_state().await {
            Ok(counts) => counts.pending == 0 && counts.processing == 0,
            Err(_) => false,
        }
    }

    async fn sleep_interruptible(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stopping.cancelled() => {}
        }
    }

    async fn run_attempt(&self, job: Job) {
        let attempt_number = job.attempts + 1;
        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            attempt = attempt_number,
            worker = %self.id
        );
        self.run_attempt_inner(job, attempt_number).instrument(span).await
    }

    async fn run_attempt_inner(&self, job: Job, attempt_number: i64) {
        let backoff_base = self.config.get(ConfigKey::BackoffBase).await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to read backoff_base, using default of 2");
            2
        });

        let report = execute(ExecutionRequest {
            job_id: &job.id,
            command: &job.command,
            attempt: attempt_number,
            timeout_seconds: job.timeout_seconds,
            stdout_path: Path::new(&job.stdout_path),
            stderr_path: Path::new(&job.stderr_path),
        })
        .await;

        tracing::debug!(outcome = ?report.outcome, "attempt finished");
        self.apply_transition(&job.id, report.into_attempt_outcome(), backoff_base)
            .await;
    }

    async fn apply_transition(&self, id: &str, outcome: AttemptOutcome, backoff_base: i64) {
        let mut last_err = None;
        for attempt in 0..FINISH_ATTEMPT_RETRIES {
            let now = self.clock.now();
            match self
                .store
                .finish_attempt(id, outcome.clone(), backoff_base, now)
                .await
            {
                Ok(_) => return,
                Err(e) if e.is_transient() => {
                    tracing::debug!(job_id = %id, attempt, error = %e, "store busy applying transition, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(20 * (attempt as u64 + 1))).await;
                }
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "failed to apply transition");
                    return;
                }
            }
        }
        tracing::error!(
            job_id = %id,
            error = ?last_err,
            "exhausted retries applying transition; leaving row for stale-lock recovery"
        );
    }
}
