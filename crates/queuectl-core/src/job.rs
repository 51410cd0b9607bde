//! The `Job` data model (`spec.md` §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A job's lifecycle state.
///
/// `spec.md` notes that a transient `failed` state appears in some prior
/// documentation but is not persisted here: a retriable failure is written
/// directly back as `Pending`. This enum therefore has exactly the four
/// persisted states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "processing" => Some(JobState::Processing),
            "completed" => Some(JobState::Completed),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }
}

/// A durable job row, as stored by any `JobStore` implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub priority: i64,
    pub attempts: i64,
    pub max_retries: i64,
    pub timeout_seconds: Option<i64>,
    pub next_run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stdout_path: String,
    pub stderr_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Check the invariants of `spec.md` §3 that are meaningful to assert
    /// on a single in-memory row (the uniqueness and attempts-cap invariants
    /// are necessarily enforced by the store, not here). Used by tests and
    /// by the store after each write in debug builds.
    pub fn check_invariants(&self) -> Result<(), String> {
        let locked = self.locked_by.is_some() && self.locked_at.is_some();
        let half_locked = self.locked_by.is_some() != self.locked_at.is_some();
        if half_locked {
            return Err(format!(
                "job {}: locked_by/locked_at must be both-or-neither null",
                self.id
            ));
        }
        match self.state {
            JobState::Processing if !locked => {
                return Err(format!(
                    "job {}: processing state requires lock fields set",
                    self.id
                ));
            }
            JobState::Pending | JobState::Completed | JobState::Dead if locked => {
                return Err(format!(
                    "job {}: terminal/pending state must not hold a lock",
                    self.id
                ));
            }
            _ => {}
        }
        if self.attempts > self.max_retries + 1 {
            return Err(format!(
                "job {}: attempts {} exceeds max_retries+1 {}",
                self.id,
                self.attempts,
                self.max_retries + 1
            ));
        }
        Ok(())
    }
}

/// The caller-supplied description of a new job (`spec.md` §6.1, §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub command: String,
    pub max_retries: Option<i64>,
    pub priority: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub run_at: Option<DateTime<Utc>>,
}

/// Optional state filter for `List`/`CountByState` (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateFilter(pub Option<JobState>);

impl From<Option<JobState>> for StateFilter {
    fn from(s: Option<JobState>) -> Self {
        StateFilter(s)
    }
}

/// Snapshot counts by state, used by `Status()` (`spec.md` §6.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub dead: i64,
}

impl StateCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.dead
    }
}

/// The outcome of one executed attempt, as reported by the executor to the
/// worker (`spec.md` §4.6). The executor never mutates the job row itself;
/// this value is what the worker feeds into the retry/terminal transition.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Command exited 0.
    Success,
    /// Command exited non-zero, timed out, or failed to spawn. `message` is
    /// stored verbatim as `last_error`.
    Failure { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(state: JobState, locked: bool) -> Job {
        let now = Utc::now();
        Job {
            id: "a".into(),
            command: "echo hi".into(),
            state,
            priority: 0,
            attempts: 0,
            max_retries: 3,
            timeout_seconds: None,
            next_run_at: now,
            locked_by: locked.then(|| "w1".to_string()),
            locked_at: locked.then_some(now),
            last_error: None,
            stdout_path: "a_out.txt".into(),
            stderr_path: "a_err.txt".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn processing_without_lock_is_invalid() {
        assert!(sample(JobState::Processing, false).check_invariants().is_err());
    }

    #[test]
    fn pending_with_lock_is_invalid() {
        assert!(sample(JobState::Pending, true).check_invariants().is_err());
    }

    #[test]
    fn processing_with_lock_is_valid() {
        assert!(sample(JobState::Processing, true).check_invariants().is_ok());
    }

    #[test]
    fn attempts_over_cap_is_invalid() {
        let mut j = sample(JobState::Dead, false);
        j.attempts = j.max_retries + 2;
        assert!(j.check_invariants().is_err());
    }
}
