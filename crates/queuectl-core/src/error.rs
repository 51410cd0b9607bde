//! The stable error taxonomy shared by every persistence backend and by the
//! operational API (`spec.md` §7).

use thiserror::Error;

/// Errors returned by [`crate::store::JobStore`], [`crate::store::ConfigStore`]
/// and the umbrella operational API.
///
/// Each variant corresponds to one row of the error taxonomy table. Callers
/// are expected to match on this enum rather than inspect its `Display`
/// output; the taxonomy is part of the crate's contract and is held stable
/// across backends.
#[derive(Debug, Error)]
pub enum QueuectlError {
    /// Enqueue was called with an `id` that already exists.
    #[error("job id already exists: {0}")]
    DuplicateId(String),

    /// A required field was missing or malformed (empty id/command, bad
    /// timestamp, non-positive config value where one is required, etc).
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// The operation referenced a job id that does not exist.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The requested transition is not legal for the row's current state
    /// (e.g. DLQ-retrying a job that isn't dead).
    #[error("invalid state transition: {0}")]
    InvalidState(String),

    /// A transient write conflict (SQLite busy/locked). Callers that see
    /// this after the store's own bounded internal retry has already run
    /// should treat it like any other transient failure.
    #[error("store busy, retry later")]
    StoreBusy(#[source] sqlx::Error),

    /// An unrecoverable store error: corruption, disk full, schema
    /// mismatch. The supervisor treats this as fatal and exits nonzero.
    #[error("store error")]
    StoreFatal(#[source] sqlx::Error),

    /// The job's command could not be spawned at all.
    #[error("failed to spawn command: {0}")]
    ExecSpawnError(String),

    /// The job's wall-clock timeout elapsed before the command finished.
    #[error("command timed out after {0}s")]
    ExecTimeout(u64),

    /// The job's command ran to completion with a non-zero exit code.
    #[error("command exited with status {0}")]
    ExecNonzero(i32),
}

impl QueuectlError {
    /// Classify a raw `sqlx::Error` as [`QueuectlError::StoreBusy`] when it
    /// represents a transient SQLite busy/locked condition, or
    /// [`QueuectlError::StoreFatal`] otherwise.
    ///
    /// SQLite reports contention as error code `5` (`SQLITE_BUSY`) or `6`
    /// (`SQLITE_LOCKED`) in the driver-reported database error code.
    pub fn classify_store_error(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if let Some(code) = db_err.code() {
                if code == "5" || code == "6" {
                    return QueuectlError::StoreBusy(err);
                }
            }
        }
        QueuectlError::StoreFatal(err)
    }

    /// True for a transient write conflict that a caller may reasonably
    /// retry after a short backoff, rather than surface immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueuectlError::StoreBusy(_))
    }

    /// True for errors that a worker should record as an attempt failure
    /// and feed into the retry state machine (§4.5), rather than surface.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            QueuectlError::ExecSpawnError(_)
                | QueuectlError::ExecTimeout(_)
                | QueuectlError::ExecNonzero(_)
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, QueuectlError>;
