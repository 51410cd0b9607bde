//! # queuectl-executor
//!
//! The subprocess execution harness (`spec.md` §4.6): for one claimed job,
//! spawn the command via the host shell in its own process group, capture
//! stdout/stderr to the job's log files, and enforce a wall-clock timeout by
//! signalling the whole group. The executor never touches the job row; it
//! only reports what happened back to the caller.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration as StdDuration;

use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use queuectl_core::AttemptOutcome;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

/// Grace period between the terminate signal and the kill signal on timeout.
const KILL_GRACE: StdDuration = StdDuration::from_secs(2);

/// What the executor asked the shell to do.
pub struct ExecutionRequest<'a> {
    pub job_id: &'a str,
    pub command: &'a str,
    pub attempt: i64,
    pub timeout_seconds: Option<i64>,
    pub stdout_path: &'a Path,
    pub stderr_path: &'a Path,
}

/// The coarse result tag returned alongside the diagnostic message
/// (`spec.md` §4.6 point 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeTag {
    Ok,
    Nonzero,
    Timeout,
    SpawnError,
}

/// Full result of one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: OutcomeTag,
    pub exit_code: Option<i32>,
    pub message: String,
}

impl ExecutionReport {
    /// Fold the report down to the two-way split the retry/backoff state
    /// machine cares about.
    pub fn into_attempt_outcome(self) -> AttemptOutcome {
        match self.outcome {
            OutcomeTag::Ok => AttemptOutcome::Success,
            _ => AttemptOutcome::Failure {
                message: self.message,
            },
        }
    }
}

/// Run one job attempt to completion (or to timeout) and report the result.
/// Never panics on a failing subprocess; only truly unrecoverable I/O errors
/// (e.g. the log directory vanished) are surfaced as `spawn_error`.
pub async fn execute(req: ExecutionRequest<'_>) -> ExecutionReport {
    use tracing::Instrument;
    let span = tracing::debug_span!("execute", job_id = %req.job_id, attempt = req.attempt);
    execute_inner(req).instrument(span).await
}

async fn execute_inner(req: ExecutionRequest<'_>) -> ExecutionReport {
    let header = format!(
        "--- attempt {} started {} ---\n",
        req.attempt,
        Utc::now().to_rfc3339()
    );
    let (mut stdout_file, mut stderr_file) = match open_logs(req.stdout_path, req.stderr_path).await
    {
        Ok(pair) => pair,
        Err(e) => {
            return ExecutionReport {
                outcome: OutcomeTag::SpawnError,
                exit_code: None,
                message: format!("failed to open log files: {e}"),
            }
        }
    };
    let _ = stdout_file.write_all(header.as_bytes()).await;
    let _ = stderr_file.write_all(header.as_bytes()).await;

    // The child's stdout/stderr are handed their own file descriptors onto
    // the same log files, rather than piped through this process: a piped
    // child that writes more than the OS pipe buffer would block on
    // write() until something drains the pipe, and nothing drains it until
    // after `wait()` returns, which would never happen. Writing straight to
    // the file has no such buffer limit.
    let (child_stdout, child_stderr) = match open_child_stdio(req.stdout_path, req.stderr_path).await
    {
        Ok(pair) => pair,
        Err(e) => {
            let message = format!("failed to open log files for child: {e}");
            let _ = stderr_file.write_all(message.as_bytes()).await;
            return ExecutionReport {
                outcome: OutcomeTag::SpawnError,
                exit_code: None,
                message,
            };
        }
    };

    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(req.command)
        .stdin(Stdio::null())
        .stdout(Stdio::from(child_stdout))
        .stderr(Stdio::from(child_stderr));
    // SAFETY: `setsid` is called in the forked child before exec, which only
    // touches this process's own session/group state.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let message = format!("spawn error: {e}");
            let _ = stderr_file.write_all(message.as_bytes()).await;
            return ExecutionReport {
                outcome: OutcomeTag::SpawnError,
                exit_code: None,
                message,
            };
        }
    };

    let pgid = match child.id() {
        Some(pid) => Pid::from_raw(pid as i32),
        None => {
            return ExecutionReport {
                outcome: OutcomeTag::SpawnError,
                exit_code: None,
                message: "child exited before its pid could be read".into(),
            }
        }
    };

    let deadline = req.timeout_seconds.map(|s| StdDuration::from_secs(s.max(0) as u64));
    let report = match deadline {
        Some(d) => run_with_deadline(&mut child, pgid, d).await,
        None => run_to_completion(&mut child).await,
    };

    match &report {
        ExecOutcomeInner::Finished(status) => {
            let code = status.code();
            if status.success() {
                ExecutionReport {
                    outcome: OutcomeTag::Ok,
                    exit_code: code,
                    message: "exited 0".into(),
                }
            } else {
                let message = match code {
                    Some(c) => format!("exited with status {c}"),
                    None => format!(
                        "terminated by signal {}",
                        status.signal().unwrap_or(-1)
                    ),
                };
                ExecutionReport {
                    outcome: OutcomeTag::Nonzero,
                    exit_code: code,
                    message,
                }
            }
        }
        ExecOutcomeInner::TimedOut => {
            let message = format!(
                "timed out after {}s",
                req.timeout_seconds.unwrap_or_default()
            );
            tracing::warn!(job_id = %req.job_id, "{message}");
            let _ = stderr_file.write_all(message.as_bytes()).await;
            ExecutionReport {
                outcome: OutcomeTag::Timeout,
                exit_code: None,
                message,
            }
        }
        ExecOutcomeInner::WaitError(e) => {
            let message = format!("wait error: {e}");
            ExecutionReport {
                outcome: OutcomeTag::SpawnError,
                exit_code: None,
                message,
            }
        }
    }
}

enum ExecOutcomeInner {
    Finished(std::process::ExitStatus),
    TimedOut,
    WaitError(std::io::Error),
}

async fn run_to_completion(child: &mut Child) -> ExecOutcomeInner {
    match child.wait().await {
        Ok(status) => ExecOutcomeInner::Finished(status),
        Err(e) => ExecOutcomeInner::WaitError(e),
    }
}

async fn run_with_deadline(
    child: &mut Child,
    pgid: Pid,
    deadline: StdDuration,
) -> ExecOutcomeInner {
    match tokio::time::timeout(deadline, child.wait()).await {
        Ok(Ok(status)) => ExecOutcomeInner::Finished(status),
        Ok(Err(e)) => ExecOutcomeInner::WaitError(e),
        Err(_) => {
            let _ = killpg(pgid, Signal::SIGTERM);
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    // It exited during the grace window; still report as a
                    // timeout since it only died because we asked it to.
                    let _ = status;
                    ExecOutcomeInner::TimedOut
                }
                _ => {
                    let _ = killpg(pgid, Signal::SIGKILL);
                    let _ = child.wait().await;
                    ExecOutcomeInner::TimedOut
                }
            }
        }
    }
}

async fn open_logs(
    stdout_path: &Path,
    stderr_path: &Path,
) -> std::io::Result<(tokio::fs::File, tokio::fs::File)> {
    let stdout_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(stdout_path)
        .await?;
    let stderr_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(stderr_path)
        .await?;
    Ok((stdout_file, stderr_file))
}

/// Open a second, independent file descriptor onto each log path for the
/// child to inherit as its stdout/stderr. Both this pair and the pair from
/// `open_logs` are opened in append mode, so writes from either descriptor
/// always land at the current end of file with no coordination needed.
async fn open_child_stdio(
    stdout_path: &Path,
    stderr_path: &Path,
) -> std::io::Result<(std::fs::File, std::fs::File)> {
    let stdout_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(stdout_path)
        .await?
        .into_std()
        .await;
    let stderr_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(stderr_path)
        .await?
        .into_std()
        .await;
    Ok((stdout_file, stderr_file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(dir: &tempfile::TempDir, id: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        (dir.path().join(format!("{id}.out")), dir.path().join(format!("{id}.err")))
    }

    #[tokio::test]
    async fn successful_command_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (out, err) = paths(&dir, "a");
        let report = execute(ExecutionRequest {
            job_id: "a",
            command: "echo hello",
            attempt: 1,
            timeout_seconds: None,
            stdout_path: &out,
            stderr_path: &err,
        })
        .await;
        assert_eq!(report.outcome, OutcomeTag::Ok);
        assert_eq!(report.exit_code, Some(0));
        let contents = tokio::fs::read_to_string(&out).await.unwrap();
        assert!(contents.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_nonzero() {
        let dir = tempfile::tempdir().unwrap();
        let (out, err) = paths(&dir, "b");
        let report = execute(ExecutionRequest {
            job_id: "b",
            command: "exit 7",
            attempt: 1,
            timeout_seconds: None,
            stdout_path: &out,
            stderr_path: &err,
        })
        .await;
        assert_eq!(report.outcome, OutcomeTag::Nonzero);
        assert_eq!(report.exit_code, Some(7));
    }

    #[tokio::test]
    async fn timeout_kills_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let (out, err) = paths(&dir, "c");
        let started = std::time::Instant::now();
        let report = execute(ExecutionRequest {
            job_id: "c",
            command: "sleep 30",
            attempt: 1,
            timeout_seconds: Some(1),
            stdout_path: &out,
            stderr_path: &err,
        })
        .await;
        let elapsed = started.elapsed();
        assert_eq!(report.outcome, OutcomeTag::Timeout);
        assert!(elapsed < StdDuration::from_secs(1) + KILL_GRACE + StdDuration::from_secs(2));
    }

    #[tokio::test]
    async fn attempt_outcome_folds_any_non_ok_into_failure() {
        let report = ExecutionReport {
            outcome: OutcomeTag::Timeout,
            exit_code: None,
            message: "timed out after 1s".into(),
        };
        assert_eq!(
            report.into_attempt_outcome(),
            AttemptOutcome::Failure {
                message: "timed out after 1s".into()
            }
        );
    }
}
