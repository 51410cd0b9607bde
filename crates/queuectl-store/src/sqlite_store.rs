//! SQLite implementation of [`JobStore`] and [`ConfigStore`].
//!
//! The claim protocol (`claim`) is the one piece of this file that earns its
//! comments: everything else is ordinary CRUD. See `spec.md` §4.4 for the
//! correctness argument this code implements.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuectl_core::{
    AttemptOutcome, ClaimOutcome, ConfigKey, ConfigStore, Job, JobSpec, JobState, JobStore,
    QueuectlError, Result, StateCounts,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::sanitize::sanitize_for_filename;
use crate::schema::SCHEMA_SQL;
use crate::time::{from_epoch, to_epoch};

/// Maximum number of times `claim` retries the claim transaction when it
/// loses the race for a row (`spec.md` §4.4 step 4).
const CLAIM_CONTENTION_RETRIES: usize = 3;

/// Maximum number of times a transaction is retried after a transient
/// `StoreBusy` error before it is surfaced (`spec.md` §4.1, §7).
const BUSY_RETRIES: usize = 5;

/// The maximum backoff delay the retry/terminal transition ever computes,
/// regardless of attempt count (`spec.md` §4.5, §9).
const MAX_BACKOFF_SECONDS: i64 = 86_400;

type Conn = sqlx::pool::PoolConnection<sqlx::Sqlite>;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    log_dir: PathBuf,
}

impl SqliteStore {
    /// Open (creating if absent) the database file at `path`, with the
    /// write-ahead journaling mode required by `spec.md` §4.1 so readers
    /// never block behind a claim.
    pub async fn connect(path: &Path, log_dir: PathBuf) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| QueuectlError::InvalidArg(format!("bad store path: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await
            .map_err(QueuectlError::classify_store_error)?;

        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(|e| QueuectlError::InvalidArg(format!("cannot create log dir: {e}")))?;

        Ok(Self { pool, log_dir })
    }

    /// Construct directly from an existing pool (used by tests that want an
    /// in-memory database shared across connections).
    pub fn from_pool(pool: SqlitePool, log_dir: PathBuf) -> Self {
        Self { pool, log_dir }
    }

    fn stdout_path(&self, id: &str) -> String {
        self.log_dir
            .join(format!("{}_out.txt", sanitize_for_filename(id)))
            .to_string_lossy()
            .into_owned()
    }

    fn stderr_path(&self, id: &str) -> String {
        self.log_dir
            .join(format!("{}_err.txt", sanitize_for_filename(id)))
            .to_string_lossy()
            .into_owned()
    }

    /// Run `body` inside a `BEGIN IMMEDIATE` transaction, retrying the whole
    /// transaction a bounded number of times on `StoreBusy` (`spec.md`
    /// §4.1: "errors from a transient write conflict MUST be retried with
    /// short bounded backoff internally before being surfaced").
    ///
    /// `BEGIN IMMEDIATE` (rather than the deferred transaction sqlx opens by
    /// default) takes the write lock up front, so there is no window
    /// between a read and a dependent write for another connection to land
    /// in.
    ///
    /// `body` always hands the connection back alongside its result, Ok or
    /// Err: every error path below issues `ROLLBACK` on that connection
    /// before it is either retried or returned to the pool, so a
    /// `NotFound`/`InvalidState`/`StoreBusy` error out of `body` never
    /// leaves a reserved write lock open on a pooled connection.
    async fn with_immediate_tx<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: Fn(Conn) -> Fut,
        Fut: std::future::Future<Output = (Conn, Result<T>)>,
    {
        let mut attempt = 0;
        loop {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(QueuectlError::classify_store_error)?;
            if let Err(e) = sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
                let classified = QueuectlError::classify_store_error(e);
                if matches!(classified, QueuectlError::StoreBusy(_)) && attempt < BUSY_RETRIES {
                    attempt += 1;
                    tracing::debug!(attempt, "store busy on BEGIN IMMEDIATE, retrying");
                    tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
                    continue;
                }
                return Err(classified);
            }

            let (mut conn, body_result) = body(conn).await;
            match body_result {
                Ok(value) => {
                    sqlx::query("COMMIT")
                        .execute(&mut *conn)
                        .await
                        .map_err(QueuectlError::classify_store_error)?;
                    return Ok(value);
                }
                Err(QueuectlError::StoreBusy(_)) if attempt < BUSY_RETRIES => {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    attempt += 1;
                    tracing::debug!(attempt, "store busy mid-transaction, retrying");
                    tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
                    continue;
                }
                Err(e) => {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_job(conn: &mut Conn, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut **conn)
            .await
            .map_err(QueuectlError::classify_store_error)?;
        Ok(row.as_ref().map(row_to_job))
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Job {
    Job {
        id: row.get("id"),
        command: row.get("command"),
        state: JobState::parse(row.get::<String, _>("state").as_str())
            .expect("state column always holds a valid JobState"),
        priority: row.get("priority"),
        attempts: row.get("attempts"),
        max_retries: row.get("max_retries"),
        timeout_seconds: row.get("timeout_seconds"),
        next_run_at: from_epoch(row.get::<i64, _>("next_run_at")),
        locked_by: row.get("locked_by"),
        locked_at: row.get::<Option<i64>, _>("locked_at").map(from_epoch),
        last_error: row.get("last_error"),
        stdout_path: row.get("stdout_path"),
        stderr_path: row.get("stderr_path"),
        created_at: from_epoch(row.get::<i64, _>("created_at")),
        updated_at: from_epoch(row.get::<i64, _>("updated_at")),
    }
}

/// `delay = backoff_base ^ attempts` seconds, clamped (`spec.md` §4.5, §9).
fn backoff_delay_seconds(backoff_base: i64, attempts: i64) -> i64 {
    if attempts <= 0 {
        return 0;
    }
    let exp = attempts.min(32) as u32; // guards against absurd exponents before the pow
    backoff_base.saturating_pow(exp).min(MAX_BACKOFF_SECONDS)
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(QueuectlError::classify_store_error)?;
        ConfigStore::seed_defaults(self).await?;
        Ok(())
    }

    async fn enqueue(&self, spec: JobSpec, default_max_retries: i64) -> Result<Job> {
        if spec.id.trim().is_empty() {
            return Err(QueuectlError::InvalidArg("id must not be empty".into()));
        }
        if spec.command.trim().is_empty() {
            return Err(QueuectlError::InvalidArg("command must not be empty".into()));
        }

        let now = Utc::now();
        let next_run_at = spec.run_at.unwrap_or(now);
        let max_retries = spec.max_retries.unwrap_or(default_max_retries);
        let priority = spec.priority.unwrap_or(0);
        let stdout_path = self.stdout_path(&spec.id);
        let stderr_path = self.stderr_path(&spec.id);

        let result = sqlx::query(
            r#"
            INSERT INTO jobs
                (id, command, state, priority, attempts, max_retries, timeout_seconds,
                 next_run_at, locked_by, locked_at, last_error, stdout_path, stderr_path,
                 created_at, updated_at)
            VALUES
                (?1, ?2, 'pending', ?3, 0, ?4, ?5, ?6, NULL, NULL, NULL, ?7, ?8, ?9, ?9)
            "#,
        )
        .bind(&spec.id)
        .bind(&spec.command)
        .bind(priority)
        .bind(max_retries)
        .bind(spec.timeout_seconds)
        .bind(to_epoch(next_run_at))
        .bind(&stdout_path)
        .bind(&stderr_path)
        .bind(to_epoch(now))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(QueuectlError::DuplicateId(spec.id));
            }
            Err(e) => return Err(QueuectlError::classify_store_error(e)),
        }

        self.get(&spec.id)
            .await?
            .ok_or_else(|| QueuectlError::NotFound(spec.id.clone()))
    }

    async fn list(&self, state: Option<JobState>, limit: Option<i64>) -> Result<Vec<Job>> {
        let limit = limit.unwrap_or(i64::MAX);
        let rows = match state {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE state = ?1 \
                     ORDER BY priority ASC, next_run_at ASC, id ASC LIMIT ?2",
                )
                .bind(s.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM jobs ORDER BY priority ASC, next_run_at ASC, id ASC LIMIT ?1",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(QueuectlError::classify_store_error)?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    async fn count_by_state(&self) -> Result<StateCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'pending')    AS pending,
                COUNT(*) FILTER (WHERE state = 'processing') AS processing,
                COUNT(*) FILTER (WHERE state = 'completed')  AS completed,
                COUNT(*) FILTER (WHERE state = 'dead')       AS dead
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(QueuectlError::classify_store_error)?;

        Ok(StateCounts {
            pending: row.get("pending"),
            processing: row.get("processing"),
            completed: row.get("completed"),
            dead: row.get("dead"),
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(QueuectlError::classify_store_error)?;
        Ok(row.as_ref().map(row_to_job))
    }

    /// The atomic claim protocol of `spec.md` §4.4.
    ///
    /// Step 1 picks a candidate id with a plain read; step 3's `UPDATE ...
    /// WHERE id = ? AND state = 'pending'` is the compare-and-set. Running
    /// both inside one `BEGIN IMMEDIATE` transaction means no other
    /// connection can claim the same row between the SELECT and the
    /// UPDATE, the write lock is held for the whole critical section, not
    /// just the UPDATE statement. If `rows_affected` is ever 0 here it can
    /// only be because another *already-committed* claim beat us to it
    /// before we opened this transaction, so we retry against a fresh
    /// SELECT rather than treating it as a bug.
    async fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        let now_epoch = to_epoch(now);
        for _ in 0..CLAIM_CONTENTION_RETRIES {
            let outcome = self
                .with_immediate_tx(|mut conn| {
                    let worker_id = worker_id.to_string();
                    async move {
                        let result: Result<ClaimOutcome> = async {
                            let candidate: Option<String> = sqlx::query(
                                "SELECT id FROM jobs WHERE state = 'pending' AND next_run_at <= ?1 \
                                 ORDER BY priority ASC, next_run_at ASC, id ASC LIMIT 1",
                            )
                            .bind(now_epoch)
                            .fetch_optional(&mut *conn)
                            .await
                            .map_err(QueuectlError::classify_store_error)?
                            .map(|row: sqlx::sqlite::SqliteRow| row.get("id"));

                            let Some(id) = candidate else {
                                return Ok(ClaimOutcome::Empty);
                            };

                            let affected = sqlx::query(
                                "UPDATE jobs SET state = 'processing', locked_by = ?1, \
                                 locked_at = ?2, updated_at = ?2 WHERE id = ?3 AND state = 'pending'",
                            )
                            .bind(&worker_id)
                            .bind(now_epoch)
                            .bind(&id)
                            .execute(&mut *conn)
                            .await
                            .map_err(QueuectlError::classify_store_error)?
                            .rows_affected();

                            if affected == 1 {
                                let job = SqliteStore::fetch_job(&mut conn, &id)
                                    .await?
                                    .expect("just-updated row must exist");
                                Ok(ClaimOutcome::Claimed(job))
                            } else {
                                Ok(ClaimOutcome::Empty)
                            }
                        }
                        .await;
                        (conn, result)
                    }
                })
                .await?;

            if let ClaimOutcome::Claimed(_) = outcome {
                return Ok(outcome);
            }
        }
        Ok(ClaimOutcome::Empty)
    }

    async fn finish_attempt(
        &self,
        id: &str,
        outcome: AttemptOutcome,
        backoff_base: i64,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let id = id.to_string();
        let now_epoch = to_epoch(now);
        self.with_immediate_tx(|mut conn| {
            let id = id.clone();
            let outcome = outcome.clone();
            async move {
                let result: Result<Job> = async {
                    let row = sqlx::query("SELECT attempts, max_retries FROM jobs WHERE id = ?1")
                        .bind(&id)
                        .fetch_optional(&mut *conn)
                        .await
                        .map_err(QueuectlError::classify_store_error)?
                        .ok_or_else(|| QueuectlError::NotFound(id.clone()))?;

                    let attempts: i64 = row.get("attempts");
                    let max_retries: i64 = row.get("max_retries");
                    let new_attempts = attempts + 1;

                    match outcome {
                        AttemptOutcome::Success => {
                            sqlx::query(
                                "UPDATE jobs SET state = 'completed', attempts = ?1, \
                                 last_error = NULL, locked_by = NULL, locked_at = NULL, \
                                 updated_at = ?2 WHERE id = ?3",
                            )
                            .bind(new_attempts)
                            .bind(now_epoch)
                            .bind(&id)
                            .execute(&mut *conn)
                            .await
                            .map_err(QueuectlError::classify_store_error)?;
                        }
                        AttemptOutcome::Failure { message } if new_attempts <= max_retries => {
                            let delay = backoff_delay_seconds(backoff_base, new_attempts);
                            sqlx::query(
                                "UPDATE jobs SET state = 'pending', attempts = ?1, \
                                 next_run_at = ?2, last_error = ?3, locked_by = NULL, \
                                 locked_at = NULL, updated_at = ?4 WHERE id = ?5",
                            )
                            .bind(new_attempts)
                            .bind(now_epoch + delay)
                            .bind(&message)
                            .bind(now_epoch)
                            .bind(&id)
                            .execute(&mut *conn)
                            .await
                            .map_err(QueuectlError::classify_store_error)?;
                        }
                        AttemptOutcome::Failure { message } => {
                            sqlx::query(
                                "UPDATE jobs SET state = 'dead', attempts = ?1, \
                                 last_error = ?2, locked_by = NULL, locked_at = NULL, \
                                 updated_at = ?3 WHERE id = ?4",
                            )
                            .bind(new_attempts)
                            .bind(&message)
                            .bind(now_epoch)
                            .bind(&id)
                            .execute(&mut *conn)
                            .await
                            .map_err(QueuectlError::classify_store_error)?;
                        }
                    }

                    let job = SqliteStore::fetch_job(&mut conn, &id)
                        .await?
                        .expect("just-updated row must exist");
                    Ok(job)
                }
                .await;
                (conn, result)
            }
        })
        .await
    }

    async fn retry_from_dlq(&self, id: &str, now: DateTime<Utc>) -> Result<Job> {
        let id = id.to_string();
        let now_epoch = to_epoch(now);
        self.with_immediate_tx(|mut conn| {
            let id = id.clone();
            async move {
                let result: Result<Job> = async {
                    let state: Option<String> =
                        sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?1")
                            .bind(&id)
                            .fetch_optional(&mut *conn)
                            .await
                            .map_err(QueuectlError::classify_store_error)?;

                    match state.as_deref() {
                        None => return Err(QueuectlError::NotFound(id.clone())),
                        Some("dead") => {}
                        Some(other) => {
                            return Err(QueuectlError::InvalidState(format!(
                                "job {id} is {other}, not dead"
                            )))
                        }
                    }

                    sqlx::query(
                        "UPDATE jobs SET state = 'pending', attempts = 0, next_run_at = ?1, \
                         last_error = NULL, locked_by = NULL, locked_at = NULL, updated_at = ?1 \
                         WHERE id = ?2",
                    )
                    .bind(now_epoch)
                    .bind(&id)
                    .execute(&mut *conn)
                    .await
                    .map_err(QueuectlError::classify_store_error)?;

                    let job = SqliteStore::fetch_job(&mut conn, &id)
                        .await?
                        .expect("just-updated row must exist");
                    Ok(job)
                }
                .await;
                (conn, result)
            }
        })
        .await
    }

    async fn retry_all_from_dlq(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'pending', attempts = 0, next_run_at = ?1, \
             last_error = NULL, locked_by = NULL, locked_at = NULL, updated_at = ?1 \
             WHERE state = 'dead'",
        )
        .bind(to_epoch(now))
        .execute(&self.pool)
        .await
        .map_err(QueuectlError::classify_store_error)?;
        Ok(result.rows_affected())
    }

    async fn recover_stale_locks(&self, threshold: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'pending', locked_by = NULL, locked_at = NULL, \
             updated_at = ?1 WHERE state = 'processing' AND locked_at < ?2",
        )
        .bind(to_epoch(Utc::now()))
        .bind(to_epoch(threshold))
        .execute(&self.pool)
        .await
        .map_err(QueuectlError::classify_store_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn seed_defaults(&self) -> Result<()> {
        for key in ConfigKey::ALL {
            sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
                .bind(key.as_str())
                .bind(key.default_value().to_string())
                .execute(&self.pool)
                .await
                .map_err(QueuectlError::classify_store_error)?;
        }
        Ok(())
    }

    async fn get(&self, key: ConfigKey) -> Result<i64> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM config WHERE key = ?1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(QueuectlError::classify_store_error)?;

        match raw {
            Some(v) => v.parse().map_err(|_| {
                QueuectlError::StoreFatal(sqlx::Error::Decode(
                    format!("config key {} has non-integer value {v:?}", key.as_str()).into(),
                ))
            }),
            None => Ok(key.default_value()),
        }
    }

    async fn set(&self, key: ConfigKey, value: i64) -> Result<()> {
        key.validate(value)?;
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key.as_str())
        .bind(value.to_string())
        .execute(&self.pool)
        .await
        .map_err(QueuectlError::classify_store_error)?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<(ConfigKey, i64)>> {
        let mut out = Vec::with_capacity(ConfigKey::ALL.len());
        for key in ConfigKey::ALL {
            out.push((key, ConfigStore::get(self, key).await?));
        }
        Ok(out)
    }
}
