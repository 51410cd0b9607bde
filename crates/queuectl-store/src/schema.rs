//! Idempotent schema definition (`spec.md` §4.1).

/// `jobs` and `config` tables plus the composite dispatch index. Run inside
/// `CREATE TABLE IF NOT EXISTS` so repeated `init()` calls are no-ops.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY,
    command         TEXT NOT NULL,
    state           TEXT NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 0,
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL,
    timeout_seconds INTEGER,
    next_run_at     INTEGER NOT NULL,
    locked_by       TEXT,
    locked_at       INTEGER,
    last_error      TEXT,
    stdout_path     TEXT NOT NULL,
    stderr_path     TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_dispatch
    ON jobs (state, next_run_at, priority);

CREATE INDEX IF NOT EXISTS idx_jobs_locked_at
    ON jobs (state, locked_at);

CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
