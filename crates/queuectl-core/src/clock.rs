//! Monotonic wall-clock source (`spec.md` §2.2), isolated behind a trait so
//! tests can inject a fake clock instead of sleeping real time.

use chrono::{DateTime, Utc};

/// A source of the current UTC time, truncated to second precision (the
/// store's `next_run_at`/`locked_at` columns are second-precision
/// timestamps, so sub-second skew here is never observable).
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock, backed by `Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
