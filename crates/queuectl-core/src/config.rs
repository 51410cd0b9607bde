//! Recognized config keys and their defaults (`spec.md` §3 Config entry).

use crate::error::{QueuectlError, Result};

/// One of the four keys recognized by `ConfigGet`/`ConfigSet`. Unknown keys
/// are an `InvalidArg`, per `spec.md` §6.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    MaxRetries,
    BackoffBase,
    PollInterval,
    StaleLockSeconds,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 4] = [
        ConfigKey::MaxRetries,
        ConfigKey::BackoffBase,
        ConfigKey::PollInterval,
        ConfigKey::StaleLockSeconds,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBase => "backoff_base",
            ConfigKey::PollInterval => "poll_interval",
            ConfigKey::StaleLockSeconds => "stale_lock_seconds",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "max_retries" => Some(ConfigKey::MaxRetries),
            "backoff_base" => Some(ConfigKey::BackoffBase),
            "poll_interval" => Some(ConfigKey::PollInterval),
            "stale_lock_seconds" => Some(ConfigKey::StaleLockSeconds),
            _ => None,
        }
    }

    /// Default value, seeded by `InitStore` when the row is absent.
    pub fn default_value(&self) -> i64 {
        match self {
            ConfigKey::MaxRetries => 3,
            ConfigKey::BackoffBase => 2,
            ConfigKey::PollInterval => 1,
            ConfigKey::StaleLockSeconds => 300,
        }
    }

    /// Validate a candidate value for `ConfigSet`. `spec.md` §9 requires
    /// rejecting `backoff_base < 1`; the other integer keys must be
    /// positive, except `max_retries` which legitimately allows 0 (a job
    /// that never retries).
    pub fn validate(&self, value: i64) -> Result<()> {
        let ok = match self {
            ConfigKey::MaxRetries => value >= 0,
            ConfigKey::BackoffBase => value >= 1,
            ConfigKey::PollInterval => value >= 1,
            ConfigKey::StaleLockSeconds => value >= 1,
        };
        if ok {
            Ok(())
        } else {
            Err(QueuectlError::InvalidArg(format!(
                "{} must be {}, got {value}",
                self.as_str(),
                if matches!(self, ConfigKey::MaxRetries) {
                    ">= 0"
                } else {
                    ">= 1"
                }
            )))
        }
    }
}

/// Parse and validate a raw string value for `ConfigSet` against a key.
pub fn parse_and_validate(key: ConfigKey, raw: &str) -> Result<i64> {
    let value: i64 = raw
        .parse()
        .map_err(|_| QueuectlError::InvalidArg(format!("{raw:?} is not an integer")))?;
    key.validate(value)?;
    Ok(value)
}
