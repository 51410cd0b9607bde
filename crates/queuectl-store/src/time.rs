//! Second-precision epoch conversion for the store's INTEGER timestamp
//! columns. Storing epoch seconds rather than formatted text sidesteps any
//! ambiguity in lexical ordering across timestamp representations.

use chrono::{DateTime, Utc};

pub fn to_epoch(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap())
}
