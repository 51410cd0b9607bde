//! # queuectl-store
//!
//! SQLite implementation of the `JobStore`/`ConfigStore` traits from
//! `queuectl-core`: schema management, the atomic claim transaction, and
//! durable config, all against a single on-disk file (`spec.md` §2.1, §4.1).

mod sanitize;
mod schema;
mod sqlite_store;
mod time;

pub use sqlite_store::SqliteStore;
