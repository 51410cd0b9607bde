//! # queuectl-core
//!
//! Data model, error taxonomy and storage traits shared by every other
//! crate in the workspace. This crate has no knowledge of SQLite, subprocess
//! execution, or worker scheduling; it defines the *shape* of the system
//! (`Job`, `JobState`, `JobStore`, `QueuectlError`) that the other crates
//! implement or drive.
//!
//! See `spec.md` §3 (data model) and §4.1/§4.3 (store and repository
//! operations) for the contract these types encode.

mod clock;
mod config;
mod error;
mod job;
mod store;
mod worker_id;

pub use clock::{Clock, SystemClock};
pub use config::{parse_and_validate, ConfigKey};
pub use error::{QueuectlError, Result};
pub use job::{AttemptOutcome, Job, JobSpec, JobState, StateCounts, StateFilter};
pub use store::{ClaimOutcome, ConfigStore, JobStore};
pub use worker_id::generate_worker_id;
