//! # queuectl-worker
//!
//! The worker loop and supervisor (`spec.md` §4.7, §4.8): polling, dispatch
//! to the executor, transition application, signal handling and drain mode.

mod supervisor;
mod worker;

pub use supervisor::{Supervisor, SupervisorHandle};
pub use worker::{Worker, WorkerOutcome};
