//! Integration tests for the worker loop and supervisor (`spec.md` §8).

use std::sync::Arc;
use std::time::Duration;

use queuectl_core::{Clock, ConfigKey, ConfigStore, JobState, JobStore, SystemClock};
use queuectl_testing::{spec, ScratchStore};
use queuectl_worker::{Supervisor, Worker, WorkerOutcome};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn drain_mode_completes_a_simple_job() {
    let db = ScratchStore::new().await;
    db.store.enqueue(spec("a", "echo OK"), 3).await.unwrap();

    let store: Arc<dyn JobStore> = Arc::new(db.store.clone());
    let config: Arc<dyn ConfigStore> = Arc::new(db.store.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let worker = Worker {
        id: "w-test-0".into(),
        store: store.clone(),
        config,
        clock,
        stopping: CancellationToken::new(),
        drain: true,
    };
    let outcome = worker.run().await;
    assert_eq!(outcome, WorkerOutcome::Drained);

    let job = store.get("a").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.is_none());

    let stdout = tokio::fs::read_to_string(&job.stdout_path).await.unwrap();
    assert!(stdout.contains("OK"));
}

#[tokio::test]
async fn drain_mode_exhausts_retries_to_dead() {
    let db = ScratchStore::new().await;
    ConfigStore::set(&db.store, ConfigKey::BackoffBase, 1)
        .await
        .unwrap();
    db.store
        .enqueue(
            {
                let mut s = spec("f", "exit 1");
                s.max_retries = Some(1);
                s
            },
            3,
        )
        .await
        .unwrap();

    let store: Arc<dyn JobStore> = Arc::new(db.store.clone());
    let config: Arc<dyn ConfigStore> = Arc::new(db.store.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let worker = Worker {
        id: "w-test-1".into(),
        store: store.clone(),
        config,
        clock,
        stopping: CancellationToken::new(),
        drain: true,
    };
    let outcome = worker.run().await;
    assert_eq!(outcome, WorkerOutcome::Drained);

    let job = store.get("f").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 2);
    assert!(job.last_error.is_some());
}

#[tokio::test]
async fn supervisor_launches_and_stops_cleanly() {
    let db = ScratchStore::new().await;
    let store: Arc<dyn JobStore> = Arc::new(db.store.clone());
    let config: Arc<dyn ConfigStore> = Arc::new(db.store.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let supervisor = Supervisor::new(store, config, clock);
    let handle = supervisor.start(2, false).await.unwrap();
    assert_eq!(handle.active_worker_count(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop();
    let outcomes = handle.join().await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| *o == WorkerOutcome::Stopped));
}
