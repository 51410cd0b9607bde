//! Integration tests for the SQLite job/config store (`spec.md` §8).

use chrono::{Duration, Utc};
use queuectl_core::{AttemptOutcome, ClaimOutcome, ConfigKey, ConfigStore, JobState, JobStore};
use queuectl_testing::{spec, ScratchStore};

#[tokio::test]
async fn enqueue_then_claim_transitions_to_processing() {
    let db = ScratchStore::new().await;
    db.store.enqueue(spec("a", "echo hi"), 3).await.unwrap();

    let outcome = db.store.claim("w1", Utc::now()).await.unwrap();
    let job = match outcome {
        ClaimOutcome::Claimed(job) => job,
        ClaimOutcome::Empty => panic!("expected a claim"),
    };
    assert_eq!(job.id, "a");
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(job.locked_by.as_deref(), Some("w1"));
}

#[tokio::test]
async fn duplicate_id_is_rejected() {
    let db = ScratchStore::new().await;
    db.store.enqueue(spec("a", "echo hi"), 3).await.unwrap();
    let err = db.store.enqueue(spec("a", "echo bye"), 3).await.unwrap_err();
    assert!(matches!(err, queuectl_core::QueuectlError::DuplicateId(_)));
}

#[tokio::test]
async fn empty_id_or_command_is_invalid() {
    let db = ScratchStore::new().await;
    assert!(matches!(
        db.store.enqueue(spec("", "echo hi"), 3).await.unwrap_err(),
        queuectl_core::QueuectlError::InvalidArg(_)
    ));
    assert!(matches!(
        db.store.enqueue(spec("a", ""), 3).await.unwrap_err(),
        queuectl_core::QueuectlError::InvalidArg(_)
    ));
}

#[tokio::test]
async fn claim_on_empty_queue_returns_empty() {
    let db = ScratchStore::new().await;
    let outcome = db.store.claim("w1", Utc::now()).await.unwrap();
    assert!(matches!(outcome, ClaimOutcome::Empty));
}

#[tokio::test]
async fn claim_does_not_double_claim_under_concurrency() {
    let db = ScratchStore::new().await;
    for i in 0..20 {
        db.store
            .enqueue(spec(&format!("job-{i}"), "true"), 3)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let store = db.store.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match store.claim(&format!("w{w}"), Utc::now()).await.unwrap() {
                    ClaimOutcome::Claimed(job) => claimed.push(job.id),
                    ClaimOutcome::Empty => break,
                }
            }
            claimed
        }));
    }

    let mut all_claimed = Vec::new();
    for h in handles {
        all_claimed.extend(h.await.unwrap());
    }
    all_claimed.sort();
    let expected: Vec<String> = (0..20).map(|i| format!("job-{i}")).collect();
    assert_eq!(all_claimed, expected, "every job claimed exactly once");
}

#[tokio::test]
async fn failure_within_retry_budget_reschedules_as_pending() {
    let db = ScratchStore::new().await;
    db.store
        .enqueue(
            {
                let mut s = spec("a", "false");
                s.max_retries = Some(3);
                s
            },
            3,
        )
        .await
        .unwrap();

    let now = Utc::now();
    db.store
        .finish_attempt(
            "a",
            AttemptOutcome::Failure {
                message: "exit 1".into(),
            },
            2,
            now,
        )
        .await
        .unwrap();

    let job = db.store.get("a").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("exit 1"));
    // backoff_base^attempts = 2^1 = 2 seconds
    assert!(job.next_run_at >= now + Duration::seconds(2));
}

#[tokio::test]
async fn exhausting_retries_moves_to_dead() {
    let db = ScratchStore::new().await;
    db.store
        .enqueue(
            {
                let mut s = spec("f", "false");
                s.max_retries = Some(2);
                s
            },
            3,
        )
        .await
        .unwrap();

    let now = Utc::now();
    for _ in 0..3 {
        db.store
            .finish_attempt(
                "f",
                AttemptOutcome::Failure {
                    message: "boom".into(),
                },
                2,
                now,
            )
            .await
            .unwrap();
        // Re-claim between attempts like a real worker would, except the
        // final attempt which is expected to go terminal.
        let job = db.store.get("f").await.unwrap().unwrap();
        if job.state == JobState::Dead {
            break;
        }
    }

    let job = db.store.get("f").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn dlq_retry_resets_and_rejects_non_dead() {
    let db = ScratchStore::new().await;
    db.store
        .enqueue(
            {
                let mut s = spec("f", "false");
                s.max_retries = Some(0);
                s
            },
            3,
        )
        .await
        .unwrap();

    db.store
        .finish_attempt(
            "f",
            AttemptOutcome::Failure {
                message: "boom".into(),
            },
            2,
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(db.store.get("f").await.unwrap().unwrap().state, JobState::Dead);

    let job = db.store.retry_from_dlq("f", Utc::now()).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.last_error.is_none());

    let err = db.store.retry_from_dlq("f", Utc::now()).await.unwrap_err();
    assert!(matches!(err, queuectl_core::QueuectlError::InvalidState(_)));

    let err = db.store.retry_from_dlq("missing", Utc::now()).await.unwrap_err();
    assert!(matches!(err, queuectl_core::QueuectlError::NotFound(_)));
}

#[tokio::test]
async fn stale_lock_recovery_is_idempotent() {
    let db = ScratchStore::new().await;
    db.store.enqueue(spec("a", "sleep 100"), 3).await.unwrap();
    db.store.claim("dead-worker", Utc::now()).await.unwrap();

    let threshold = Utc::now() + Duration::seconds(1);
    let first = db.store.recover_stale_locks(threshold).await.unwrap();
    assert_eq!(first, 1);

    let job = db.store.get("a").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert!(job.locked_by.is_none());

    let second = db.store.recover_stale_locks(threshold).await.unwrap();
    assert_eq!(second, 0, "second sweep affects no rows");
}

#[tokio::test]
async fn priority_then_time_then_id_orders_claims() {
    let db = ScratchStore::new().await;
    db.store
        .enqueue(
            {
                let mut s = spec("low", "true");
                s.priority = Some(10);
                s
            },
            3,
        )
        .await
        .unwrap();
    db.store
        .enqueue(
            {
                let mut s = spec("high", "true");
                s.priority = Some(1);
                s
            },
            3,
        )
        .await
        .unwrap();

    let first = match db.store.claim("w1", Utc::now()).await.unwrap() {
        ClaimOutcome::Claimed(job) => job,
        ClaimOutcome::Empty => panic!("expected claim"),
    };
    assert_eq!(first.id, "high");
}

#[tokio::test]
async fn config_get_set_roundtrips_and_seeds_defaults() {
    let db = ScratchStore::new().await;
    assert_eq!(
        ConfigStore::get(&db.store, ConfigKey::BackoffBase)
            .await
            .unwrap(),
        2
    );

    ConfigStore::set(&db.store, ConfigKey::BackoffBase, 3)
        .await
        .unwrap();
    assert_eq!(
        ConfigStore::get(&db.store, ConfigKey::BackoffBase)
            .await
            .unwrap(),
        3
    );

    let err = ConfigStore::set(&db.store, ConfigKey::BackoffBase, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, queuectl_core::QueuectlError::InvalidArg(_)));
}
