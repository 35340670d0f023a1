//! End-to-end recovery: failure → policy decision → successor task.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{TestHarness, CRAWL_TASK, SYNC_TASK};
use orchestrator::resume::{CHECKPOINT_ID_KEY, ORIGINAL_TASK_ID_KEY, RESUME_STATE_KEY};
use orchestrator::{
    AbortReason, AuditRecord, FailureKind, HealthLevel, OrchestratorError, RecoveryAttempt,
    RecoveryConfig, RecoveryObserver, RecoveryStrategy, ScheduleConfig, ScheduleType,
    TaskDefinition, TaskResolution, TaskStatus, WorkerStats,
};
use serde_json::json;

#[tokio::test]
async fn transient_failures_back_off_until_the_budget_is_spent() {
    let h = TestHarness::new().await;
    let recovery = h.ctx.recovery();
    let root = h.submit_crawl("https://example.org").await;

    let mut current = root.clone();
    for expected in [60, 120, 240] {
        h.fail(&current, FailureKind::Network, "connection refused").await;
        let outcome = recovery
            .handle_failure(&current, "connection refused", FailureKind::Network)
            .await
            .unwrap();
        assert_eq!(outcome.strategy(), RecoveryStrategy::Retry);
        assert!(outcome.attempt.success);
        assert_eq!(outcome.attempt.root_task_id, root);
        assert!(outcome.attempt.next_retry_time.is_some());

        let successor = outcome.successor_task_id().unwrap().to_string();
        let submission = h.engine.submission(&successor).unwrap();
        assert_eq!(submission.countdown, Some(Duration::from_secs(expected)));
        assert_eq!(submission.kwargs["url"], "https://example.org");

        let task = h.ctx.ledger().get(&successor).unwrap();
        assert_eq!(task.metadata.retry_of.as_deref(), Some(current.as_str()));
        assert_eq!(task.root_task_id, root);
        current = successor;
    }

    h.fail(&current, FailureKind::Network, "connection refused").await;
    let submitted = h.submission_count();
    let outcome = recovery
        .handle_failure(&current, "connection refused", FailureKind::Network)
        .await
        .unwrap();

    assert_eq!(outcome.strategy(), RecoveryStrategy::Abort);
    assert_eq!(outcome.attempt.abort_reason, Some(AbortReason::Exhausted));
    assert!(!outcome.attempt.success);
    assert!(outcome.successor_task_id().is_none());
    assert_eq!(h.submission_count(), submitted);
    assert_eq!(
        h.ctx.ledger().get(&current).unwrap().resolution,
        Some(TaskResolution::Exhausted)
    );
    assert_eq!(recovery.lineage_attempts(&current).len(), 4);
}

#[tokio::test]
async fn stop_on_failure_aborts_without_successor() {
    let h = TestHarness::new().await;
    let task_id = h.submit_crawl("https://example.org").await;
    h.fail(&task_id, FailureKind::Authentication, "401 from upstream").await;
    // A checkpoint would otherwise make this a resume
    h.checkpoint(&task_id, CRAWL_TASK, 60, 100).await;
    let submitted = h.submission_count();

    let outcome = h
        .ctx
        .recovery()
        .handle_failure(&task_id, "401 from upstream", FailureKind::Authentication)
        .await
        .unwrap();

    assert_eq!(outcome.strategy(), RecoveryStrategy::Abort);
    assert_eq!(outcome.attempt.abort_reason, Some(AbortReason::Fatal));
    assert!(outcome.successor_task_id().is_none());
    assert_eq!(h.submission_count(), submitted);
    assert!(h
        .ctx
        .recovery()
        .attempts(&task_id)
        .iter()
        .all(|attempt| attempt.strategy == RecoveryStrategy::Abort));
    assert_eq!(
        h.ctx.ledger().get(&task_id).unwrap().resolution,
        Some(TaskResolution::Fatal)
    );
}

#[tokio::test]
async fn checkpointed_failure_resumes_with_state() {
    let h = TestHarness::new().await;
    let task_id = h.submit_crawl("https://example.org").await;
    let checkpoint_id = h.checkpoint(&task_id, CRAWL_TASK, 70, 100).await;
    h.fail(&task_id, FailureKind::Timeout, "read timed out").await;

    let outcome = h
        .ctx
        .recovery()
        .handle_failure(&task_id, "read timed out", FailureKind::Timeout)
        .await
        .unwrap();

    assert_eq!(outcome.strategy(), RecoveryStrategy::Resume);
    assert!(outcome.attempt.checkpoint_used);
    assert_eq!(outcome.attempt.checkpoint_id.as_deref(), Some(checkpoint_id.as_str()));

    let successor = outcome.successor_task_id().unwrap();
    let kwargs = &h.engine.submission(successor).unwrap().kwargs;
    assert_eq!(kwargs[RESUME_STATE_KEY], json!({ "cursor": 70 }));
    assert_eq!(kwargs[CHECKPOINT_ID_KEY], checkpoint_id.as_str());
    assert_eq!(kwargs[ORIGINAL_TASK_ID_KEY], task_id.as_str());
    assert_eq!(kwargs["url"], "https://example.org");

    let context = h.ctx.coordinator().context_for(successor).unwrap();
    assert_eq!(context.original_task_id, task_id);
}

#[tokio::test]
async fn handling_the_same_failure_twice_is_a_no_op() {
    let h = TestHarness::new().await;
    let task_id = h.submit_crawl("https://example.org").await;
    h.fail(&task_id, FailureKind::ConnectionReset, "reset by peer").await;

    let recovery = h.ctx.recovery();
    let first = recovery
        .handle_failure(&task_id, "reset by peer", FailureKind::ConnectionReset)
        .await
        .unwrap();
    let submitted = h.submission_count();
    let second = recovery
        .handle_failure(&task_id, "reset by peer", FailureKind::ConnectionReset)
        .await
        .unwrap();

    assert!(!first.already_handled);
    assert!(second.already_handled);
    assert_eq!(first.attempt.attempt_id, second.attempt.attempt_id);
    assert_eq!(h.submission_count(), submitted);
    assert_eq!(recovery.attempts(&task_id).len(), 1);
}

#[tokio::test]
async fn manual_and_skip_only_set_a_resolution() {
    let h = TestHarness::with_definitions(vec![
        TaskDefinition::new("manual_task").recovery(
            RecoveryConfig::builder()
                .strategy(RecoveryStrategy::Manual)
                .build()
                .unwrap(),
        ),
        TaskDefinition::new("skip_task").recovery(
            RecoveryConfig::builder()
                .strategy(RecoveryStrategy::Skip)
                .build()
                .unwrap(),
        ),
    ])
    .await;

    let manual = h.submit("manual_task", json!({})).await;
    let skip = h.submit("skip_task", json!({})).await;
    h.fail(&manual, FailureKind::Network, "boom").await;
    h.fail(&skip, FailureKind::Internal, "boom").await;
    let submitted = h.submission_count();

    let recovery = h.ctx.recovery();
    let outcome = recovery
        .handle_failure(&manual, "boom", FailureKind::Network)
        .await
        .unwrap();
    assert_eq!(outcome.strategy(), RecoveryStrategy::Manual);
    assert!(outcome.attempt.success);

    // Internal is not retried, so the configured default applies
    let outcome = recovery
        .handle_failure(&skip, "boom", FailureKind::Internal)
        .await
        .unwrap();
    assert_eq!(outcome.strategy(), RecoveryStrategy::Skip);

    assert_eq!(h.submission_count(), submitted);
    let ledger = h.ctx.ledger();
    assert_eq!(
        ledger.get(&manual).unwrap().resolution,
        Some(TaskResolution::ManualInterventionRequired)
    );
    assert_eq!(ledger.get(&skip).unwrap().resolution, Some(TaskResolution::Skipped));
}

#[tokio::test]
async fn failed_remediation_is_recorded_not_raised() {
    let h = TestHarness::new().await;
    let task_id = h.submit_crawl("https://example.org").await;
    h.fail(&task_id, FailureKind::Network, "unreachable").await;
    h.engine.reject_submissions(Some(FailureKind::ServiceUnavailable));

    let outcome = h
        .ctx
        .recovery()
        .handle_failure(&task_id, "unreachable", FailureKind::Network)
        .await
        .unwrap();

    assert_eq!(outcome.strategy(), RecoveryStrategy::Retry);
    assert!(!outcome.attempt.success);
    assert!(outcome.attempt.remediation_error.is_some());
    assert!(outcome.successor_task_id().is_none());
}

#[tokio::test]
async fn attempts_reach_audit_and_observers() {
    #[derive(Default)]
    struct Collect(Mutex<Vec<RecoveryAttempt>>);

    impl RecoveryObserver for Collect {
        fn on_attempt(&self, attempt: &RecoveryAttempt) {
            self.0.lock().unwrap().push(attempt.clone());
        }
    }

    let h = TestHarness::new().await;
    let observer = Arc::new(Collect::default());
    h.ctx.recovery().register_observer(observer.clone());

    let task_id = h.submit_crawl("https://example.org").await;
    h.fail(&task_id, FailureKind::Network, "unreachable").await;
    let outcome = h
        .ctx
        .recovery()
        .handle_failure(&task_id, "unreachable", FailureKind::Network)
        .await
        .unwrap();

    assert_eq!(observer.0.lock().unwrap().as_slice(), &[outcome.attempt.clone()]);
    let audited = h.audit.recovery_attempts();
    assert_eq!(audited, vec![outcome.attempt.clone()]);
    assert!(h
        .audit
        .for_task(&task_id)
        .iter()
        .any(|record| matches!(record, AuditRecord::RecoveryAttempt(_))));
}

#[tokio::test]
async fn dispatch_picks_up_engine_failures() {
    let h = TestHarness::new().await;
    let task_id = h.submit_crawl("https://example.org").await;
    h.engine.start(&task_id);
    h.engine
        .fail(&task_id, orchestrator::TaskError::new(FailureKind::Timeout, "slow upstream"));

    let outcomes = h.ctx.dispatch_failures().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].attempt.task_id, task_id);
    assert_eq!(outcomes[0].attempt.failure_kind, FailureKind::Timeout);
    assert_eq!(outcomes[0].attempt.error_message, "slow upstream");

    // Already reconciled; nothing new to dispatch
    assert!(h.ctx.dispatch_failures().await.unwrap().is_empty());
}

#[tokio::test]
async fn failures_of_periodic_runs_reach_recovery() {
    let h = TestHarness::new().await;
    h.ctx
        .scheduler()
        .add(
            ScheduleConfig::builder()
                .name("recrawl")
                .task_name(CRAWL_TASK)
                .schedule_type(ScheduleType::Interval)
                .interval_seconds(900u64)
                .kwargs(json!({ "url": "https://example.org" }))
                .build(),
        )
        .await
        .unwrap();

    let fired = h.engine.fire_periodic("recrawl").unwrap();
    h.engine.start(&fired);
    h.engine
        .fail(&fired, orchestrator::TaskError::new(FailureKind::Network, "connection reset"));

    let outcomes = h.ctx.dispatch_failures().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].attempt.task_id, fired);
    assert_eq!(outcomes[0].strategy(), RecoveryStrategy::Retry);
    assert_eq!(h.ctx.recovery().attempts(&fired).len(), 1);

    let successor = outcomes[0].successor_task_id().unwrap();
    assert_eq!(h.engine.submission(successor).unwrap().kwargs["url"], "https://example.org");

    let stats = h.ctx.ledger().statistics().await.unwrap();
    assert_eq!(stats.status_counts[&TaskStatus::Failure], 1);
    assert!(h.ctx.dispatch_failures().await.unwrap().is_empty());
}

#[tokio::test]
async fn failure_first_seen_by_a_status_lookup_is_still_dispatched() {
    let h = TestHarness::new().await;
    let task_id = h.submit_crawl("https://example.org").await;
    h.engine.start(&task_id);
    h.engine
        .fail(&task_id, orchestrator::TaskError::new(FailureKind::Timeout, "slow upstream"));

    let task = h.ctx.ledger().status(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failure);

    let outcomes = h.ctx.dispatch_failures().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].attempt.task_id, task_id);
}

#[tokio::test]
async fn statistics_track_successor_outcomes() {
    let h = TestHarness::new().await;
    let recovery = h.ctx.recovery();

    let a = h.submit_crawl("https://a.example").await;
    let b = h.submit_crawl("https://b.example").await;
    h.fail(&a, FailureKind::Network, "down").await;
    h.fail(&b, FailureKind::Network, "down").await;
    let a2 = recovery
        .handle_failure(&a, "down", FailureKind::Network)
        .await
        .unwrap()
        .attempt
        .successor_task_id
        .unwrap();
    let b2 = recovery
        .handle_failure(&b, "down", FailureKind::Network)
        .await
        .unwrap()
        .attempt
        .successor_task_id
        .unwrap();

    let stats = recovery.statistics();
    assert_eq!(stats.successors_pending, 2);
    assert!(stats.effective_recovery_rate.is_none());

    h.engine.succeed(&a2, json!({ "pages": 12 }));
    h.engine.start(&b2);
    h.engine
        .fail(&b2, orchestrator::TaskError::new(FailureKind::InvalidData, "bad html"));
    h.ctx.ledger().refresh().await.unwrap();

    let stats = recovery.statistics();
    assert_eq!(stats.total_attempts, 2);
    assert_eq!(stats.by_strategy[&RecoveryStrategy::Retry], 2);
    assert_eq!(stats.remediation_success_rate, 1.0);
    assert_eq!(stats.successors_succeeded, 1);
    assert_eq!(stats.successors_failed, 1);
    assert_eq!(stats.effective_recovery_rate, Some(0.5));
}

#[tokio::test]
async fn critical_health_defers_retries() {
    let h = TestHarness::new().await;
    h.engine.set_workers(vec![WorkerStats {
        worker: "w1".into(),
        online: false,
        concurrency: 4,
        active: 0,
        processed: 0,
        failed: 0,
        avg_runtime_secs: None,
    }]);
    let health = h.ctx.status().tick().await.unwrap();
    assert_eq!(health.level, HealthLevel::Critical);

    let task_id = h.submit(SYNC_TASK, json!({})).await;
    h.fail(&task_id, FailureKind::RateLimited, "429").await;
    let outcome = h
        .ctx
        .recovery()
        .handle_failure(&task_id, "429", FailureKind::RateLimited)
        .await
        .unwrap();

    let successor = outcome.successor_task_id().unwrap();
    assert_eq!(
        h.engine.submission(successor).unwrap().countdown,
        Some(Duration::from_secs(3600))
    );
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let h = TestHarness::new().await;
    let err = h
        .ctx
        .recovery()
        .handle_failure("missing", "boom", FailureKind::Network)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(
        h.ctx.ledger().status("missing").await.unwrap_err().class(),
        orchestrator::ErrorClass::NotFound
    );
}

#[tokio::test]
async fn tasks_that_have_not_failed_are_left_alone() {
    let h = TestHarness::new().await;
    let task_id = h.submit_crawl("https://example.org").await;
    let recovery = h.ctx.recovery();

    let pending = recovery
        .handle_failure(&task_id, "boom", FailureKind::Network)
        .await
        .unwrap_err();
    assert!(matches!(pending, OrchestratorError::NotResumable { .. }));

    h.engine.start(&task_id);
    let started = recovery
        .handle_failure(&task_id, "boom", FailureKind::Network)
        .await
        .unwrap_err();
    assert!(matches!(started, OrchestratorError::NotResumable { .. }));

    assert_eq!(h.submission_count(), 1);
    assert!(recovery.attempts(&task_id).is_empty());

    // The real failure is still handled afterwards
    h.fail(&task_id, FailureKind::Network, "boom").await;
    let outcome = recovery
        .handle_failure(&task_id, "boom", FailureKind::Network)
        .await
        .unwrap();
    assert_eq!(outcome.strategy(), RecoveryStrategy::Retry);
}
