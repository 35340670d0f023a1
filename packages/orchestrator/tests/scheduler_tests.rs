mod common;

use std::time::Duration;

use chrono::Utc;
use common::{TestHarness, CRAWL_TASK, SYNC_TASK};
use orchestrator::{EngineRetryPolicy, OrchestratorError, ScheduleConfig, ScheduleType, TaskStatus};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

fn cron(name: &str, expression: &str) -> ScheduleConfig {
    ScheduleConfig::builder()
        .name(name)
        .task_name(SYNC_TASK)
        .schedule_type(ScheduleType::Cron)
        .cron_expression(expression)
        .build()
}

#[tokio::test]
async fn disabled_cron_schedule_stops_submitting_but_stays_listed() {
    let h = TestHarness::new().await;
    let scheduler = h.ctx.scheduler();

    assert!(assert_ok!(scheduler.add(cron("nightly", "0 2 * * *")).await));
    assert!(h.engine.is_periodic_registered("nightly"));
    assert!(h.engine.fire_periodic("nightly").is_some());

    assert!(scheduler.disable("nightly").await.unwrap());
    assert!(!h.engine.is_periodic_registered("nightly"));
    assert!(h.engine.fire_periodic("nightly").is_none());

    let stats = h.ctx.ledger().statistics().await.unwrap();
    assert_eq!(stats.schedule_submissions["nightly"], 1);

    let listed = scheduler.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "nightly");
    assert!(!listed[0].enabled);
    assert!(!listed[0].registered);

    // Re-enabling registers it again
    assert!(scheduler.enable("nightly").await.unwrap());
    assert!(h.engine.is_periodic_registered("nightly"));
}

#[tokio::test]
async fn invalid_cron_expression_is_rejected_without_registration() {
    let h = TestHarness::new().await;

    let err = assert_err!(h.ctx.scheduler().add(cron("broken", "61 2 * * *")).await);

    assert!(matches!(err, OrchestratorError::InvalidSchedule { .. }));
    assert!(!h.engine.is_periodic_registered("broken"));
    assert!(h.ctx.scheduler().get("broken").is_none());
}

#[tokio::test]
async fn named_weekday_ranges_are_accepted() {
    let h = TestHarness::new().await;
    let scheduler = h.ctx.scheduler();

    assert!(assert_ok!(scheduler.add(cron("daily-digest", "0 8 * * MON-SUN")).await));
    assert!(assert_ok!(scheduler.add(cron("weekend", "30 6 * * SAT,SUN")).await));

    assert!(h.engine.is_periodic_registered("daily-digest"));
    assert!(h.engine.is_periodic_registered("weekend"));
}

#[tokio::test]
async fn interval_schedule_registers_with_the_task_queue() {
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

    let first = h.engine.fire_periodic("recrawl").unwrap();
    let second = h.engine.fire_periodic("recrawl").unwrap();
    assert_ne!(first, second);

    let request = h.engine.submission(&first).unwrap();
    assert_eq!(request.queue, "crawling");
    assert_eq!(request.kwargs["url"], "https://example.org");

    // Periodic runs are counted against the schedule name
    let stats = h.ctx.ledger().statistics().await.unwrap();
    assert_eq!(stats.schedule_submissions["recrawl"], 2);

    // Engine-submitted tasks are picked up by the ledger on first lookup
    let task = h.ctx.ledger().status(&first).await.unwrap();
    assert_eq!(task.metadata.schedule.as_deref(), Some("recrawl"));
    assert!(matches!(
        h.ctx.scheduler().get("recrawl").unwrap().config.schedule_type,
        ScheduleType::Interval
    ));
}

#[tokio::test]
async fn delayed_schedule_submits_with_countdown_retries_and_expiry() {
    let h = TestHarness::new().await;
    let start = Utc::now() + chrono::Duration::minutes(10);

    h.ctx
        .scheduler()
        .add(
            ScheduleConfig::builder()
                .name("later")
                .task_name(SYNC_TASK)
                .schedule_type(ScheduleType::Delayed)
                .start_time(start)
                .max_retries(3u32)
                .timeout_seconds(120u64)
                .build(),
        )
        .await
        .unwrap();

    let status = h.ctx.scheduler().get("later").unwrap();
    let task_id = status.task_id.expect("delayed schedule submits immediately");
    let request = h.engine.submission(&task_id).unwrap();

    let countdown = request.countdown.unwrap();
    assert!(countdown <= Duration::from_secs(600));
    assert!(countdown > Duration::from_secs(590));
    assert_eq!(
        request.retry_policy,
        Some(EngineRetryPolicy {
            max_retries: 3,
            interval: Duration::from_secs(60),
        })
    );
    let expires = request.expires.unwrap();
    assert!(expires > start + chrono::Duration::seconds(110));
    assert!(expires <= start + chrono::Duration::seconds(120));
}

#[tokio::test]
async fn batch_schedule_staggers_slices_and_disables_together() {
    let h = TestHarness::new().await;
    let scheduler = h.ctx.scheduler();
    let start = Utc::now() + chrono::Duration::seconds(30);
    let base = ScheduleConfig::builder()
        .name("import")
        .task_name(SYNC_TASK)
        .schedule_type(ScheduleType::Once)
        .start_time(start)
        .build();
    let items: Vec<_> = (0..5).map(|i| json!({ "post": i })).collect();

    let batch_id = scheduler
        .create_batch_schedule(base, items, 2, Duration::from_secs(300))
        .await
        .unwrap();

    let members = scheduler.batch_members(&batch_id);
    assert_eq!(members, vec!["import_batch_0", "import_batch_1", "import_batch_2"]);

    let mut countdowns = Vec::new();
    for (index, name) in members.iter().enumerate() {
        let status = scheduler.get(name).unwrap();
        assert_eq!(status.schedule_type, ScheduleType::Delayed);
        assert_eq!(
            status.config.start_time,
            Some(start + chrono::Duration::seconds(300 * index as i64))
        );

        let task_id = status.task_id.unwrap();
        let task = h.ctx.ledger().get(&task_id).unwrap();
        let batch = task.metadata.batch.unwrap();
        assert_eq!(batch.batch_id, batch_id);
        assert_eq!(batch.batch_index, index);
        assert_eq!(batch.batch_total, 3);

        let request = h.engine.submission(&task_id).unwrap();
        countdowns.push(request.countdown.unwrap());
        let expected_items = if index < 2 { 2 } else { 1 };
        assert_eq!(request.kwargs["items"].as_array().unwrap().len(), expected_items);
    }
    assert!(countdowns.windows(2).all(|pair| pair[1] > pair[0]));

    assert_eq!(scheduler.disable_batch(&batch_id).await.unwrap(), 3);
    for name in &members {
        let status = scheduler.get(name).unwrap();
        assert!(!status.enabled);
        let task = h.ctx.ledger().status(&status.task_id.unwrap()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Revoked);
    }

    assert_eq!(scheduler.remove_batch(&batch_id).await.unwrap(), 3);
    assert!(scheduler.batch_members(&batch_id).is_empty());
}

#[tokio::test]
async fn batch_schedule_rolls_back_when_a_slice_fails() {
    let h = TestHarness::new().await;
    let scheduler = h.ctx.scheduler();

    // Occupy the name of the second slice
    scheduler
        .add(
            ScheduleConfig::builder()
                .name("import_batch_1")
                .task_name(SYNC_TASK)
                .schedule_type(ScheduleType::Once)
                .enabled(false)
                .build(),
        )
        .await
        .unwrap();

    let base = ScheduleConfig::builder()
        .name("import")
        .task_name(SYNC_TASK)
        .schedule_type(ScheduleType::Once)
        .build();
    let items: Vec<_> = (0..4).map(|i| json!(i)).collect();

    let err = scheduler
        .create_batch_schedule(base, items, 2, Duration::from_secs(60))
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::InvalidSchedule { .. }));
    assert!(scheduler.get("import_batch_0").is_none());
    assert!(scheduler.get("import_batch_1").is_some());
    // The first slice's task was cancelled during rollback
    assert_eq!(h.engine.revocations().len(), 1);
}

#[tokio::test]
async fn removing_a_periodic_schedule_unregisters_it() {
    let h = TestHarness::new().await;
    let scheduler = h.ctx.scheduler();
    scheduler.add(cron("nightly", "30 3 * * 1-5")).await.unwrap();

    assert!(assert_ok!(scheduler.remove("nightly").await));
    assert!(!h.engine.is_periodic_registered("nightly"));
    assert!(scheduler.list().is_empty());
    assert!(!scheduler.remove("nightly").await.unwrap());
}
