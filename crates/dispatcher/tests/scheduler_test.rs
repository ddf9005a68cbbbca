mod common;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use common::Harness;
use taskhub_core::SchedulerConfig;
use taskhub_dispatcher::{PeriodicRequest, Scheduler};
use taskhub_domain::{Principal, TaskFilter, TaskTemplate, Tenant};
use taskhub_errors::ErrorKind;

fn request(cron: &str, timezone: &str) -> PeriodicRequest {
    PeriodicRequest {
        tenant: Tenant::company("acme"),
        name: "weekly-digest".into(),
        template: TaskTemplate {
            task_type: "noop".into(),
            principal: Principal::new("user-1", "acme"),
            priority: None,
            input: json!({"digest": true}),
            max_attempts: None,
        },
        cron: cron.into(),
        timezone: timezone.into(),
        start_at: None,
        end_at: None,
        max_fires: None,
        catch_up: false,
        origin_task_id: None,
    }
}

fn scheduler(h: &Harness, instance: &str) -> Scheduler {
    Scheduler::new(h.hub.clone(), SchedulerConfig::default(), instance)
}

async fn task_count(h: &Harness) -> usize {
    h.hub.list(&TaskFilter::default()).await.unwrap().len()
}

#[tokio::test]
async fn test_weekly_paris_definition_fires_once() {
    let h = Harness::new().await;
    let scheduler = scheduler(&h, "node-a");

    // 开始时间是周一 09:00 巴黎时间
    let definition = scheduler
        .define(request("0 9 * * 1", "Europe/Paris"))
        .await
        .unwrap();
    assert_eq!(definition.next_fire_at, Some(h.now()));

    h.advance(1);
    let report = scheduler.tick().await.unwrap();
    assert!(report.leader);
    assert_eq!(report.periodic_fired, 1);

    let saved = h.repos.periodic.get(definition.id).await.unwrap().unwrap();
    assert_eq!(
        saved.last_fire_at,
        Some(Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap())
    );
    assert_eq!(
        saved.next_fire_at,
        Some(Utc.with_ymd_and_hms(2024, 3, 11, 8, 0, 0).unwrap())
    );
    assert_eq!(saved.fires_count, 1);
    assert!(saved.last_fire_at < saved.next_fire_at);

    let tasks = h.hub.list(&TaskFilter::default()).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].periodic_definition_id, Some(definition.id));
    assert_eq!(tasks[0].input, json!({"digest": true}));

    // 同一轮内不会再次物化
    assert_eq!(scheduler.tick().await.unwrap().periodic_fired, 0);
    assert_eq!(task_count(&h).await, 1);
}

#[tokio::test]
async fn test_missed_occurrences_collapse_without_catch_up() {
    let h = Harness::new().await;
    let scheduler = scheduler(&h, "node-a");
    let definition = scheduler.define(request("* * * * *", "UTC")).await.unwrap();

    h.advance(10 * 60 + 30);
    assert_eq!(scheduler.tick().await.unwrap().periodic_fired, 1);

    let saved = h.repos.periodic.get(definition.id).await.unwrap().unwrap();
    let last = h.now() - Duration::seconds(30);
    assert_eq!(saved.last_fire_at, Some(last));
    assert_eq!(saved.next_fire_at, Some(last + Duration::minutes(1)));
}

#[tokio::test]
async fn test_long_downtime_collapses_to_latest_occurrence() {
    let h = Harness::new().await;
    let scheduler = scheduler(&h, "node-a");
    let definition = scheduler.define(request("* * * * *", "UTC")).await.unwrap();

    h.advance(100 * 24 * 3600 + 30);
    assert_eq!(scheduler.tick().await.unwrap().periodic_fired, 1);

    let latest = h.now() - Duration::seconds(30);
    let saved = h.repos.periodic.get(definition.id).await.unwrap().unwrap();
    assert_eq!(saved.last_fire_at, Some(latest));
    assert!(saved.next_fire_at.unwrap() > h.now());

    let tasks = h.hub.list(&TaskFilter::default()).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(
        tasks[0].idempotency_key,
        Some(format!("periodic:{}:{}", definition.id, latest.timestamp()))
    );
}

#[tokio::test]
async fn test_catch_up_materializes_bounded_backlog_in_order() {
    let h = Harness::new().await;
    let scheduler = Scheduler::new(
        h.hub.clone(),
        SchedulerConfig {
            catch_up_limit: 3,
            ..SchedulerConfig::default()
        },
        "node-a",
    );
    let mut req = request("* * * * *", "UTC");
    req.catch_up = true;
    let definition = scheduler.define(req).await.unwrap();

    h.advance(10 * 60 + 30);
    assert_eq!(scheduler.tick().await.unwrap().periodic_fired, 3);

    let saved = h.repos.periodic.get(definition.id).await.unwrap().unwrap();
    assert_eq!(saved.fires_count, 3);
    assert_eq!(saved.last_fire_at, Some(h.now() - Duration::seconds(30)));

    let keys: Vec<String> = h
        .hub
        .list(&TaskFilter::default())
        .await
        .unwrap()
        .into_iter()
        .filter_map(|t| t.idempotency_key)
        .collect();
    assert_eq!(keys.len(), 3);
    let base = h.now() - Duration::seconds(30);
    for offset in [2, 1, 0] {
        let fire = base - Duration::minutes(offset);
        assert!(keys.contains(&format!("periodic:{}:{}", definition.id, fire.timestamp())));
    }
}

#[tokio::test]
async fn test_max_fires_deactivates_definition() {
    let h = Harness::new().await;
    let scheduler = scheduler(&h, "node-a");
    let mut req = request("* * * * *", "UTC");
    req.catch_up = true;
    req.max_fires = Some(2);
    let definition = scheduler.define(req).await.unwrap();

    h.advance(5 * 60);
    assert_eq!(scheduler.tick().await.unwrap().periodic_fired, 2);
    let saved = h.repos.periodic.get(definition.id).await.unwrap().unwrap();
    assert!(!saved.active);
    assert_eq!(saved.fires_count, 2);

    h.advance(5 * 60);
    assert_eq!(scheduler.tick().await.unwrap().periodic_fired, 0);
    assert_eq!(task_count(&h).await, 2);
}

#[tokio::test]
async fn test_end_of_window_deactivates_definition() {
    let h = Harness::new().await;
    let scheduler = scheduler(&h, "node-a");
    let mut req = request("0 * * * *", "UTC");
    req.end_at = Some(h.now() + Duration::minutes(90));
    let definition = scheduler.define(req).await.unwrap();

    h.advance(60 * 60 + 30);
    assert_eq!(scheduler.tick().await.unwrap().periodic_fired, 1);
    let saved = h.repos.periodic.get(definition.id).await.unwrap().unwrap();
    assert_eq!(saved.next_fire_at, None);
    assert!(!saved.active);
}

#[tokio::test]
async fn test_only_leader_materializes() {
    let h = Harness::new().await;
    let a = scheduler(&h, "node-a");
    let b = scheduler(&h, "node-b");
    a.define(request("* * * * *", "UTC")).await.unwrap();

    h.advance(61);
    assert!(a.tick().await.unwrap().leader);
    let report = b.tick().await.unwrap();
    assert!(!report.leader);
    assert_eq!(report.periodic_fired, 0);

    // 锁过期后其他实例接管
    h.advance(31);
    assert!(b.tick().await.unwrap().leader);
}

#[tokio::test]
async fn test_define_validation_and_deactivate() {
    let h = Harness::new().await;
    let scheduler = scheduler(&h, "node-a");

    let err = scheduler
        .define(request("0 9 * *", "UTC"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let mut unknown = request("0 9 * * 1", "UTC");
    unknown.template.task_type = "render_video".into();
    assert!(scheduler.define(unknown).await.is_err());

    let definition = scheduler.define(request("0 9 * * 1", "UTC")).await.unwrap();
    let first = scheduler.deactivate(definition.id).await.unwrap();
    assert!(!first.active);
    let second = scheduler.deactivate(definition.id).await.unwrap();
    assert_eq!(second.version, first.version);
}
