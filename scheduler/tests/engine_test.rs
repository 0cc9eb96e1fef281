use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use bus::{EventBus, StreamConfig};
use corelib::models::{RequestPriority, Resource, Tier};
use quota::{MemoryCounterStore, QuotaConfig, QuotaEngine};
use registry::{CachedTenantRegistry, MemoryTenantDirectory, Plan, Tenant, TenantStatus};
use scheduler::{
    AdmissionError, DispatchedRequest, Request, SchedulerConfig, SchedulerEngine, WorkerCredits,
};

// -----------------------
// Helpers
// -----------------------

fn mk_tenant(plan: Plan) -> Tenant {
    Tenant {
        id: Uuid::new_v4(),
        name: format!("tenant-{plan}"),
        plan,
        status: TenantStatus::Active,
        weight_override: None,
        data_region: "us-east-1".to_string(),
        allowed_regions: BTreeSet::from(["us-east-1".to_string()]),
        quota_overrides: HashMap::new(),
        fail_open_override: None,
    }
}

fn mk_request(tenant_id: Uuid, priority: RequestPriority, deadline_ts_ms: Option<u64>) -> Request {
    Request {
        request_id: Uuid::new_v4(),
        tenant_id,
        user_id: None,
        session_id: None,
        arrival_ts_ms: 0,
        deadline_ts_ms,
        priority,
        payload: "do the thing".to_string(),
        schema: None,
        payload_json: None,
        fingerprint: 0,
    }
}

struct Harness {
    engine: Arc<SchedulerEngine>,
    rx: mpsc::Receiver<DispatchedRequest>,
    directory: Arc<MemoryTenantDirectory>,
    quota: Arc<QuotaEngine>,
    credits: Arc<WorkerCredits>,
    _bus: EventBus,
}

fn mk_harness(cfg: SchedulerConfig, dispatch_capacity: usize) -> Harness {
    let bus = EventBus::in_memory(StreamConfig::defaults(), 10_000);
    let directory = Arc::new(MemoryTenantDirectory::new());
    let registry = Arc::new(CachedTenantRegistry::new(directory.clone()));
    let quota = Arc::new(QuotaEngine::new(
        Arc::new(MemoryCounterStore::new()),
        bus.publisher(),
        QuotaConfig::default(),
    ));

    let (tx, rx) = mpsc::channel(dispatch_capacity);
    let credits = Arc::new(WorkerCredits::new());
    let engine = Arc::new(SchedulerEngine::new(
        cfg,
        registry,
        quota.clone(),
        bus.publisher(),
        tx,
        credits.clone(),
    ));

    Harness {
        engine,
        rx,
        directory,
        quota,
        credits,
        _bus: bus,
    }
}

use common::time::now_ms;

// -----------------------
// Fairness (S1)
// -----------------------

#[tokio::test]
async fn weighted_fair_sharing_under_overload() {
    // Dispatch capacity of 100 measures the first 100 grants across two
    // saturated tenants with weights 1 and 3.
    let mut h = mk_harness(SchedulerConfig::default(), 100);
    let t1 = mk_tenant(Plan::Free); // weight 1
    let t2 = mk_tenant(Plan::Pro); // weight 3
    h.directory.upsert(t1.clone());
    h.directory.upsert(t2.clone());

    for _ in 0..100 {
        h.engine
            .schedule(mk_request(t1.id, RequestPriority::Normal, None))
            .await
            .unwrap();
        h.engine
            .schedule(mk_request(t2.id, RequestPriority::Normal, None))
            .await
            .unwrap();
    }

    h.credits.add(Tier::B, 1_000);
    h.engine.drain_once().await;

    let mut served: HashMap<Uuid, usize> = HashMap::new();
    while let Ok(dispatched) = h.rx.try_recv() {
        *served.entry(dispatched.request.tenant_id).or_insert(0) += 1;
    }

    let s1 = *served.get(&t1.id).unwrap_or(&0);
    let s2 = *served.get(&t2.id).unwrap_or(&0);
    assert_eq!(s1 + s2, 100);

    // Long-run shares approximate 1:3 (±5 of the ideal 25/75 split).
    assert!((20..=30).contains(&s1), "tenant-1 served {s1}");
    assert!((70..=80).contains(&s2), "tenant-2 served {s2}");
}

// -----------------------
// Priority (S2)
// -----------------------

#[tokio::test]
async fn critical_arrival_preempts_backlog_of_normals() {
    let mut h = mk_harness(SchedulerConfig::default(), 16);
    let busy = mk_tenant(Plan::Free);
    let quiet = mk_tenant(Plan::Free);
    h.directory.upsert(busy.clone());
    h.directory.upsert(quiet.clone());

    for _ in 0..10 {
        h.engine
            .schedule(mk_request(busy.id, RequestPriority::Normal, None))
            .await
            .unwrap();
    }
    h.engine
        .schedule(mk_request(quiet.id, RequestPriority::Critical, None))
        .await
        .unwrap();

    h.credits.add(Tier::B, 1);
    // One credit, one pass: exactly one dispatch happens.
    h.engine.drain_once().await;
    assert_eq!(h.credits.available_total(), 0);

    let first = h.rx.try_recv().expect("one dispatch");
    assert_eq!(first.request.tenant_id, quiet.id);
    assert_eq!(first.request.priority, RequestPriority::Critical);
}

// -----------------------
// Deadlines (S3)
// -----------------------

#[tokio::test]
async fn expired_deadline_is_never_dispatched_and_returns_quota() {
    let mut h = mk_harness(SchedulerConfig::default(), 16);
    let tenant = mk_tenant(Plan::Free);
    h.directory.upsert(tenant.clone());

    let deadline = now_ms() + 50;
    h.engine
        .schedule(mk_request(tenant.id, RequestPriority::Normal, Some(deadline)))
        .await
        .unwrap();
    assert_eq!(
        h.quota.consumed(tenant.id, Resource::ApiCalls, now_ms()).await.unwrap(),
        1
    );

    tokio::time::sleep(Duration::from_millis(80)).await;

    h.credits.add(Tier::B, 10);
    h.engine.drain_once().await;

    assert!(h.rx.try_recv().is_err(), "expired request must not dispatch");
    assert_eq!(
        h.engine
            .counters
            .deadline_misses
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    assert_eq!(
        h.quota.consumed(tenant.id, Resource::ApiCalls, now_ms()).await.unwrap(),
        0
    );
}

// -----------------------
// Admission boundaries
// -----------------------

#[tokio::test]
async fn queue_at_depth_cap_rejects_the_next_admission() {
    let cfg = SchedulerConfig {
        queue_depth_cap: 3,
        ..SchedulerConfig::default()
    };
    let h = mk_harness(cfg, 16);
    let tenant = mk_tenant(Plan::Free);
    h.directory.upsert(tenant.clone());

    for _ in 0..3 {
        h.engine
            .schedule(mk_request(tenant.id, RequestPriority::Normal, None))
            .await
            .unwrap();
    }

    let err = h
        .engine
        .schedule(mk_request(tenant.id, RequestPriority::Normal, None))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::QueueFull { .. }));
    assert!(err.retry_after_ms().is_some());

    // The rejected admission must not hold quota.
    assert_eq!(
        h.quota.consumed(tenant.id, Resource::ApiCalls, now_ms()).await.unwrap(),
        3
    );
}

#[tokio::test]
async fn quota_exhaustion_rejects_with_reset_hint() {
    let h = mk_harness(SchedulerConfig::default(), 16);
    let mut tenant = mk_tenant(Plan::Free);
    tenant.quota_overrides.insert(Resource::ApiCalls, 2);
    h.directory.upsert(tenant.clone());

    for _ in 0..2 {
        h.engine
            .schedule(mk_request(tenant.id, RequestPriority::Normal, None))
            .await
            .unwrap();
    }

    let err = h
        .engine
        .schedule(mk_request(tenant.id, RequestPriority::Normal, None))
        .await
        .unwrap_err();
    match err {
        AdmissionError::QuotaExceeded {
            resource,
            retry_after_ms,
        } => {
            assert_eq!(resource, Resource::ApiCalls);
            assert!(retry_after_ms > 0, "hourly window reset must be ahead");
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn inactive_and_unknown_tenants_are_refused() {
    let h = mk_harness(SchedulerConfig::default(), 16);

    let mut suspended = mk_tenant(Plan::Pro);
    suspended.status = TenantStatus::Suspended;
    h.directory.upsert(suspended.clone());

    let err = h
        .engine
        .schedule(mk_request(suspended.id, RequestPriority::Normal, None))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::TenantInactive));

    let err = h
        .engine
        .schedule(mk_request(Uuid::new_v4(), RequestPriority::Normal, None))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::TenantInactive));
}

#[tokio::test]
async fn misconfigured_residency_is_region_forbidden() {
    let h = mk_harness(SchedulerConfig::default(), 16);
    let mut tenant = mk_tenant(Plan::Pro);
    tenant.allowed_regions = BTreeSet::from(["eu-west-1".to_string()]);
    h.directory.upsert(tenant.clone());

    let err = h
        .engine
        .schedule(mk_request(tenant.id, RequestPriority::Normal, None))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::RegionForbidden));
}

// -----------------------
// Cancellation
// -----------------------

#[tokio::test]
async fn cancel_returns_quota_to_its_preschedule_value() {
    let h = mk_harness(SchedulerConfig::default(), 16);
    let tenant = mk_tenant(Plan::Free);
    h.directory.upsert(tenant.clone());

    let ticket = h
        .engine
        .schedule(mk_request(tenant.id, RequestPriority::Normal, None))
        .await
        .unwrap();
    assert_eq!(
        h.quota.consumed(tenant.id, Resource::ApiCalls, now_ms()).await.unwrap(),
        1
    );

    assert!(h.engine.cancel(ticket.request_id).await);
    assert_eq!(
        h.quota.consumed(tenant.id, Resource::ApiCalls, now_ms()).await.unwrap(),
        0
    );

    // Idempotent.
    assert!(!h.engine.cancel(ticket.request_id).await);
}

#[tokio::test]
async fn clear_tenant_queue_releases_every_reservation() {
    let h = mk_harness(SchedulerConfig::default(), 16);
    let tenant = mk_tenant(Plan::Free);
    h.directory.upsert(tenant.clone());

    for _ in 0..5 {
        h.engine
            .schedule(mk_request(tenant.id, RequestPriority::Normal, None))
            .await
            .unwrap();
    }

    assert_eq!(h.engine.clear_tenant_queue(tenant.id).await, 5);
    assert_eq!(
        h.quota.consumed(tenant.id, Resource::ApiCalls, now_ms()).await.unwrap(),
        0
    );

    let stats = h.engine.queue_stats(tenant.id).expect("queue exists");
    assert_eq!(stats.depth, 0);
    assert_eq!(stats.dropped, 5);
}

// -----------------------
// Escalation requeue
// -----------------------

#[tokio::test]
async fn escalated_requeue_jumps_the_line_with_high_priority() {
    let mut h = mk_harness(SchedulerConfig::default(), 16);
    let tenant = mk_tenant(Plan::Pro);
    h.directory.upsert(tenant.clone());

    for _ in 0..3 {
        h.engine
            .schedule(mk_request(tenant.id, RequestPriority::Normal, None))
            .await
            .unwrap();
    }

    h.credits.add(Tier::B, 1);
    h.engine.drain_once().await;
    let first = h.rx.try_recv().expect("one dispatch");
    let quota_before = h
        .quota
        .consumed(tenant.id, Resource::ApiCalls, now_ms())
        .await
        .unwrap();

    h.engine.requeue_escalated(first.clone(), Tier::C);

    // Requeue bypasses admission: no extra quota consumed.
    assert_eq!(
        h.quota.consumed(tenant.id, Resource::ApiCalls, now_ms()).await.unwrap(),
        quota_before
    );

    h.credits.add(Tier::C, 1);
    h.engine.drain_once().await;
    let next = h.rx.try_recv().expect("requeued dispatch");
    assert_eq!(next.request.request_id, first.request.request_id);
    assert_eq!(next.request.priority, RequestPriority::High);
    assert_eq!(next.attempt, 1);
    assert_eq!(next.forced_tier, Some(Tier::C));
    assert_eq!(next.reservation_id, first.reservation_id);
}

// -----------------------
// Stats
// -----------------------

#[tokio::test]
async fn system_stats_aggregate_queues_and_weights() {
    let h = mk_harness(SchedulerConfig::default(), 16);
    let t1 = mk_tenant(Plan::Free);
    let t2 = mk_tenant(Plan::Enterprise);
    h.directory.upsert(t1.clone());
    h.directory.upsert(t2.clone());

    h.engine
        .schedule(mk_request(t1.id, RequestPriority::Normal, None))
        .await
        .unwrap();
    h.engine
        .schedule(mk_request(t2.id, RequestPriority::Normal, None))
        .await
        .unwrap();

    let stats = h.engine.system_stats();
    assert_eq!(stats.total_queues, 2);
    assert_eq!(stats.total_queued, 2);
    assert_eq!(stats.weight_distribution.get(&1), Some(&1));
    assert_eq!(stats.weight_distribution.get(&10), Some(&1));
}
