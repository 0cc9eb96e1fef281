use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use bus::{ConsumerConfig, Event, EventBus, EventHandler, EventKind, StreamConfig};
use corelib::models::RequestPriority;

// -----------------------
// Helpers
// -----------------------

struct Recorder {
    seen: Mutex<Vec<Event>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait::async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        event.check_version()?;
        self.seen.lock().push(event.clone());
        Ok(())
    }
}

/// Fails the first `failures` deliveries, then succeeds.
struct Flaky {
    failures: u64,
    attempts: AtomicU64,
    seen: Mutex<Vec<Event>>,
}

impl Flaky {
    fn new(failures: u64) -> Arc<Self> {
        Arc::new(Self {
            failures,
            attempts: AtomicU64::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl EventHandler for Flaky {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            anyhow::bail!("transient failure on attempt {attempt}");
        }
        self.seen.lock().push(event.clone());
        Ok(())
    }
}

fn bus() -> EventBus {
    EventBus::in_memory(StreamConfig::defaults(), 10_000)
}

async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// -----------------------
// Tests
// -----------------------

#[tokio::test]
async fn publish_reaches_subscriber_exactly_once_on_ack() {
    let bus = bus();
    let recorder = Recorder::new();
    bus.subscribe(
        ConsumerConfig::new("billing", EventKind::UsageMetered),
        recorder.clone(),
    )
    .unwrap();
    bus.start();

    let tenant = Uuid::new_v4();
    bus.publish(
        EventKind::UsageMetered,
        tenant,
        RequestPriority::Normal,
        serde_json::json!({"quantity": 3}),
        None,
    );

    assert!(wait_until(|| recorder.count() == 1, Duration::from_secs(2)).await);

    // Work-queue retention: the acked message is gone from the stream.
    let stats = bus.stream_info(EventKind::UsageMetered).await.unwrap();
    assert_eq!(stats.messages, 0);

    bus.shutdown().await;
    assert_eq!(recorder.count(), 1);
}

#[tokio::test]
async fn three_naks_move_event_to_dlq_and_stop_primary_delivery() {
    let bus = bus();
    let flaky = Flaky::new(u64::MAX); // always fails
    bus.subscribe(
        ConsumerConfig::new("billing", EventKind::UsageMetered)
            .with_max_deliver(3)
            .with_ack_wait(Duration::from_secs(1)),
        flaky.clone(),
    )
    .unwrap();
    bus.start();

    bus.publish(
        EventKind::UsageMetered,
        Uuid::new_v4(),
        RequestPriority::Normal,
        serde_json::json!({"quantity": 1}),
        None,
    );

    // After the third nak the event appears on dlq.usage_metered.
    assert!(
        wait_until(
            || bus.metrics().dead_lettered.load(Ordering::Relaxed) == 1,
            Duration::from_secs(5)
        )
        .await
    );

    let dlq = bus.dlq_info(EventKind::UsageMetered).await.unwrap();
    assert_eq!(dlq.messages, 1);

    let main = bus.stream_info(EventKind::UsageMetered).await.unwrap();
    assert_eq!(main.messages, 0);

    // Exactly three delivery attempts reached the handler, never a fourth.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);

    bus.shutdown().await;
}

#[tokio::test]
async fn dlq_requeue_gives_the_event_another_run() {
    let bus = bus();
    // Fails three times (dead-letters), succeeds after requeue.
    let flaky = Flaky::new(3);
    bus.subscribe(
        ConsumerConfig::new("billing", EventKind::UsageMetered).with_max_deliver(3),
        flaky.clone(),
    )
    .unwrap();
    bus.start();

    bus.publish(
        EventKind::UsageMetered,
        Uuid::new_v4(),
        RequestPriority::Normal,
        serde_json::json!({"quantity": 7}),
        None,
    );

    assert!(
        wait_until(
            || bus.metrics().dead_lettered.load(Ordering::Relaxed) == 1,
            Duration::from_secs(5)
        )
        .await
    );

    let moved = bus.requeue_dlq(EventKind::UsageMetered, 10).await.unwrap();
    assert_eq!(moved, 1);

    assert!(wait_until(|| flaky.seen.lock().len() == 1, Duration::from_secs(5)).await);
    assert_eq!(flaky.seen.lock()[0].data["quantity"], 7);

    bus.shutdown().await;
}

#[tokio::test]
async fn tenant_filter_only_sees_its_own_events() {
    let bus = bus();
    let mine = Uuid::new_v4();
    let other = Uuid::new_v4();

    let recorder = Recorder::new();
    bus.subscribe(
        ConsumerConfig::new("tenant-scoped", EventKind::AgentRun).with_tenant_filter(mine),
        recorder.clone(),
    )
    .unwrap();
    bus.start();

    for tenant in [mine, other, mine, other] {
        bus.publish(
            EventKind::AgentRun,
            tenant,
            RequestPriority::Normal,
            serde_json::json!({}),
            None,
        );
    }

    assert!(wait_until(|| recorder.count() == 2, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.count(), 2);
    assert!(recorder.seen.lock().iter().all(|e| e.tenant_id == mine));

    bus.shutdown().await;
}

#[tokio::test]
async fn per_tenant_order_is_preserved_for_single_worker_consumer() {
    let bus = bus();
    let recorder = Recorder::new();
    bus.subscribe(
        ConsumerConfig::new("ordered", EventKind::ToolCall),
        recorder.clone(),
    )
    .unwrap();
    bus.start();

    let tenant = Uuid::new_v4();
    for i in 0..20u64 {
        bus.publish(
            EventKind::ToolCall,
            tenant,
            RequestPriority::Normal,
            serde_json::json!({ "n": i }),
            None,
        );
    }

    assert!(wait_until(|| recorder.count() == 20, Duration::from_secs(5)).await);

    let seen = recorder.seen.lock();
    let order: Vec<u64> = seen.iter().map(|e| e.data["n"].as_u64().unwrap()).collect();
    assert_eq!(order, (0..20).collect::<Vec<u64>>());

    bus.shutdown().await;
}

#[tokio::test]
async fn dlq_consumer_receives_the_dead_letter_envelope() {
    let bus = bus();
    let flaky = Flaky::new(u64::MAX);
    bus.subscribe(
        ConsumerConfig::new("billing", EventKind::UsageMetered).with_max_deliver(3),
        flaky,
    )
    .unwrap();

    let dlq_recorder = Recorder::new();
    bus.subscribe_dlq(
        ConsumerConfig::new("billing-dlq", EventKind::UsageMetered),
        dlq_recorder.clone(),
    )
    .unwrap();
    bus.start();

    let tenant = Uuid::new_v4();
    bus.publish(
        EventKind::UsageMetered,
        tenant,
        RequestPriority::Normal,
        serde_json::json!({"quantity": 11}),
        None,
    );

    assert!(wait_until(|| dlq_recorder.count() == 1, Duration::from_secs(5)).await);

    let seen = dlq_recorder.seen.lock();
    let envelope: bus::DlqEnvelope = serde_json::from_value(seen[0].data.clone()).unwrap();
    assert_eq!(envelope.original_subject, "events.usage_metered");
    assert_eq!(envelope.retry_count, 3);
    assert_eq!(envelope.data.tenant_id, tenant);
    assert_eq!(envelope.data.data["quantity"], 11);
    assert!(!envelope.error.is_empty());
    drop(seen);

    // Consumed by the dlq worker: nothing left on the dlq stream.
    let dlq = bus.dlq_info(EventKind::UsageMetered).await.unwrap();
    assert_eq!(dlq.messages, 0);

    bus.shutdown().await;
}

#[tokio::test]
async fn consumer_info_tracks_deliveries() {
    let bus = bus();
    let recorder = Recorder::new();
    bus.subscribe(
        ConsumerConfig::new("audit", EventKind::AuditLog),
        recorder.clone(),
    )
    .unwrap();
    bus.start();

    for _ in 0..3 {
        bus.publish(
            EventKind::AuditLog,
            Uuid::new_v4(),
            RequestPriority::Normal,
            serde_json::json!({}),
            None,
        );
    }
    assert!(wait_until(|| recorder.count() == 3, Duration::from_secs(2)).await);

    let info = bus.consumer_info(EventKind::AuditLog, "audit").expect("known consumer");
    assert_eq!(info.delivered, 3);
    assert_eq!(info.failed, 0);

    assert!(bus.consumer_info(EventKind::AuditLog, "nobody").is_none());

    bus.shutdown().await;
}

#[tokio::test]
async fn duplicate_consumer_name_is_rejected() {
    let bus = bus();
    let recorder = Recorder::new();
    bus.subscribe(
        ConsumerConfig::new("audit", EventKind::AuditLog),
        recorder.clone(),
    )
    .unwrap();

    let err = bus
        .subscribe(ConsumerConfig::new("audit", EventKind::AuditLog), recorder)
        .unwrap_err();
    assert!(matches!(err, bus::BusError::DuplicateConsumer(_)));
}
