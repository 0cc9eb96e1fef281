//! The event bus.
//!
//! One work-queue stream per event kind plus a matching dead-letter stream.
//! Publishes are buffered in a bounded outbox and flushed by an owned task;
//! each stream has a serial delivery worker so per-(kind, tenant) order holds
//! for a single-worker consumer. Dead-letter workers run separately from the
//! main delivery workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use sqlx::AnyPool;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use corelib::models::RequestPriority;

use crate::consumer::{ConsumerConfig, ConsumerEntry, ConsumerInfo, EventHandler};
use crate::dlq::DlqEnvelope;
use crate::error::BusError;
use crate::event::{ENVELOPE_VERSION, Event, EventKind};
use crate::outbox::Outbox;
use crate::store::{MemoryStreamStore, SqliteStreamStore, StoredEvent, StreamStats, StreamStore};
use crate::stream::{StreamConfig, StreamStorage};

const FLUSH_BATCH: usize = 256;
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn unix_now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Default)]
pub struct BusMetrics {
    pub published: AtomicU64,
    pub flushed: AtomicU64,
    pub delivered: AtomicU64,
    pub redelivered: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub filtered: AtomicU64,
}

struct StreamState {
    config: StreamConfig,
    store: Arc<dyn StreamStore>,
    consumers: Mutex<Vec<Arc<ConsumerEntry>>>,
    notify: Notify,
    rr: AtomicUsize,
}

impl StreamState {
    fn new(config: StreamConfig, store: Arc<dyn StreamStore>) -> Self {
        Self {
            config,
            store,
            consumers: Mutex::new(Vec::new()),
            notify: Notify::new(),
            rr: AtomicUsize::new(0),
        }
    }
}

struct BusInner {
    streams: HashMap<EventKind, StreamState>,
    dlq_streams: HashMap<EventKind, StreamState>,
    outbox: Outbox,
    flush_notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    metrics: BusMetrics,
    poll_interval: Duration,
    redelivery_delay: Duration,
}

/// Cheap publish handle for producers.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<BusInner>,
}

impl Publisher {
    /// Buffer an event for publication and return its id. Never blocks and
    /// never touches storage; the flusher picks it up.
    pub fn publish(
        &self,
        kind: EventKind,
        tenant_id: Uuid,
        priority: RequestPriority,
        data: serde_json::Value,
        correlation_id: Option<Uuid>,
    ) -> Uuid {
        let event = Event::new(kind, tenant_id, priority, data, correlation_id, unix_now_s());
        let event_id = event.event_id;

        self.inner.metrics.published.fetch_add(1, Ordering::Relaxed);
        if !self.inner.outbox.push(event) {
            warn!(kind = %kind, "publish outbox overflowed; oldest entry dropped");
        }
        self.inner.flush_notify.notify_one();

        event_id
    }
}

pub struct EventBus {
    inner: Arc<BusInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    /// Fully in-memory bus; used by tests and the embedded runner.
    pub fn in_memory(configs: Vec<StreamConfig>, outbox_cap_per_kind: usize) -> Self {
        let mut streams = HashMap::new();
        let mut dlq_streams = HashMap::new();
        for config in configs {
            let kind = config.kind;
            streams.insert(
                kind,
                StreamState::new(config, Arc::new(MemoryStreamStore::new())),
            );
            dlq_streams.insert(
                kind,
                StreamState::new(
                    StreamConfig::dlq_default(kind),
                    Arc::new(MemoryStreamStore::new()),
                ),
            );
        }
        Self::from_parts(streams, dlq_streams, outbox_cap_per_kind)
    }

    /// File storage on sqlx for every stream except those configured
    /// memory-backed.
    pub async fn with_sqlite(
        pool: AnyPool,
        configs: Vec<StreamConfig>,
        outbox_cap_per_kind: usize,
    ) -> Result<Self, BusError> {
        let mut streams = HashMap::new();
        let mut dlq_streams = HashMap::new();
        for config in configs {
            let kind = config.kind;
            let store: Arc<dyn StreamStore> = match config.storage {
                StreamStorage::Memory => Arc::new(MemoryStreamStore::new()),
                StreamStorage::File => {
                    Arc::new(SqliteStreamStore::new(pool.clone(), kind, false).await?)
                }
            };
            streams.insert(kind, StreamState::new(config, store));

            let dlq_store: Arc<dyn StreamStore> =
                Arc::new(SqliteStreamStore::new(pool.clone(), kind, true).await?);
            dlq_streams.insert(
                kind,
                StreamState::new(StreamConfig::dlq_default(kind), dlq_store),
            );
        }
        Ok(Self::from_parts(streams, dlq_streams, outbox_cap_per_kind))
    }

    fn from_parts(
        streams: HashMap<EventKind, StreamState>,
        dlq_streams: HashMap<EventKind, StreamState>,
        outbox_cap_per_kind: usize,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(BusInner {
                streams,
                dlq_streams,
                outbox: Outbox::new(outbox_cap_per_kind),
                flush_notify: Notify::new(),
                shutdown_tx,
                metrics: BusMetrics::default(),
                poll_interval: Duration::from_millis(50),
                redelivery_delay: Duration::from_millis(200),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn publisher(&self) -> Publisher {
        Publisher {
            inner: self.inner.clone(),
        }
    }

    pub fn publish(
        &self,
        kind: EventKind,
        tenant_id: Uuid,
        priority: RequestPriority,
        data: serde_json::Value,
        correlation_id: Option<Uuid>,
    ) -> Uuid {
        self.publisher()
            .publish(kind, tenant_id, priority, data, correlation_id)
    }

    /// Register a durable consumer on a main stream.
    pub fn subscribe(
        &self,
        config: ConsumerConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BusError> {
        Self::register(&self.inner.streams, config, handler)
    }

    /// Register a consumer on a dead-letter stream. These never trigger
    /// automatic redelivery of the dead-lettered message.
    pub fn subscribe_dlq(
        &self,
        config: ConsumerConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BusError> {
        Self::register(&self.inner.dlq_streams, config, handler)
    }

    fn register(
        streams: &HashMap<EventKind, StreamState>,
        config: ConsumerConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BusError> {
        let state = streams
            .get(&config.kind)
            .ok_or_else(|| BusError::UnknownStream(config.kind.to_string()))?;

        let mut consumers = state.consumers.lock();
        if consumers.iter().any(|c| c.config.name == config.name) {
            return Err(BusError::DuplicateConsumer(config.name));
        }
        info!(consumer = %config.name, kind = %config.kind, "consumer registered");
        consumers.push(ConsumerEntry::new(config, handler));
        drop(consumers);

        state.notify.notify_one();
        Ok(())
    }

    /// Spawn the flusher, the per-stream delivery workers, the dead-letter
    /// workers, and the retention sweeper.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        tasks.push(tokio::spawn(Self::run_flusher(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));

        for kind in self.inner.streams.keys().copied() {
            tasks.push(tokio::spawn(Self::run_delivery_worker(
                self.inner.clone(),
                kind,
                false,
                self.inner.shutdown_tx.subscribe(),
            )));
        }
        for kind in self.inner.dlq_streams.keys().copied() {
            tasks.push(tokio::spawn(Self::run_delivery_worker(
                self.inner.clone(),
                kind,
                true,
                self.inner.shutdown_tx.subscribe(),
            )));
        }

        tasks.push(tokio::spawn(Self::run_retention_sweeper(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));
    }

    /// Flush the outbox, stop every worker, and wait for them.
    pub async fn shutdown(&self) {
        for _ in 0..32 {
            if self.inner.outbox.is_empty() {
                break;
            }
            Self::flush_once(&self.inner).await;
        }
        if !self.inner.outbox.is_empty() {
            warn!(
                remaining = self.inner.outbox.len(),
                "outbox not fully flushed at shutdown"
            );
        }

        let _ = self.inner.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("event bus shut down");
    }

    pub async fn stream_info(&self, kind: EventKind) -> Result<StreamStats, BusError> {
        let state = self
            .inner
            .streams
            .get(&kind)
            .ok_or_else(|| BusError::UnknownStream(kind.to_string()))?;
        state.store.stats().await
    }

    pub async fn dlq_info(&self, kind: EventKind) -> Result<StreamStats, BusError> {
        let state = self
            .inner
            .dlq_streams
            .get(&kind)
            .ok_or_else(|| BusError::UnknownStream(kind.to_string()))?;
        state.store.stats().await
    }

    pub fn consumer_info(&self, kind: EventKind, name: &str) -> Option<ConsumerInfo> {
        let state = self.inner.streams.get(&kind)?;
        let consumers = state.consumers.lock();
        consumers
            .iter()
            .find(|c| c.config.name == name)
            .map(|c| c.info())
    }

    /// Events dropped from the outbox because of overflow.
    pub fn outbox_dropped(&self) -> u64 {
        self.inner.outbox.dropped_total()
    }

    pub fn metrics(&self) -> &BusMetrics {
        &self.inner.metrics
    }

    /// Move up to `max` dead-lettered messages back onto their main stream.
    /// This is the only way out of a DLQ besides retention.
    pub async fn requeue_dlq(&self, kind: EventKind, max: usize) -> Result<u64, BusError> {
        let dlq = self
            .inner
            .dlq_streams
            .get(&kind)
            .ok_or_else(|| BusError::UnknownStream(kind.to_string()))?;
        let main = self
            .inner
            .streams
            .get(&kind)
            .ok_or_else(|| BusError::UnknownStream(kind.to_string()))?;

        let mut moved = 0u64;
        for stored in dlq.store.next_available(&[], max).await? {
            let envelope: DlqEnvelope = match serde_json::from_value(stored.event.data.clone()) {
                Ok(env) => env,
                Err(e) => {
                    warn!(seq = stored.seq, error = %e, "unparseable dead-letter envelope; skipping");
                    continue;
                }
            };

            main.store
                .append(&envelope.original_subject, &envelope.data, unix_now_s())
                .await?;
            dlq.store.remove(stored.seq).await?;
            moved += 1;
        }

        if moved > 0 {
            main.notify.notify_one();
        }
        Ok(moved)
    }

    // -- owned loops --------------------------------------------------------

    async fn run_flusher(inner: Arc<BusInner>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = inner.flush_notify.notified() => {}
                _ = tokio::time::sleep(inner.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        Self::flush_once(&inner).await;
                        return;
                    }
                }
            }
            Self::flush_once(&inner).await;
        }
    }

    async fn flush_once(inner: &Arc<BusInner>) {
        loop {
            let batch = inner.outbox.drain(FLUSH_BATCH);
            if batch.is_empty() {
                return;
            }

            for (i, event) in batch.iter().enumerate() {
                let Some(state) = inner.streams.get(&event.kind) else {
                    continue;
                };
                let subject = event.subject();
                match state.store.append(&subject, event, unix_now_s()).await {
                    Ok(_) => {
                        inner.metrics.flushed.fetch_add(1, Ordering::Relaxed);
                        state.notify.notify_one();
                    }
                    Err(e) => {
                        warn!(kind = %event.kind, error = %e, "stream append failed; retrying later");
                        // Preserve order: this event back to the front, the
                        // rest of the batch behind it.
                        for ev in batch[i..].iter().rev() {
                            inner.outbox.requeue_front(ev.clone());
                        }
                        return;
                    }
                }
            }
        }
    }

    async fn run_delivery_worker(
        inner: Arc<BusInner>,
        kind: EventKind,
        dlq: bool,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let streams = if dlq { &inner.dlq_streams } else { &inner.streams };
        let Some(state) = streams.get(&kind) else {
            return;
        };
        let mut delayed: HashMap<u64, tokio::time::Instant> = HashMap::new();

        loop {
            tokio::select! {
                _ = state.notify.notified() => {}
                _ = tokio::time::sleep(inner.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            loop {
                let now = tokio::time::Instant::now();
                delayed.retain(|_, at| *at > now);
                let skip: Vec<u64> = delayed.keys().copied().collect();

                let batch = match state.store.next_available(&skip, 1).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(kind = %kind, dlq, error = %e, "stream read failed");
                        break;
                    }
                };
                let Some(msg) = batch.into_iter().next() else {
                    break;
                };

                if !Self::deliver_one(&inner, state, kind, dlq, msg, &mut delayed).await {
                    break;
                }
            }
        }
    }

    /// Deliver a single message; returns `false` when the loop should idle
    /// (no consumer available).
    async fn deliver_one(
        inner: &Arc<BusInner>,
        state: &StreamState,
        kind: EventKind,
        dlq: bool,
        msg: StoredEvent,
        delayed: &mut HashMap<u64, tokio::time::Instant>,
    ) -> bool {
        let consumers: Vec<Arc<ConsumerEntry>> = state.consumers.lock().clone();
        if consumers.is_empty() {
            return false;
        }

        let matching: Vec<Arc<ConsumerEntry>> = consumers
            .iter()
            .filter(|c| c.matches(&msg.event))
            .cloned()
            .collect();

        if matching.is_empty() {
            if dlq {
                // Dead letters are never discarded on filter mismatch.
                return false;
            }
            // Work-queue semantics: nobody is interested, consume and move on.
            let _ = state.store.remove(msg.seq).await;
            inner.metrics.filtered.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let idx = state.rr.fetch_add(1, Ordering::Relaxed) % matching.len();
        let consumer = &matching[idx];

        // A message that already exhausted its deliveries goes straight to the
        // dead letter stream; it must not reach a handler again.
        if !dlq && msg.delivery_count >= consumer.config.max_deliver {
            Self::dead_letter(inner, state, kind, &msg, "max deliveries exhausted").await;
            return true;
        }

        if msg.delivery_count > 0 {
            consumer.redelivered.fetch_add(1, Ordering::Relaxed);
            inner.metrics.redelivered.fetch_add(1, Ordering::Relaxed);
        }

        let outcome =
            tokio::time::timeout(consumer.config.ack_wait, consumer.handler.handle(&msg.event))
                .await;

        match outcome {
            Ok(Ok(())) => {
                let _ = state.store.remove(msg.seq).await;
                consumer.delivered.fetch_add(1, Ordering::Relaxed);
                inner.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(Err(e)) => {
                Self::on_nak(inner, state, kind, dlq, &msg, consumer, e.to_string(), delayed).await
            }
            Err(_) => {
                let err = format!("ack wait of {:?} elapsed", consumer.config.ack_wait);
                Self::on_nak(inner, state, kind, dlq, &msg, consumer, err, delayed).await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_nak(
        inner: &Arc<BusInner>,
        state: &StreamState,
        kind: EventKind,
        dlq: bool,
        msg: &StoredEvent,
        consumer: &Arc<ConsumerEntry>,
        error: String,
        delayed: &mut HashMap<u64, tokio::time::Instant>,
    ) -> bool {
        consumer.failed.fetch_add(1, Ordering::Relaxed);

        if dlq {
            // Dead-letter handlers get one shot; the message stays consumed
            // either way so the pool never spins on a poison message.
            debug!(kind = %kind, seq = msg.seq, error = %error, "dlq handler failed; dropping");
            let _ = state.store.remove(msg.seq).await;
            return true;
        }

        let count = msg.delivery_count + 1;
        if count >= consumer.config.max_deliver {
            Self::dead_letter(inner, state, kind, msg, &error).await;
            return true;
        }

        if let Err(e) = state.store.set_delivery_count(msg.seq, count).await {
            warn!(kind = %kind, seq = msg.seq, error = %e, "failed to record delivery count");
        }
        delayed.insert(
            msg.seq,
            tokio::time::Instant::now() + inner.redelivery_delay,
        );
        debug!(kind = %kind, seq = msg.seq, count, error = %error, "delivery rejected; will retry");
        true
    }

    async fn dead_letter(
        inner: &Arc<BusInner>,
        state: &StreamState,
        kind: EventKind,
        msg: &StoredEvent,
        error: &str,
    ) {
        let Some(dlq_state) = inner.dlq_streams.get(&kind) else {
            return;
        };

        let envelope = DlqEnvelope::new(
            &msg.event,
            msg.subject.clone(),
            error.to_string(),
            msg.delivery_count + 1,
        );
        let data = match serde_json::to_value(&envelope) {
            Ok(v) => v,
            Err(e) => {
                warn!(kind = %kind, seq = msg.seq, error = %e, "failed to encode dlq envelope");
                return;
            }
        };

        let wrapper = Event {
            event_id: Uuid::new_v4(),
            kind,
            tenant_id: msg.event.tenant_id,
            priority: msg.event.priority,
            correlation_id: msg.event.correlation_id,
            ts: unix_now_s(),
            version: ENVELOPE_VERSION.to_string(),
            data,
        };

        match dlq_state
            .store
            .append(&kind.dlq_subject(), &wrapper, unix_now_s())
            .await
        {
            Ok(_) => {
                let _ = state.store.remove(msg.seq).await;
                inner.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(kind = %kind, event_id = %msg.event.event_id, error, "message dead-lettered");
                dlq_state.notify.notify_one();
            }
            Err(e) => {
                warn!(kind = %kind, seq = msg.seq, error = %e, "dead-letter append failed; message kept");
            }
        }
    }

    async fn run_retention_sweeper(inner: Arc<BusInner>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RETENTION_SWEEP_INTERVAL) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            let now = unix_now_s();
            for state in inner.streams.values().chain(inner.dlq_streams.values()) {
                match state
                    .store
                    .enforce_retention(now, state.config.max_age_s, state.config.max_msgs)
                    .await
                {
                    Ok(0) => {}
                    Ok(dropped) => {
                        debug!(kind = %state.config.kind, dropped, "retention trimmed stream");
                    }
                    Err(e) => {
                        warn!(kind = %state.config.kind, error = %e, "retention sweep failed");
                    }
                }
            }
        }
    }
}
