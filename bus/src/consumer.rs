//! Durable consumer configuration and bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use uuid::Uuid;

use crate::event::{Event, EventKind};

/// A subscriber's message callback. `Ok` acks the message (work-queue removal);
/// `Err` naks it and the bus redelivers up to `max_deliver` times.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Durable name; unique per stream.
    pub name: String,
    pub kind: EventKind,
    /// When set, only this tenant's events are delivered to the consumer.
    pub tenant_filter: Option<Uuid>,
    /// Total delivery attempts before the message dead-letters.
    pub max_deliver: u32,
    /// Budget for one handler invocation; overrun counts as a nak.
    pub ack_wait: Duration,
}

impl ConsumerConfig {
    pub fn new(name: impl Into<String>, kind: EventKind) -> Self {
        Self {
            name: name.into(),
            kind,
            tenant_filter: None,
            max_deliver: 3,
            ack_wait: Duration::from_secs(30),
        }
    }

    pub fn with_tenant_filter(mut self, tenant_id: Uuid) -> Self {
        self.tenant_filter = Some(tenant_id);
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver.max(1);
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }
}

pub(crate) struct ConsumerEntry {
    pub config: ConsumerConfig,
    pub handler: Arc<dyn EventHandler>,
    pub delivered: AtomicU64,
    pub redelivered: AtomicU64,
    pub failed: AtomicU64,
}

impl ConsumerEntry {
    pub fn new(config: ConsumerConfig, handler: Arc<dyn EventHandler>) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            delivered: AtomicU64::new(0),
            redelivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.config
            .tenant_filter
            .is_none_or(|t| t == event.tenant_id)
    }

    pub fn info(&self) -> ConsumerInfo {
        ConsumerInfo {
            name: self.config.name.clone(),
            kind: self.config.kind,
            delivered: self.delivered.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub name: String,
    pub kind: EventKind,
    pub delivered: u64,
    pub redelivered: u64,
    pub failed: u64,
}
