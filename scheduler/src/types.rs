//! Shared types used by the scheduling subsystem.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

use corelib::models::{RequestPriority, Resource, Tier};
use quota::QuotaStatus;
use registry::{Plan, Tenant, TenantId};

pub type RequestId = Uuid;

/// An admitted unit of work. Immutable once admitted; destroyed after its
/// terminal outcome is recorded.
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: RequestId,
    pub tenant_id: TenantId,
    pub user_id: Option<String>,
    pub session_id: Option<Uuid>,
    /// Stamped at admission.
    pub arrival_ts_ms: u64,
    pub deadline_ts_ms: Option<u64>,
    pub priority: RequestPriority,
    /// Prompt / message text.
    pub payload: String,
    /// Output JSON schema, when structured output was requested.
    pub schema: Option<serde_json::Value>,
    /// Raw JSON arguments accompanying the prompt, if any.
    pub payload_json: Option<String>,
    /// Stable content fingerprint.
    pub fingerprint: u64,
}

/// Fair-share weight per plan. Operator-set tenant overrides win over these.
#[derive(Debug, Clone, Copy)]
pub struct PlanWeights {
    pub free: u32,
    pub pro: u32,
    pub enterprise: u32,
}

impl Default for PlanWeights {
    fn default() -> Self {
        Self {
            free: 1,
            pro: 3,
            enterprise: 10,
        }
    }
}

impl PlanWeights {
    pub fn for_plan(&self, plan: Plan) -> u32 {
        match plan {
            Plan::Free => self.free,
            Plan::Pro => self.pro,
            Plan::Enterprise => self.enterprise,
        }
        .max(1)
    }

    /// Effective weight: tenant override first, then the plan's weight.
    pub fn for_tenant(&self, tenant: &Tenant) -> u32 {
        tenant
            .weight_override
            .unwrap_or_else(|| self.for_plan(tenant.plan))
            .max(1)
    }
}

/// Configuration knobs for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Dispatch loop period; the loop also wakes on every enqueue.
    pub tick_interval: Duration,

    /// Per-tenant maximum queued requests.
    pub queue_depth_cap: usize,

    /// Deadline proximity that earns the urgency boost, in seconds.
    pub urgency_window_s: f64,

    /// Score bonus per priority level.
    pub priority_boost_step: f64,

    /// Flat score bonus for deadline-urgent heads.
    pub urgency_boost: f64,

    /// Empty queues idle longer than this are evicted.
    pub idle_queue_ttl_ms: u64,

    /// Fair-share weights per plan.
    pub weights: PlanWeights,

    /// Resource and amount reserved per admission.
    pub admission_resource: Resource,
    pub admission_amount: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            queue_depth_cap: 1000,
            urgency_window_s: 1.0,
            priority_boost_step: 0.1,
            urgency_boost: 10.0,
            idle_queue_ttl_ms: 10 * 60 * 1000,
            weights: PlanWeights::default(),
            admission_resource: Resource::ApiCalls,
            admission_amount: 1,
        }
    }
}

/// Why admission refused a request. Each variant maps to one wire-level
/// rejection code at the edge.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("tenant queue is full")]
    QueueFull { retry_after_ms: u64 },

    #[error("quota exceeded for {resource}")]
    QuotaExceeded {
        resource: Resource,
        retry_after_ms: u64,
    },

    #[error("tenant is not active")]
    TenantInactive,

    #[error("region not allowed for tenant")]
    RegionForbidden,

    /// The tenant-isolation session variable could not be bound; reads fail
    /// closed rather than run unscoped.
    #[error("tenant session bind failed: {0}")]
    TenantBind(String),

    #[error("downstream unavailable: {0}")]
    DownstreamUnavailable(String),
}

impl AdmissionError {
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            AdmissionError::QueueFull { retry_after_ms }
            | AdmissionError::QuotaExceeded { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Successful admission: the request is queued and quota is reserved.
#[derive(Debug, Clone)]
pub struct AdmissionTicket {
    pub request_id: RequestId,
    pub reservation_id: Uuid,
    pub quota_status: QuotaStatus,
}

/// What the scheduler hands the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchedRequest {
    pub request: Request,
    pub reservation_id: Uuid,
    /// Tenant snapshot at admission; the dispatcher needs plan and region.
    pub tenant: Tenant,
    /// 0 on first dispatch, incremented per escalation requeue.
    pub attempt: u32,
    /// Set when an escalation already picked the tier, bypassing the router.
    pub forced_tier: Option<Tier>,
}

pub type DispatchSender = Sender<DispatchedRequest>;

/// Non-blocking per-tier credit board. Workers advertise capacity; the
/// scheduler only drains while some credit exists anywhere.
#[derive(Debug, Default)]
pub struct WorkerCredits {
    per_tier: [AtomicI64; 3],
}

impl WorkerCredits {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(tier: Tier) -> usize {
        match tier {
            Tier::A => 0,
            Tier::B => 1,
            Tier::C => 2,
        }
    }

    pub fn add(&self, tier: Tier, n: u32) {
        self.per_tier[Self::slot(tier)].fetch_add(n as i64, Ordering::SeqCst);
    }

    /// Consume one credit for `tier` if any is available.
    pub fn try_take(&self, tier: Tier) -> bool {
        let slot = &self.per_tier[Self::slot(tier)];
        let mut current = slot.load(Ordering::SeqCst);
        while current > 0 {
            match slot.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Consume one credit from whichever tier has any. The scheduler drains
    /// against aggregate capacity; the per-tier worker channels are the
    /// precise backpressure.
    pub fn take_any(&self) -> Option<Tier> {
        Tier::ALL.into_iter().find(|tier| self.try_take(*tier))
    }

    pub fn available(&self, tier: Tier) -> i64 {
        self.per_tier[Self::slot(tier)].load(Ordering::SeqCst)
    }

    pub fn available_total(&self) -> i64 {
        self.per_tier.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }
}

/// System-wide scheduling statistics.
#[derive(Debug, Clone, Default)]
pub struct SystemStats {
    pub total_queues: usize,
    pub total_queued: usize,
    /// weight → number of tenant queues carrying it.
    pub weight_distribution: HashMap<u32, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credits_take_until_exhausted() {
        let credits = WorkerCredits::new();
        credits.add(Tier::A, 2);

        assert!(credits.try_take(Tier::A));
        assert!(credits.try_take(Tier::A));
        assert!(!credits.try_take(Tier::A));
        assert_eq!(credits.available(Tier::A), 0);
    }

    #[test]
    fn total_spans_tiers() {
        let credits = WorkerCredits::new();
        credits.add(Tier::A, 1);
        credits.add(Tier::C, 2);
        assert_eq!(credits.available_total(), 3);
        assert!(!credits.try_take(Tier::B));
    }

    #[test]
    fn tenant_weight_override_beats_plan_weight() {
        let weights = PlanWeights::default();
        let mut tenant = Tenant {
            id: Uuid::new_v4(),
            name: "acme".to_string(),
            plan: registry::Plan::Pro,
            status: registry::TenantStatus::Active,
            weight_override: None,
            data_region: "us-east-1".to_string(),
            allowed_regions: Default::default(),
            quota_overrides: Default::default(),
            fail_open_override: None,
        };

        assert_eq!(weights.for_tenant(&tenant), 3);
        tenant.weight_override = Some(25);
        assert_eq!(weights.for_tenant(&tenant), 25);
        // Zero would break the virtual-time division; clamp to one.
        tenant.weight_override = Some(0);
        assert_eq!(weights.for_tenant(&tenant), 1);
    }
}
