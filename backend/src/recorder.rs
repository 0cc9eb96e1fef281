//! Outcome recorder: the loop closer.
//!
//! One terminal outcome per request feeds the bandit, the feature-store
//! historicals, the canary aggregates, and the metered-usage stream. The
//! recorder is idempotent per request id, so duplicate delivery from the bus
//! changes nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use bus::{EventKind, Publisher};
use corelib::models::{RequestPriority, Resource, Tier};
use quota::{Period, UsageMeteredPayload};
use router::{FeatureStore, Router, Strategy};

use crate::workers::WorkItem;

/// How long recorded request ids are remembered for dedup.
const SEEN_RETENTION_MS: u64 = 60 * 60 * 1000;

/// Terminal result of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub request_id: Uuid,
    pub tenant_id: Uuid,
    pub tier: Tier,
    pub success: bool,
    pub latency_ms: u64,
    pub cost_micro_usd: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub quality: f64,
}

pub struct OutcomeRecorder {
    router: Arc<Router>,
    feature_store: Arc<dyn FeatureStore>,
    publisher: Publisher,
    seen: Mutex<HashMap<Uuid, u64>>,
    pub duplicates: AtomicU64,
}

impl OutcomeRecorder {
    pub fn new(
        router: Arc<Router>,
        feature_store: Arc<dyn FeatureStore>,
        publisher: Publisher,
    ) -> Self {
        Self {
            router,
            feature_store,
            publisher,
            seen: Mutex::new(HashMap::new()),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Record a terminal outcome. Returns `false` when this request id was
    /// already recorded (duplicate delivery: no state change).
    #[instrument(skip(self, item, outcome), target = "recorder",
                 fields(request_id = %outcome.request_id, tenant_id = %outcome.tenant_id))]
    pub async fn record(&self, item: &WorkItem, outcome: &Outcome, now_ms: u64) -> bool {
        {
            let mut seen = self.seen.lock();
            if seen.contains_key(&outcome.request_id) {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!("duplicate outcome ignored");
                return false;
            }
            seen.insert(outcome.request_id, now_ms);
            seen.retain(|_, at| now_ms.saturating_sub(*at) < SEEN_RETENTION_MS);
        }

        // Bandit arm for the tier that actually served.
        self.router
            .bandit()
            .record_outcome(
                outcome.tenant_id,
                outcome.tier,
                outcome.success,
                outcome.cost_micro_usd,
                outcome.latency_ms,
            )
            .await;

        // Canary cohort quality tracking.
        if item.decision.strategy == Strategy::Canary {
            self.router.canary().record_outcome(
                outcome.tenant_id,
                outcome.success,
                outcome.latency_ms,
                outcome.quality,
            );
        }

        // Historicals for future feature extraction.
        self.feature_store
            .record_outcome(
                outcome.tenant_id,
                item.dispatched.request.user_id.as_deref(),
                outcome.success,
                outcome.latency_ms,
                item.dispatched.request.fingerprint,
                now_ms,
            )
            .await;

        // Metered usage actually consumed by this request.
        let tokens = outcome.tokens_in + outcome.tokens_out;
        if tokens > 0 {
            self.emit_usage(outcome.tenant_id, Resource::Tokens, tokens, now_ms);
        }

        // Close the causal chain: decision happened first, outcome last.
        self.publisher.publish(
            EventKind::RouterDecision,
            outcome.tenant_id,
            item.dispatched.request.priority,
            json!({
                "kind": "router_decision_outcome",
                "request_id": outcome.request_id,
                "tier": outcome.tier,
                "strategy": item.decision.strategy,
                "success": outcome.success,
                "latency_ms": outcome.latency_ms,
                "cost_micro_usd": outcome.cost_micro_usd,
                "quality": outcome.quality,
            }),
            Some(outcome.request_id),
        );

        true
    }

    fn emit_usage(&self, tenant_id: Uuid, resource: Resource, quantity: u64, now_ms: u64) {
        let period = Period::Month;
        let payload = UsageMeteredPayload {
            tenant_id,
            resource: resource.as_str().to_string(),
            quantity,
            period: period.as_str().to_string(),
            period_start_s: period.start(now_ms / 1000),
            ts_s: now_ms / 1000,
        };
        match serde_json::to_value(&payload) {
            Ok(data) => {
                self.publisher.publish(
                    EventKind::UsageMetered,
                    tenant_id,
                    RequestPriority::Normal,
                    data,
                    None,
                );
            }
            Err(e) => warn!(error = %e, "failed to encode usage payload"),
        }
    }
}
