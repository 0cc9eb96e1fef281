//! The routing pipeline.
//!
//! Stage order: features, canary gate, early exit, calibrated classifier,
//! bandit override, escalation. Only the feature-store read and the bandit
//! read may suspend, and both sit behind a hard timeout; everything else is
//! CPU-bound. The decision itself is pure given its inputs; all mutable
//! state lives in the stores.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use corelib::models::Tier;

use crate::bandit::{BanditConfig, BanditPolicy, BanditStore};
use crate::canary::{CanaryConfig, CanaryGate};
use crate::classifier::{CalibrationMap, classify};
use crate::decision::{Decision, Strategy};
use crate::escalation::{
    EarlyExitThresholds, EscalationReason, EscalationThresholds, RoutingOverrides,
    check_early_exit, check_escalation,
};
use crate::feature_store::FeatureStore;
use crate::features::{RouteRequest, RouterFeatures, extract};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Hard deadline for any backing-store read inside the pipeline.
    pub store_timeout: Duration,
    pub bandit: BanditConfig,
    pub canary: CanaryConfig,
    /// Platform-default thresholds; per-tenant overrides replace them.
    pub early_exit: EarlyExitThresholds,
    pub escalation: EscalationThresholds,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(20),
            bandit: BanditConfig::default(),
            canary: CanaryConfig::default(),
            early_exit: EarlyExitThresholds::default(),
            escalation: EscalationThresholds::default(),
        }
    }
}

pub struct Router {
    feature_store: Arc<dyn FeatureStore>,
    bandit: BanditPolicy,
    canary: CanaryGate,
    calibration: CalibrationMap,
    overrides: RoutingOverrides,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        feature_store: Arc<dyn FeatureStore>,
        bandit_store: Arc<dyn BanditStore>,
        config: RouterConfig,
    ) -> Self {
        Self {
            feature_store,
            bandit: BanditPolicy::new(bandit_store, config.bandit.clone()),
            canary: CanaryGate::new(config.canary.clone()),
            calibration: CalibrationMap::new(),
            overrides: RoutingOverrides::new(config.early_exit, config.escalation),
            config,
        }
    }

    pub fn bandit(&self) -> &BanditPolicy {
        &self.bandit
    }

    pub fn canary(&self) -> &CanaryGate {
        &self.canary
    }

    pub fn calibration(&self) -> &CalibrationMap {
        &self.calibration
    }

    pub fn overrides(&self) -> &RoutingOverrides {
        &self.overrides
    }

    /// Route a request to a tier. Always produces a decision; store outages
    /// degrade to defaults and annotate the strategy instead of failing.
    #[instrument(skip(self, request, features_hint), target = "router",
                 fields(request_id = %request.request_id, tenant_id = %request.tenant_id))]
    pub async fn route(
        &self,
        request: &RouteRequest,
        features_hint: Option<RouterFeatures>,
        now_ms: u64,
    ) -> Decision {
        let started = Instant::now();
        let mut degraded = false;

        // 1. Features: current request composed with cached historicals.
        let features = match features_hint {
            Some(features) => features,
            None => {
                let history = match tokio::time::timeout(
                    self.config.store_timeout,
                    self.feature_store
                        .get_history(request.tenant_id, request.user_id.as_deref()),
                )
                .await
                {
                    Ok(history) => history,
                    Err(_) => {
                        warn!("feature store read timed out; extracting with defaults");
                        degraded = true;
                        None
                    }
                };
                extract(request, history.as_ref(), now_ms)
            }
        };

        // 2. Canary gate: measurement cohort skips the rest of the pipeline.
        if let Some(tier) = self
            .canary
            .in_band(request.tenant_id, request.user_id.as_deref())
        {
            debug!(tier = %tier, "canary cohort");
            return self.decision(
                request, tier, 0.5, Strategy::Canary, None, degraded, now_ms, started,
            );
        }

        // 3. Early exit: simple well-specified requests go straight to A.
        let early_exit = self.overrides.early_exit_for(request.tenant_id);
        let denied = self.overrides.denied_domains_for(request.tenant_id);
        if let Some((tier, confidence)) = check_early_exit(&features, &early_exit, &denied) {
            return self.decision(
                request,
                tier,
                confidence,
                Strategy::EarlyExit,
                None,
                degraded,
                now_ms,
                started,
            );
        }

        // 4. Calibrated classifier.
        let temperature = self.calibration.temperature(request.tenant_id);
        let (mut tier, confidence, _probs) = classify(&features, temperature);
        let mut strategy = Strategy::Classifier;

        // 5. Bandit override on shaky confidence or an exploring tenant.
        if confidence < self.config.bandit.threshold
            || self.bandit.in_explore_cohort(request.tenant_id)
        {
            let seed = crc32fast::hash(request.request_id.as_bytes()) as u64;
            match tokio::time::timeout(
                self.config.store_timeout,
                self.bandit.select_arm(request.tenant_id, seed),
            )
            .await
            {
                Ok(Some((bandit_tier, value))) => {
                    debug!(tier = %bandit_tier, value, "bandit override");
                    tier = bandit_tier;
                    strategy = Strategy::Bandit;
                }
                Ok(None) => {
                    // No arm data yet; the classifier's pick stands.
                }
                Err(_) => {
                    warn!("bandit read timed out; keeping classifier tier");
                    degraded = true;
                }
            }
        }

        // 6. Escalation.
        let schema_valid = schema_is_valid(request.schema.as_ref());
        let json_valid = payload_json_is_valid(request.payload_json.as_deref());
        let escalation = self.overrides.escalation_for(request.tenant_id);
        let mut reason: Option<EscalationReason> = None;
        if let Some((escalated_tier, escalation_reason)) = check_escalation(
            &features,
            tier,
            confidence,
            request.plan,
            schema_valid,
            json_valid,
            &escalation,
        ) {
            debug!(from = %tier, to = %escalated_tier, reason = %escalation_reason, "escalating");
            tier = escalated_tier;
            strategy = Strategy::Escalation;
            reason = Some(escalation_reason);
        }

        self.decision(
            request, tier, confidence, strategy, reason, degraded, now_ms, started,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn decision(
        &self,
        request: &RouteRequest,
        tier: Tier,
        confidence: f64,
        strategy: Strategy,
        escalation_reason: Option<EscalationReason>,
        degraded: bool,
        now_ms: u64,
        started: Instant,
    ) -> Decision {
        Decision {
            request_id: request.request_id,
            tenant_id: request.tenant_id,
            tier,
            confidence,
            strategy: if degraded { Strategy::Degraded } else { strategy },
            escalation_reason,
            decision_ts_ms: now_ms,
            decision_latency_ns: started.elapsed().as_nanos() as u64,
        }
    }
}

/// A requested output schema must at least be a typed object.
fn schema_is_valid(schema: Option<&serde_json::Value>) -> bool {
    match schema {
        None => true,
        Some(schema) => schema.is_object() && schema.get("type").is_some(),
    }
}

/// Structured arguments must parse as JSON.
fn payload_json_is_valid(payload_json: Option<&str>) -> bool {
    match payload_json {
        None => true,
        Some(raw) => serde_json::from_str::<serde_json::Value>(raw).is_ok(),
    }
}
