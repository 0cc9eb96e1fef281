//! Early exit and escalation checks.
//!
//! Both are pure threshold functions. Per-tenant overrides replace the
//! defaults wholesale; absence of an override means the default thresholds
//! apply unchanged.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use corelib::models::Tier;
use registry::Plan;

use crate::features::{Domain, RouterFeatures};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    LowConfidence,
    HighRisk,
    NovelRequest,
    EnterpriseComplex,
    SchemaValidationFailed,
    JsonValidationFailed,
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscalationReason::LowConfidence => "low_confidence",
            EscalationReason::HighRisk => "high_risk",
            EscalationReason::NovelRequest => "novel_request",
            EscalationReason::EnterpriseComplex => "enterprise_complex",
            EscalationReason::SchemaValidationFailed => "schema_validation_failed",
            EscalationReason::JsonValidationFailed => "json_validation_failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EarlyExitThresholds {
    pub schema_strictness_min: f64,
    pub token_count_max: u32,
    pub complexity_max: f64,
    pub novelty_max: f64,
    pub failure_rate_max: f64,
}

impl Default for EarlyExitThresholds {
    fn default() -> Self {
        Self {
            schema_strictness_min: 0.8,
            token_count_max: 200,
            complexity_max: 0.3,
            novelty_max: 0.5,
            failure_rate_max: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EscalationThresholds {
    pub confidence_min: f64,
    pub failure_rate_max: f64,
    pub novelty_max: f64,
    pub complexity_max: f64,
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self {
            confidence_min: 0.8,
            failure_rate_max: 0.5,
            novelty_max: 0.8,
            complexity_max: 0.7,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TenantRoutingOverrides {
    pub early_exit: Option<EarlyExitThresholds>,
    pub escalation: Option<EscalationThresholds>,
    /// Domains for which early exit is denied even when thresholds pass.
    pub early_exit_denied_domains: Option<BTreeSet<Domain>>,
}

/// Per-tenant routing overrides over configured platform defaults. An
/// override replaces its default wholesale; absence means the default
/// applies. The stock denied-domain set keeps technical and billing traffic
/// off the early-exit path, where accuracy matters more than cost.
pub struct RoutingOverrides {
    default_early_exit: EarlyExitThresholds,
    default_escalation: EscalationThresholds,
    by_tenant: Mutex<HashMap<Uuid, TenantRoutingOverrides>>,
}

impl Default for RoutingOverrides {
    fn default() -> Self {
        Self::new(
            EarlyExitThresholds::default(),
            EscalationThresholds::default(),
        )
    }
}

impl RoutingOverrides {
    pub fn new(
        default_early_exit: EarlyExitThresholds,
        default_escalation: EscalationThresholds,
    ) -> Self {
        Self {
            default_early_exit,
            default_escalation,
            by_tenant: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_denied_domains() -> BTreeSet<Domain> {
        BTreeSet::from([Domain::Technical, Domain::Billing])
    }

    pub fn set(&self, tenant_id: Uuid, overrides: TenantRoutingOverrides) {
        self.by_tenant.lock().insert(tenant_id, overrides);
    }

    pub fn early_exit_for(&self, tenant_id: Uuid) -> EarlyExitThresholds {
        self.by_tenant
            .lock()
            .get(&tenant_id)
            .and_then(|o| o.early_exit)
            .unwrap_or(self.default_early_exit)
    }

    pub fn escalation_for(&self, tenant_id: Uuid) -> EscalationThresholds {
        self.by_tenant
            .lock()
            .get(&tenant_id)
            .and_then(|o| o.escalation)
            .unwrap_or(self.default_escalation)
    }

    pub fn denied_domains_for(&self, tenant_id: Uuid) -> BTreeSet<Domain> {
        self.by_tenant
            .lock()
            .get(&tenant_id)
            .and_then(|o| o.early_exit_denied_domains.clone())
            .unwrap_or_else(Self::default_denied_domains)
    }
}

/// Cheap-path check: a request this simple and this well-specified goes
/// straight to Tier A. Confidence lands in `[0.8, 1.0]`.
pub fn check_early_exit(
    features: &RouterFeatures,
    thresholds: &EarlyExitThresholds,
    denied_domains: &BTreeSet<Domain>,
) -> Option<(Tier, f64)> {
    if features.schema_strictness < thresholds.schema_strictness_min
        || features.token_count > thresholds.token_count_max
        || features.complexity > thresholds.complexity_max
        || features.novelty > thresholds.novelty_max
        || features.historical_failure_rate > thresholds.failure_rate_max
    {
        return None;
    }
    if features.domain_flags.iter().any(|d| denied_domains.contains(d)) {
        return None;
    }

    // Headroom under the complexity and failure thresholds buys confidence.
    let complexity_margin = (thresholds.complexity_max - features.complexity)
        / thresholds.complexity_max.max(f64::EPSILON);
    let risk_margin = (thresholds.failure_rate_max - features.historical_failure_rate)
        / thresholds.failure_rate_max.max(f64::EPSILON);
    let confidence = (0.8 + 0.1 * complexity_margin + 0.1 * risk_margin).clamp(0.8, 1.0);

    Some((Tier::A, confidence))
}

/// Escalation check; returns the (possibly unchanged) target tier and the
/// primary reason when any condition holds. Escalating from C keeps the tier
/// but is still reported so it can be logged.
#[allow(clippy::too_many_arguments)]
pub fn check_escalation(
    features: &RouterFeatures,
    predicted_tier: Tier,
    confidence: f64,
    plan: Plan,
    schema_valid: bool,
    json_valid: bool,
    thresholds: &EscalationThresholds,
) -> Option<(Tier, EscalationReason)> {
    let mut reasons = Vec::new();

    if confidence < thresholds.confidence_min {
        reasons.push(EscalationReason::LowConfidence);
    }
    if features.historical_failure_rate > thresholds.failure_rate_max {
        reasons.push(EscalationReason::HighRisk);
    }
    if features.novelty > thresholds.novelty_max {
        reasons.push(EscalationReason::NovelRequest);
    }
    if plan == Plan::Enterprise && features.complexity > thresholds.complexity_max {
        reasons.push(EscalationReason::EnterpriseComplex);
    }
    if !schema_valid {
        reasons.push(EscalationReason::SchemaValidationFailed);
    }
    if !json_valid {
        reasons.push(EscalationReason::JsonValidationFailed);
    }

    reasons
        .first()
        .map(|reason| (predicted_tier.escalated(), *reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(
        schema_strictness: f64,
        token_count: u32,
        complexity: f64,
        novelty: f64,
        failure_rate: f64,
    ) -> RouterFeatures {
        RouterFeatures {
            token_count,
            schema_strictness,
            domain_flags: BTreeSet::new(),
            novelty,
            historical_failure_rate: failure_rate,
            user_tier: Plan::Pro,
            time_of_day: 12,
            day_of_week: 2,
            complexity,
        }
    }

    #[test]
    fn clean_simple_request_exits_early_to_a() {
        let f = features(0.9, 80, 0.1, 0.2, 0.05);
        let (tier, confidence) =
            check_early_exit(&f, &EarlyExitThresholds::default(), &BTreeSet::new()).unwrap();
        assert_eq!(tier, Tier::A);
        assert!((0.8..=1.0).contains(&confidence));
    }

    #[test]
    fn each_threshold_blocks_early_exit() {
        let thresholds = EarlyExitThresholds::default();
        let none = BTreeSet::new();

        let cases = [
            features(0.7, 80, 0.1, 0.2, 0.05),  // schema too loose
            features(0.9, 300, 0.1, 0.2, 0.05), // too many tokens
            features(0.9, 80, 0.5, 0.2, 0.05),  // too complex
            features(0.9, 80, 0.1, 0.7, 0.05),  // too novel
            features(0.9, 80, 0.1, 0.2, 0.4),   // too risky
        ];
        for f in cases {
            assert!(check_early_exit(&f, &thresholds, &none).is_none());
        }
    }

    #[test]
    fn denied_domain_blocks_early_exit() {
        let mut f = features(0.9, 80, 0.1, 0.2, 0.05);
        f.domain_flags.insert(Domain::Billing);

        let denied = RoutingOverrides::default_denied_domains();
        assert!(check_early_exit(&f, &EarlyExitThresholds::default(), &denied).is_none());

        // A tenant override that clears the denial lets it through.
        assert!(check_early_exit(&f, &EarlyExitThresholds::default(), &BTreeSet::new()).is_some());
    }

    #[test]
    fn low_confidence_escalates_one_level() {
        let f = features(0.4, 400, 0.9, 0.5, 0.6);
        let (tier, reason) = check_escalation(
            &f,
            Tier::B,
            0.55,
            Plan::Pro,
            true,
            true,
            &EscalationThresholds::default(),
        )
        .unwrap();
        assert_eq!(tier, Tier::C);
        assert_eq!(reason, EscalationReason::LowConfidence);
    }

    #[test]
    fn escalation_from_c_is_a_tier_noop_but_reported() {
        let f = features(0.4, 400, 0.2, 0.9, 0.1);
        let (tier, reason) = check_escalation(
            &f,
            Tier::C,
            0.95,
            Plan::Pro,
            true,
            true,
            &EscalationThresholds::default(),
        )
        .unwrap();
        assert_eq!(tier, Tier::C);
        assert_eq!(reason, EscalationReason::NovelRequest);
    }

    #[test]
    fn enterprise_complexity_escalates_where_pro_does_not() {
        let f = features(0.9, 100, 0.8, 0.2, 0.1);
        let thresholds = EscalationThresholds::default();

        assert!(check_escalation(&f, Tier::B, 0.95, Plan::Pro, true, true, &thresholds).is_none());

        let (tier, reason) =
            check_escalation(&f, Tier::B, 0.95, Plan::Enterprise, true, true, &thresholds).unwrap();
        assert_eq!(tier, Tier::C);
        assert_eq!(reason, EscalationReason::EnterpriseComplex);
    }

    #[test]
    fn validation_failures_escalate() {
        let f = features(0.9, 100, 0.2, 0.2, 0.1);
        let thresholds = EscalationThresholds::default();

        let (_, reason) =
            check_escalation(&f, Tier::A, 0.95, Plan::Pro, false, true, &thresholds).unwrap();
        assert_eq!(reason, EscalationReason::SchemaValidationFailed);

        let (_, reason) =
            check_escalation(&f, Tier::A, 0.95, Plan::Pro, true, false, &thresholds).unwrap();
        assert_eq!(reason, EscalationReason::JsonValidationFailed);
    }

    #[test]
    fn quiet_request_does_not_escalate() {
        let f = features(0.9, 100, 0.2, 0.2, 0.1);
        assert!(
            check_escalation(
                &f,
                Tier::B,
                0.95,
                Plan::Pro,
                true,
                true,
                &EscalationThresholds::default()
            )
            .is_none()
        );
    }
}
