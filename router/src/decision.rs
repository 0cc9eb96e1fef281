//! Routing decisions and their bus payload.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use corelib::models::Tier;

use crate::escalation::EscalationReason;

/// Which pipeline stage produced the final tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Classifier,
    Bandit,
    Canary,
    EarlyExit,
    Escalation,
    /// A backing store missed its deadline and defaults filled the gap.
    Degraded,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::Classifier => "classifier",
            Strategy::Bandit => "bandit",
            Strategy::Canary => "canary",
            Strategy::EarlyExit => "early_exit",
            Strategy::Escalation => "escalation",
            Strategy::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Immutable routing decision; written to the bus, never mutated.
#[derive(Debug, Clone)]
pub struct Decision {
    pub request_id: Uuid,
    pub tenant_id: Uuid,
    pub tier: Tier,
    pub confidence: f64,
    pub strategy: Strategy,
    pub escalation_reason: Option<EscalationReason>,
    pub decision_ts_ms: u64,
    pub decision_latency_ns: u64,
}

/// `router_decision` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDecisionPayload {
    pub request_id: Uuid,
    pub tenant_id: Uuid,
    pub tier: Tier,
    pub confidence: f64,
    pub strategy: Strategy,
    pub reason: Option<EscalationReason>,
    pub decision_latency_ns: u64,
}

impl From<&Decision> for RouterDecisionPayload {
    fn from(d: &Decision) -> Self {
        Self {
            request_id: d.request_id,
            tenant_id: d.tenant_id,
            tier: d.tier,
            confidence: d.confidence,
            strategy: d.strategy,
            reason: d.escalation_reason,
            decision_latency_ns: d.decision_latency_ns,
        }
    }
}
