//! Request features and synchronous extraction.
//!
//! Extraction is pure: text signals come from the payload, historicals from
//! whatever the feature store handed over before the deadline, and everything
//! lands in `[0, 1]` ranges the downstream stages expect.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use registry::Plan;

use crate::feature_store::TenantUserHistory;

/// What the scheduler hands the router per dispatch.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub request_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Option<String>,
    pub session_id: Option<Uuid>,
    pub plan: Plan,
    /// Prompt / message text.
    pub payload: String,
    /// Output JSON schema, when the caller wants structured output.
    pub schema: Option<serde_json::Value>,
    /// Raw JSON arguments accompanying the prompt, if any.
    pub payload_json: Option<String>,
    /// Stable content fingerprint used for novelty tracking.
    pub fingerprint: u64,
    pub deadline_ts_ms: Option<u64>,
}

impl RouteRequest {
    /// Content fingerprint over the payload text.
    pub fn fingerprint_of(payload: &str) -> u64 {
        crc32fast::hash(payload.as_bytes()) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    CustomerSupport,
    Sales,
    Technical,
    Billing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterFeatures {
    pub token_count: u32,
    /// How strict the requested output schema is, 0 = freeform.
    pub schema_strictness: f64,
    pub domain_flags: BTreeSet<Domain>,
    /// 1 = never seen anything like this from the tenant/user.
    pub novelty: f64,
    pub historical_failure_rate: f64,
    pub user_tier: Plan,
    /// Hour of day, 0..=23 UTC.
    pub time_of_day: u8,
    /// Day of week, 0 = Thursday epoch alignment folded to 0..=6.
    pub day_of_week: u8,
    pub complexity: f64,
}

const DOMAIN_KEYWORDS: [(Domain, &[&str]); 4] = [
    (
        Domain::CustomerSupport,
        &["help", "support", "issue", "problem", "error", "bug"],
    ),
    (
        Domain::Sales,
        &["order", "buy", "purchase", "price", "quote", "checkout"],
    ),
    (
        Domain::Technical,
        &["api", "database", "server", "integration", "webhook", "deploy"],
    ),
    (
        Domain::Billing,
        &["invoice", "billing", "refund", "charge", "payment", "subscription"],
    ),
];

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Rough token estimate; close enough for routing thresholds.
fn estimate_tokens(payload: &str) -> u32 {
    let words = payload.split_whitespace().count() as u32;
    let chars = payload.chars().count() as u32;
    words.max(chars / 4)
}

fn domain_flags(payload: &str) -> BTreeSet<Domain> {
    let lower = payload.to_lowercase();
    DOMAIN_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(domain, _)| *domain)
        .collect()
}

/// Lexical complexity: long messages with a rich vocabulary score high,
/// short repetitive ones low.
fn complexity_of(payload: &str) -> f64 {
    let words: Vec<&str> = payload.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }

    let unique: BTreeSet<&str> = words.iter().copied().collect();
    let unique_ratio = unique.len() as f64 / words.len() as f64;
    let avg_len = words.iter().map(|w| w.len()).sum::<usize>() as f64 / words.len() as f64;
    let length_pressure = (words.len() as f64 / 400.0).min(1.0);

    clamp01(0.45 * unique_ratio * (avg_len / 8.0).min(1.0) + 0.55 * length_pressure + 0.15 * unique_ratio)
}

/// Strictness of the requested output schema: required fields and closed
/// objects push it toward 1.
fn schema_strictness(schema: Option<&serde_json::Value>) -> f64 {
    let Some(schema) = schema else {
        return 0.0;
    };
    let Some(object) = schema.as_object() else {
        return 0.0;
    };

    let mut strictness: f64 = 0.4;

    let properties = object
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|p| p.len())
        .unwrap_or(0);
    let required = object
        .get("required")
        .and_then(|r| r.as_array())
        .map(|r| r.len())
        .unwrap_or(0);

    if properties > 0 {
        strictness += 0.4 * (required as f64 / properties as f64).min(1.0);
    }
    if object.get("additionalProperties") == Some(&serde_json::Value::Bool(false)) {
        strictness += 0.2;
    }

    clamp01(strictness)
}

fn novelty_of(fingerprint: u64, history: Option<&TenantUserHistory>) -> f64 {
    match history {
        None => 0.7,
        Some(h) if h.recent_fingerprints.contains(&fingerprint) => 0.1,
        Some(_) => 0.7,
    }
}

/// Compose current-request features with cached historicals.
pub fn extract(
    request: &RouteRequest,
    history: Option<&TenantUserHistory>,
    now_ms: u64,
) -> RouterFeatures {
    let now_s = now_ms / 1000;

    RouterFeatures {
        token_count: estimate_tokens(&request.payload),
        schema_strictness: schema_strictness(request.schema.as_ref()),
        domain_flags: domain_flags(&request.payload),
        novelty: novelty_of(request.fingerprint, history),
        historical_failure_rate: history.map(|h| h.failure_rate()).unwrap_or(0.0),
        user_tier: request.plan,
        time_of_day: ((now_s / 3600) % 24) as u8,
        day_of_week: ((now_s / 86_400 + 4) % 7) as u8,
        complexity: complexity_of(&request.payload),
    }
}

#[cfg(test)]
pub(crate) fn test_request(payload: &str) -> RouteRequest {
    RouteRequest {
        request_id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        user_id: Some("user-1".to_string()),
        session_id: None,
        plan: Plan::Pro,
        payload: payload.to_string(),
        schema: None,
        payload_json: None,
        fingerprint: RouteRequest::fingerprint_of(payload),
        deadline_ts_ms: None,
    }
}
