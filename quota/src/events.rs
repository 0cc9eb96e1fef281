//! Typed payloads the engine puts on the bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `usage_metered` payload: the billing source of truth. Exactly one of these
/// is emitted per committed reservation and per metered outcome resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageMeteredPayload {
    pub tenant_id: Uuid,
    pub resource: String,
    pub quantity: u64,
    pub period: String,
    pub period_start_s: u64,
    pub ts_s: u64,
}

/// Audit payload for quota-side operational facts (approaching-limit warnings,
/// degraded-open admissions, expired reservations).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaAuditPayload {
    pub kind: String,
    pub tenant_id: Uuid,
    pub resource: String,
    pub consumed: Option<u64>,
    pub limit: Option<u64>,
}
