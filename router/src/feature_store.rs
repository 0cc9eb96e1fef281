//! Cached tenant/user historicals feeding feature extraction, updated from
//! terminal outcomes.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// EWMA smoothing factor for success/latency updates.
const EWMA_ALPHA: f64 = 0.2;
/// Recent-fingerprint window per (tenant, user).
const FINGERPRINT_WINDOW: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantUserHistory {
    pub success_ewma: f64,
    pub latency_ewma_ms: f64,
    pub outcomes: u64,
    pub recent_fingerprints: Vec<u64>,
}

impl Default for TenantUserHistory {
    fn default() -> Self {
        Self {
            success_ewma: 1.0,
            latency_ewma_ms: 0.0,
            outcomes: 0,
            recent_fingerprints: Vec::new(),
        }
    }
}

impl TenantUserHistory {
    pub fn failure_rate(&self) -> f64 {
        (1.0 - self.success_ewma).clamp(0.0, 1.0)
    }

    fn record(&mut self, success: bool, latency_ms: u64) {
        let s = if success { 1.0 } else { 0.0 };
        if self.outcomes == 0 {
            self.success_ewma = s;
            self.latency_ewma_ms = latency_ms as f64;
        } else {
            self.success_ewma = EWMA_ALPHA * s + (1.0 - EWMA_ALPHA) * self.success_ewma;
            self.latency_ewma_ms =
                EWMA_ALPHA * latency_ms as f64 + (1.0 - EWMA_ALPHA) * self.latency_ewma_ms;
        }
        self.outcomes += 1;
    }

    fn note_fingerprint(&mut self, fingerprint: u64) {
        if self.recent_fingerprints.contains(&fingerprint) {
            return;
        }
        if self.recent_fingerprints.len() >= FINGERPRINT_WINDOW {
            self.recent_fingerprints.remove(0);
        }
        self.recent_fingerprints.push(fingerprint);
    }
}

#[async_trait::async_trait]
pub trait FeatureStore: Send + Sync {
    async fn get_history(
        &self,
        tenant_id: Uuid,
        user_id: Option<&str>,
    ) -> Option<TenantUserHistory>;

    /// Fold a terminal outcome into the historicals.
    async fn record_outcome(
        &self,
        tenant_id: Uuid,
        user_id: Option<&str>,
        success: bool,
        latency_ms: u64,
        fingerprint: u64,
        now_ms: u64,
    );
}

type HistoryKey = (Uuid, String);

/// In-memory feature store with an entry TTL; stale tenants fall out on the
/// write path.
pub struct MemoryFeatureStore {
    ttl_ms: u64,
    entries: Mutex<HashMap<HistoryKey, (u64, TenantUserHistory)>>,
}

impl MemoryFeatureStore {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(tenant_id: Uuid, user_id: Option<&str>) -> HistoryKey {
        (tenant_id, user_id.unwrap_or("").to_string())
    }
}

impl Default for MemoryFeatureStore {
    fn default() -> Self {
        Self::new(60 * 60 * 1000)
    }
}

#[async_trait::async_trait]
impl FeatureStore for MemoryFeatureStore {
    async fn get_history(
        &self,
        tenant_id: Uuid,
        user_id: Option<&str>,
    ) -> Option<TenantUserHistory> {
        let entries = self.entries.lock();
        entries
            .get(&Self::key(tenant_id, user_id))
            .map(|(_, h)| h.clone())
    }

    async fn record_outcome(
        &self,
        tenant_id: Uuid,
        user_id: Option<&str>,
        success: bool,
        latency_ms: u64,
        fingerprint: u64,
        now_ms: u64,
    ) {
        let mut entries = self.entries.lock();

        let (touched_at, history) = entries
            .entry(Self::key(tenant_id, user_id))
            .or_insert_with(|| (now_ms, TenantUserHistory::default()));
        *touched_at = now_ms;
        history.record(success, latency_ms);
        history.note_fingerprint(fingerprint);

        let ttl = self.ttl_ms;
        entries.retain(|_, (touched, _)| now_ms.saturating_sub(*touched) < ttl);
    }
}
