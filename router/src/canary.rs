//! Canary gate over the `(tenant, user)` keyspace.
//!
//! A stable hash slots each key into `[0, 1)`; keys under the configured
//! fraction ride the canary tier. The hash has no per-process seed, so the
//! same key lands on the same side of the boundary on every node and every
//! restart.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use uuid::Uuid;

use corelib::models::Tier;

#[derive(Debug, Clone)]
pub struct CanaryConfig {
    /// Lower bound of the adjustable canary fraction.
    pub min_pct: f64,
    /// Upper bound of the adjustable canary fraction.
    pub max_pct: f64,
    /// Fraction currently in effect; clamped into `[min_pct, max_pct]`.
    pub pct: f64,
    /// Tier the canary cohort is measured on.
    pub tier: Tier,
    pub enabled: bool,
    /// Quality floor; below it (with enough samples) the tenant's canary
    /// traffic is turned off.
    pub min_quality: f64,
    pub min_samples: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            min_pct: 0.05,
            max_pct: 0.10,
            pct: 0.05,
            tier: Tier::A,
            enabled: true,
            min_quality: 0.7,
            min_samples: 50,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct CanaryStats {
    total: u64,
    successes: u64,
    quality_sum: f64,
    latency_sum_ms: u64,
}

pub struct CanaryGate {
    config: CanaryConfig,
    stats: Mutex<HashMap<Uuid, CanaryStats>>,
    disabled_tenants: Mutex<HashSet<Uuid>>,
}

/// Stable `[0, 1)` fraction for a key.
pub fn stable_fraction(tenant_id: Uuid, user_id: Option<&str>) -> f64 {
    let mut key = tenant_id.as_bytes().to_vec();
    if let Some(user) = user_id {
        key.extend_from_slice(user.as_bytes());
    }
    crc32fast::hash(&key) as f64 / (u32::MAX as f64 + 1.0)
}

impl CanaryGate {
    pub fn new(mut config: CanaryConfig) -> Self {
        config.pct = config.pct.clamp(config.min_pct, config.max_pct);
        Self {
            config,
            stats: Mutex::new(HashMap::new()),
            disabled_tenants: Mutex::new(HashSet::new()),
        }
    }

    /// The canary tier for this key, or `None` when the key is outside the
    /// band or the tenant's canary has been disabled.
    pub fn in_band(&self, tenant_id: Uuid, user_id: Option<&str>) -> Option<Tier> {
        if !self.config.enabled {
            return None;
        }
        if self.disabled_tenants.lock().contains(&tenant_id) {
            return None;
        }
        if stable_fraction(tenant_id, user_id) < self.config.pct {
            Some(self.config.tier)
        } else {
            None
        }
    }

    /// Fold a canary cohort outcome in; quality regressions with enough
    /// samples disable the tenant's canary.
    pub fn record_outcome(&self, tenant_id: Uuid, success: bool, latency_ms: u64, quality: f64) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(tenant_id).or_default();
        entry.total += 1;
        if success {
            entry.successes += 1;
        }
        entry.quality_sum += quality.clamp(0.0, 1.0);
        entry.latency_sum_ms += latency_ms;

        if entry.total >= self.config.min_samples
            && entry.quality_sum / entry.total as f64 > self.config.min_quality
        {
            return;
        }
        if entry.total >= self.config.min_samples {
            let avg = entry.quality_sum / entry.total as f64;
            tracing::warn!(
                tenant_id = %tenant_id,
                avg_quality = avg,
                samples = entry.total,
                "canary quality below floor; disabling canary for tenant"
            );
            self.disabled_tenants.lock().insert(tenant_id);
        }
    }

    /// Whether the tenant's canary traffic is currently active.
    pub fn is_healthy(&self, tenant_id: Uuid) -> bool {
        !self.disabled_tenants.lock().contains(&tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_is_stable_and_in_range() {
        let tenant = Uuid::new_v4();
        let a = stable_fraction(tenant, Some("user-1"));
        let b = stable_fraction(tenant, Some("user-1"));
        assert_eq!(a, b, "same key must hash identically");
        assert!((0.0..1.0).contains(&a));
        assert_ne!(a, stable_fraction(tenant, Some("user-2")));
    }

    #[test]
    fn band_decision_does_not_flap() {
        let gate = CanaryGate::new(CanaryConfig::default());
        let tenant = Uuid::new_v4();
        for user in 0..50 {
            let user = format!("user-{user}");
            let first = gate.in_band(tenant, Some(&user));
            for _ in 0..10 {
                assert_eq!(gate.in_band(tenant, Some(&user)), first);
            }
        }
    }

    #[test]
    fn band_fraction_roughly_matches_pct() {
        let gate = CanaryGate::new(CanaryConfig {
            pct: 0.10,
            max_pct: 0.10,
            ..CanaryConfig::default()
        });
        let tenant = Uuid::new_v4();
        let hits = (0..10_000)
            .filter(|i| gate.in_band(tenant, Some(&format!("user-{i}"))).is_some())
            .count();
        // 10% ± a generous margin for hash dispersion.
        assert!((600..=1400).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn sustained_low_quality_disables_tenant_canary() {
        let gate = CanaryGate::new(CanaryConfig {
            min_samples: 10,
            ..CanaryConfig::default()
        });
        let tenant = Uuid::new_v4();

        for _ in 0..10 {
            gate.record_outcome(tenant, false, 100, 0.2);
        }
        assert!(!gate.is_healthy(tenant));

        // A key that would otherwise be in the band is now refused.
        for i in 0..200 {
            assert_eq!(gate.in_band(tenant, Some(&format!("user-{i}"))), None);
        }
    }
}
