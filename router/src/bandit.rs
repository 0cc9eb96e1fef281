//! Per-tenant contextual bandit over the three tier arms.
//!
//! ε-greedy with a UCB exploration bonus. Reward blends success against
//! normalized cost and latency; the recorder feeds it after every terminal
//! outcome.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use corelib::models::Tier;

use crate::canary::stable_fraction;

/// Cost above this is treated as fully expensive when normalizing.
const COST_SCALE_MICRO_USD: f64 = 50_000.0;
/// Latency above this is treated as fully slow when normalizing.
const LATENCY_SCALE_MS: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct ArmStats {
    pub pulls: u64,
    pub reward_sum: f64,
    pub cost_sum: f64,
    pub errors: u64,
}

impl ArmStats {
    pub fn mean_reward(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.reward_sum / self.pulls as f64
        }
    }
}

#[async_trait::async_trait]
pub trait BanditStore: Send + Sync {
    async fn get_arm(&self, tenant_id: Uuid, tier: Tier) -> ArmStats;
    async fn update_arm(&self, tenant_id: Uuid, tier: Tier, reward: f64, cost: f64, error: bool);
}

#[derive(Default)]
pub struct MemoryBanditStore {
    arms: Mutex<HashMap<(Uuid, Tier), ArmStats>>,
}

impl MemoryBanditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl BanditStore for MemoryBanditStore {
    async fn get_arm(&self, tenant_id: Uuid, tier: Tier) -> ArmStats {
        self.arms
            .lock()
            .get(&(tenant_id, tier))
            .copied()
            .unwrap_or_default()
    }

    async fn update_arm(&self, tenant_id: Uuid, tier: Tier, reward: f64, cost: f64, error: bool) {
        let mut arms = self.arms.lock();
        let arm = arms.entry((tenant_id, tier)).or_default();
        arm.pulls += 1;
        arm.reward_sum += reward;
        arm.cost_sum += cost;
        if error {
            arm.errors += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct BanditConfig {
    /// Reward weight on success.
    pub alpha: f64,
    /// Reward weight on normalized cost.
    pub beta: f64,
    /// Reward weight on normalized latency.
    pub gamma: f64,
    /// Classifier confidence below which the bandit is consulted.
    pub threshold: f64,
    /// Fraction of selections that explore a deterministic arm.
    pub epsilon: f64,
    /// Fraction of the tenant keyspace in the always-explore cohort.
    pub explore_cohort_pct: f64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            beta: 0.25,
            gamma: 0.15,
            threshold: 0.7,
            epsilon: 0.1,
            explore_cohort_pct: 0.1,
        }
    }
}

pub struct BanditPolicy {
    store: Arc<dyn BanditStore>,
    config: BanditConfig,
}

impl BanditPolicy {
    pub fn new(store: Arc<dyn BanditStore>, config: BanditConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BanditConfig {
        &self.config
    }

    /// Reward for a terminal outcome.
    pub fn reward(&self, success: bool, cost_micro_usd: u64, latency_ms: u64) -> f64 {
        let success = if success { 1.0 } else { 0.0 };
        let cost = (cost_micro_usd as f64 / COST_SCALE_MICRO_USD).min(1.0);
        let latency = (latency_ms as f64 / LATENCY_SCALE_MS).min(1.0);
        self.config.alpha * success - self.config.beta * cost - self.config.gamma * latency
    }

    /// Whether this tenant always explores regardless of confidence.
    /// Cohort membership mirrors the canary gate: a stable hash fraction.
    pub fn in_explore_cohort(&self, tenant_id: Uuid) -> bool {
        stable_fraction(tenant_id, Some("bandit-explore")) < self.config.explore_cohort_pct
    }

    /// Pick an arm, or `None` when no arm has data yet (callers keep the
    /// classifier's choice). `seed` makes exploration deterministic per
    /// request.
    pub async fn select_arm(&self, tenant_id: Uuid, seed: u64) -> Option<(Tier, f64)> {
        let mut stats = [ArmStats::default(); 3];
        for (i, tier) in Tier::ALL.into_iter().enumerate() {
            stats[i] = self.store.get_arm(tenant_id, tier).await;
        }

        let total_pulls: u64 = stats.iter().map(|s| s.pulls).sum();
        if total_pulls == 0 {
            return None;
        }

        // Deterministic ε slice: explore a pseudo-random arm.
        if ((seed % 1000) as f64) < self.config.epsilon * 1000.0 {
            let idx = (seed / 1000 % 3) as usize;
            return Some((Tier::ALL[idx], stats[idx].mean_reward()));
        }

        // UCB1 over the rest; unpulled arms get infinite urgency.
        let ln_total = (total_pulls as f64).ln().max(0.0);
        let mut best: Option<(usize, f64)> = None;
        for (i, arm) in stats.iter().enumerate() {
            let value = if arm.pulls == 0 {
                f64::INFINITY
            } else {
                arm.mean_reward() + (2.0 * ln_total / arm.pulls as f64).sqrt()
            };
            if best.is_none_or(|(_, b)| value > b) {
                best = Some((i, value));
            }
        }

        best.map(|(i, value)| (Tier::ALL[i], value))
    }

    /// Fold a terminal outcome into the pulled arm.
    pub async fn record_outcome(
        &self,
        tenant_id: Uuid,
        tier: Tier,
        success: bool,
        cost_micro_usd: u64,
        latency_ms: u64,
    ) {
        let reward = self.reward(success, cost_micro_usd, latency_ms);
        let cost = (cost_micro_usd as f64 / COST_SCALE_MICRO_USD).min(1.0);
        self.store
            .update_arm(tenant_id, tier, reward, cost, !success)
            .await;
    }
}
