use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use corelib::models::Resource;
use quota::{Period, QuotaConfig};
use router::{BanditConfig, CanaryConfig, EarlyExitThresholds, EscalationThresholds, RouterConfig};
use scheduler::{PlanWeights, SchedulerConfig};

/// Every recognized configuration option, with its default. Env vars override
/// field by field.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string; empty means fully in-memory stores.
    pub database_url: String,

    // =========================
    // Scheduler configuration
    // =========================
    /// Dispatch loop period in milliseconds. The loop also wakes on every
    /// enqueue, so this is a liveness floor, not a latency ceiling.
    pub scheduler_tick_ms: u64,

    /// Per-tenant maximum queued requests. Admissions beyond this are
    /// rejected rather than parked.
    pub scheduler_queue_depth_cap: usize,

    /// Deadline proximity (seconds) that earns the selection urgency boost.
    pub scheduler_urgency_window_s: f64,

    /// Fair-share weights per plan.
    pub scheduler_weight_free: u32,
    pub scheduler_weight_pro: u32,
    pub scheduler_weight_enterprise: u32,

    // =========================
    // Quota configuration
    // =========================
    /// Fraction of a limit at which APPROACHING_LIMIT warnings surface.
    pub quota_warning_threshold: f64,

    /// Pending reservation lifetime (seconds) before auto-release.
    pub quota_reservation_ttl_s: u64,

    /// Platform-default limits per resource; unset resources are unlimited.
    pub quota_default_limits: HashMap<Resource, u64>,

    // =========================
    // Router configuration
    // =========================
    /// Hard deadline (milliseconds) for backing-store reads in the pipeline.
    pub router_store_timeout_ms: u64,

    pub router_bandit_alpha: f64,
    pub router_bandit_beta: f64,
    pub router_bandit_gamma: f64,
    /// Classifier confidence below which the bandit is consulted.
    pub router_bandit_threshold: f64,

    pub router_canary_min_pct: f64,
    pub router_canary_max_pct: f64,

    /// Early-exit thresholds (Tier A fast path).
    pub router_early_exit_schema_strictness_min: f64,
    pub router_early_exit_token_count_max: u32,
    pub router_early_exit_complexity_max: f64,
    pub router_early_exit_novelty_max: f64,
    pub router_early_exit_failure_rate_max: f64,

    /// Escalation thresholds.
    pub router_escalation_confidence_min: f64,
    pub router_escalation_failure_rate_max: f64,
    pub router_escalation_novelty_max: f64,
    pub router_escalation_complexity_max: f64,

    // =========================
    // Event bus configuration
    // =========================
    /// Delivery attempts before a message dead-letters.
    pub bus_max_deliver: u32,

    /// Handler budget (seconds) per delivery.
    pub bus_ack_wait_s: u64,

    /// Bounded per-kind publish buffer.
    pub bus_outbox_cap: usize,

    // =========================
    // Worker pools
    // =========================
    /// Per-tier worker concurrency; doubles as the initial credit grant.
    pub worker_pool_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut quota_default_limits = HashMap::new();
        quota_default_limits.insert(Resource::ApiCalls, 100_000);
        quota_default_limits.insert(Resource::Tokens, 1_000_000);
        quota_default_limits.insert(Resource::ToolCalls, 10_000);
        quota_default_limits.insert(Resource::WsMinutes, 1_000);
        quota_default_limits.insert(Resource::StorageMb, 1_000);

        Self {
            database_url: String::new(),
            scheduler_tick_ms: 100,
            scheduler_queue_depth_cap: 1000,
            scheduler_urgency_window_s: 1.0,
            scheduler_weight_free: 1,
            scheduler_weight_pro: 3,
            scheduler_weight_enterprise: 10,
            quota_warning_threshold: 0.8,
            quota_reservation_ttl_s: 30,
            quota_default_limits,
            router_store_timeout_ms: 20,
            router_bandit_alpha: 0.6,
            router_bandit_beta: 0.25,
            router_bandit_gamma: 0.15,
            router_bandit_threshold: 0.7,
            router_canary_min_pct: 0.05,
            router_canary_max_pct: 0.10,
            router_early_exit_schema_strictness_min: 0.8,
            router_early_exit_token_count_max: 200,
            router_early_exit_complexity_max: 0.3,
            router_early_exit_novelty_max: 0.5,
            router_early_exit_failure_rate_max: 0.2,
            router_escalation_confidence_min: 0.8,
            router_escalation_failure_rate_max: 0.5,
            router_escalation_novelty_max: 0.8,
            router_escalation_complexity_max: 0.7,
            bus_max_deliver: 3,
            bus_ack_wait_s: 30,
            bus_outbox_cap: 10_000,
            worker_pool_size: 8,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            scheduler_tick_ms: env_parse("SCHEDULER_TICK_MS", defaults.scheduler_tick_ms),
            scheduler_queue_depth_cap: env_parse(
                "SCHEDULER_QUEUE_DEPTH_CAP",
                defaults.scheduler_queue_depth_cap,
            ),
            scheduler_urgency_window_s: env_parse(
                "SCHEDULER_URGENCY_WINDOW_S",
                defaults.scheduler_urgency_window_s,
            ),
            scheduler_weight_free: env_parse("SCHEDULER_WEIGHT_FREE", defaults.scheduler_weight_free),
            scheduler_weight_pro: env_parse("SCHEDULER_WEIGHT_PRO", defaults.scheduler_weight_pro),
            scheduler_weight_enterprise: env_parse(
                "SCHEDULER_WEIGHT_ENTERPRISE",
                defaults.scheduler_weight_enterprise,
            ),
            quota_warning_threshold: env_parse(
                "QUOTA_WARNING_THRESHOLD",
                defaults.quota_warning_threshold,
            ),
            quota_reservation_ttl_s: env_parse(
                "QUOTA_RESERVATION_TTL_S",
                defaults.quota_reservation_ttl_s,
            ),
            quota_default_limits: defaults.quota_default_limits,
            router_store_timeout_ms: env_parse(
                "ROUTER_STORE_TIMEOUT_MS",
                defaults.router_store_timeout_ms,
            ),
            router_bandit_alpha: env_parse("ROUTER_BANDIT_ALPHA", defaults.router_bandit_alpha),
            router_bandit_beta: env_parse("ROUTER_BANDIT_BETA", defaults.router_bandit_beta),
            router_bandit_gamma: env_parse("ROUTER_BANDIT_GAMMA", defaults.router_bandit_gamma),
            router_bandit_threshold: env_parse(
                "ROUTER_BANDIT_THRESHOLD",
                defaults.router_bandit_threshold,
            ),
            router_canary_min_pct: env_parse(
                "ROUTER_CANARY_MIN_PCT",
                defaults.router_canary_min_pct,
            ),
            router_canary_max_pct: env_parse(
                "ROUTER_CANARY_MAX_PCT",
                defaults.router_canary_max_pct,
            ),
            router_early_exit_schema_strictness_min: env_parse(
                "ROUTER_EARLY_EXIT_SCHEMA_STRICTNESS_MIN",
                defaults.router_early_exit_schema_strictness_min,
            ),
            router_early_exit_token_count_max: env_parse(
                "ROUTER_EARLY_EXIT_TOKEN_COUNT_MAX",
                defaults.router_early_exit_token_count_max,
            ),
            router_early_exit_complexity_max: env_parse(
                "ROUTER_EARLY_EXIT_COMPLEXITY_MAX",
                defaults.router_early_exit_complexity_max,
            ),
            router_early_exit_novelty_max: env_parse(
                "ROUTER_EARLY_EXIT_NOVELTY_MAX",
                defaults.router_early_exit_novelty_max,
            ),
            router_early_exit_failure_rate_max: env_parse(
                "ROUTER_EARLY_EXIT_FAILURE_RATE_MAX",
                defaults.router_early_exit_failure_rate_max,
            ),
            router_escalation_confidence_min: env_parse(
                "ROUTER_ESCALATION_CONFIDENCE_MIN",
                defaults.router_escalation_confidence_min,
            ),
            router_escalation_failure_rate_max: env_parse(
                "ROUTER_ESCALATION_FAILURE_RATE_MAX",
                defaults.router_escalation_failure_rate_max,
            ),
            router_escalation_novelty_max: env_parse(
                "ROUTER_ESCALATION_NOVELTY_MAX",
                defaults.router_escalation_novelty_max,
            ),
            router_escalation_complexity_max: env_parse(
                "ROUTER_ESCALATION_COMPLEXITY_MAX",
                defaults.router_escalation_complexity_max,
            ),
            bus_max_deliver: env_parse("BUS_MAX_DELIVER", defaults.bus_max_deliver),
            bus_ack_wait_s: env_parse("BUS_ACK_WAIT_S", defaults.bus_ack_wait_s),
            bus_outbox_cap: env_parse("BUS_OUTBOX_CAP", defaults.bus_outbox_cap),
            worker_pool_size: env_parse("WORKER_POOL_SIZE", defaults.worker_pool_size),
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.scheduler_tick_ms),
            queue_depth_cap: self.scheduler_queue_depth_cap,
            urgency_window_s: self.scheduler_urgency_window_s,
            weights: PlanWeights {
                free: self.scheduler_weight_free,
                pro: self.scheduler_weight_pro,
                enterprise: self.scheduler_weight_enterprise,
            },
            ..SchedulerConfig::default()
        }
    }

    pub fn quota(&self) -> QuotaConfig {
        let mut config = QuotaConfig {
            warning_threshold: self.quota_warning_threshold,
            reservation_ttl_ms: self.quota_reservation_ttl_s * 1000,
            default_limits: self.quota_default_limits.clone(),
            ..QuotaConfig::default()
        };
        // API-call admission counts hourly; metered usage monthly.
        config.periods.insert(Resource::ApiCalls, Period::Hour);
        config
    }

    pub fn router(&self) -> RouterConfig {
        RouterConfig {
            store_timeout: Duration::from_millis(self.router_store_timeout_ms),
            bandit: BanditConfig {
                alpha: self.router_bandit_alpha,
                beta: self.router_bandit_beta,
                gamma: self.router_bandit_gamma,
                threshold: self.router_bandit_threshold,
                ..BanditConfig::default()
            },
            canary: CanaryConfig {
                min_pct: self.router_canary_min_pct,
                max_pct: self.router_canary_max_pct,
                pct: self.router_canary_min_pct,
                ..CanaryConfig::default()
            },
            early_exit: EarlyExitThresholds {
                schema_strictness_min: self.router_early_exit_schema_strictness_min,
                token_count_max: self.router_early_exit_token_count_max,
                complexity_max: self.router_early_exit_complexity_max,
                novelty_max: self.router_early_exit_novelty_max,
                failure_rate_max: self.router_early_exit_failure_rate_max,
            },
            escalation: EscalationThresholds {
                confidence_min: self.router_escalation_confidence_min,
                failure_rate_max: self.router_escalation_failure_rate_max,
                novelty_max: self.router_escalation_novelty_max,
                complexity_max: self.router_escalation_complexity_max,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler_tick_ms, 100);
        assert_eq!(config.scheduler_queue_depth_cap, 1000);
        assert_eq!(config.scheduler_weight_free, 1);
        assert_eq!(config.scheduler_weight_pro, 3);
        assert_eq!(config.scheduler_weight_enterprise, 10);
        assert_eq!(config.quota_warning_threshold, 0.8);
        assert_eq!(config.quota_reservation_ttl_s, 30);
        assert_eq!(config.router_bandit_threshold, 0.7);
        assert_eq!(config.router_canary_min_pct, 0.05);
        assert_eq!(config.router_canary_max_pct, 0.10);
        assert_eq!(config.bus_max_deliver, 3);
        assert_eq!(config.bus_ack_wait_s, 30);
    }

    #[test]
    fn derived_configs_carry_the_fields_through() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler().tick_interval, Duration::from_millis(100));
        assert_eq!(config.scheduler().weights.enterprise, 10);
        assert_eq!(config.quota().reservation_ttl_ms, 30_000);
        assert_eq!(config.router().bandit.threshold, 0.7);
        assert_eq!(config.router().canary.pct, 0.05);
        assert_eq!(config.router().early_exit.token_count_max, 200);
        assert_eq!(config.router().escalation.confidence_min, 0.8);
    }
}
