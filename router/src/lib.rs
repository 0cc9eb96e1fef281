pub mod bandit;
pub mod canary;
pub mod classifier;
pub mod decision;
pub mod escalation;
pub mod feature_store;
pub mod features;
pub mod router;

pub use bandit::{ArmStats, BanditConfig, BanditPolicy, BanditStore, MemoryBanditStore};
pub use canary::{CanaryConfig, CanaryGate};
pub use classifier::{CalibrationMap, classify};
pub use decision::{Decision, RouterDecisionPayload, Strategy};
pub use escalation::{
    EarlyExitThresholds, EscalationReason, EscalationThresholds, RoutingOverrides,
    TenantRoutingOverrides,
};
pub use feature_store::{FeatureStore, MemoryFeatureStore, TenantUserHistory};
pub use features::{Domain, RouteRequest, RouterFeatures};
pub use router::{Router, RouterConfig};
