use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub dispatched: Arc<AtomicU64>,
    pub routed: Arc<AtomicU64>,
    pub escalated: Arc<AtomicU64>,
    pub completed: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    pub region_refusals: Arc<AtomicU64>,
    pub provider_unavailable: Arc<AtomicU64>,
}
