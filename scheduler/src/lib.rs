pub mod engine;
pub mod queue;
pub mod select;
pub mod shard;
pub mod types;

pub use engine::{SchedulerCounters, SchedulerEngine};
pub use queue::{QueuedItem, TenantQueue, TenantQueueStats};
pub use types::{
    AdmissionError, AdmissionTicket, DispatchSender, DispatchedRequest, PlanWeights, Request,
    RequestId, SchedulerConfig, SystemStats, WorkerCredits,
};
