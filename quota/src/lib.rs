pub mod counters;
pub mod engine;
pub mod error;
pub mod events;
pub mod period;

pub use counters::{CounterKey, CounterStore, MemoryCounterStore, SqliteCounterStore};
pub use engine::{QuotaConfig, QuotaEngine, QuotaStatus, Reservation, ReserveOutcome};
pub use error::QuotaError;
pub use engine::spawn_sweeper;
pub use events::{QuotaAuditPayload, UsageMeteredPayload};
pub use period::Period;
