//! Per-kind stream retention policies.

use crate::event::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStorage {
    /// Durable, survives restarts.
    File,
    /// In-process only; acceptable for fan-out of ephemeral messages.
    Memory,
}

/// Work-queue stream configuration. Acked messages are removed; unacked ones
/// age out at `max_age_s` or when the stream exceeds `max_msgs`.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub kind: EventKind,
    pub storage: StreamStorage,
    pub max_age_s: u64,
    pub max_msgs: u64,
}

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

impl StreamConfig {
    /// Retention defaults per kind.
    pub fn defaults() -> Vec<StreamConfig> {
        use EventKind::*;
        vec![
            StreamConfig { kind: AgentRun, storage: StreamStorage::File, max_age_s: DAY, max_msgs: 1_000_000 },
            StreamConfig { kind: ToolCall, storage: StreamStorage::File, max_age_s: 12 * HOUR, max_msgs: 500_000 },
            StreamConfig { kind: IngestDoc, storage: StreamStorage::File, max_age_s: 7 * DAY, max_msgs: 100_000 },
            StreamConfig { kind: UsageMetered, storage: StreamStorage::File, max_age_s: 30 * DAY, max_msgs: 10_000_000 },
            StreamConfig { kind: RouterDecision, storage: StreamStorage::File, max_age_s: 7 * DAY, max_msgs: 1_000_000 },
            StreamConfig { kind: WsMessage, storage: StreamStorage::Memory, max_age_s: HOUR, max_msgs: 100_000 },
            StreamConfig { kind: BillingEvent, storage: StreamStorage::File, max_age_s: 365 * DAY, max_msgs: 1_000_000 },
            StreamConfig { kind: AuditLog, storage: StreamStorage::File, max_age_s: 365 * DAY, max_msgs: 10_000_000 },
        ]
    }

    /// Dead-letter retention is uniform and longer than redelivery horizons.
    pub fn dlq_default(kind: EventKind) -> StreamConfig {
        StreamConfig {
            kind,
            storage: StreamStorage::File,
            max_age_s: 30 * DAY,
            max_msgs: 100_000,
        }
    }
}
