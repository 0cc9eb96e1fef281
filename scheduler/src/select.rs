//! Fair-share selection scoring.
//
//  This module is deliberately pure: no locks, no IO, no clock reads.

use std::cmp::Ordering;

use registry::TenantId;

use crate::queue::TenantQueue;
use crate::types::SchedulerConfig;

/// A non-empty queue's claim on the next dispatch slot.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub tenant_id: TenantId,
    pub shard: usize,
    pub score: f64,
    pub head_deadline_ms: Option<u64>,
    pub head_arrival_ms: u64,
}

/// Score a queue's head: lower wins.
///
/// `score = v − priority_boost − urgency_boost` where the priority boost is
/// `priority_boost_step · level` and the urgency boost applies when the head's
/// deadline is inside the urgency window. Empty queues never score.
pub fn score_queue(
    queue: &TenantQueue,
    shard: usize,
    now_ms: u64,
    cfg: &SchedulerConfig,
) -> Option<Candidate> {
    let head = queue.head()?;

    let priority_boost = cfg.priority_boost_step * head.request.priority.level() as f64;

    let urgency_boost = match head.request.deadline_ts_ms {
        Some(deadline_ms) => {
            let to_deadline_s = (deadline_ms as f64 - now_ms as f64) / 1000.0;
            if to_deadline_s < cfg.urgency_window_s {
                cfg.urgency_boost
            } else {
                0.0
            }
        }
        None => 0.0,
    };

    Some(Candidate {
        tenant_id: queue.tenant_id,
        shard,
        score: queue.virtual_time - priority_boost - urgency_boost,
        head_deadline_ms: head.request.deadline_ts_ms,
        head_arrival_ms: head.request.arrival_ts_ms,
    })
}

/// Total order over candidates: score ascending, then earlier deadline
/// (deadline-less heads last), then earlier arrival.
pub fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| match (a.head_deadline_ms, b.head_deadline_ms) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.head_arrival_ms.cmp(&b.head_arrival_ms))
}
