//! Tier worker pools.
//!
//! The core does not run inference; a [`TierWorker`] is the boundary to
//! whatever does. Each pool owns a bounded channel, advertises its free
//! capacity on the credit board, and reports terminal results to the
//! recorder. A failed first attempt below Tier C escalates back into the
//! scheduler instead of terminating.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use bus::{EventKind, Publisher};
use common::time::now_ms;
use corelib::models::Tier;
use registry::ProviderConfig;
use router::Decision;
use scheduler::{DispatchedRequest, SchedulerEngine, WorkerCredits};

use crate::metrics::Counters;
use crate::recorder::{Outcome, OutcomeRecorder};

/// One routed request on its way through a tier worker.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub dispatched: DispatchedRequest,
    pub decision: Decision,
    pub provider: ProviderConfig,
}

/// What a worker reports back for one executed request.
#[derive(Debug, Clone)]
pub struct WorkResult {
    pub success: bool,
    pub latency_ms: u64,
    pub cost_micro_usd: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub quality: f64,
}

/// The external execution boundary. `Err` means a platform fault (the tenant
/// is not charged extra and the failure is recorded as unsuccessful).
#[async_trait::async_trait]
pub trait TierWorker: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> anyhow::Result<WorkResult>;
}

const DEFAULT_EXECUTION_BUDGET_MS: u64 = 30_000;

/// Deterministic stand-in worker used by the binary and the end-to-end
/// tests: succeeds, with cost and latency scaled by tier.
pub struct SimulatedWorker {
    pub tier: Tier,
}

#[async_trait::async_trait]
impl TierWorker for SimulatedWorker {
    async fn execute(&self, item: &WorkItem) -> anyhow::Result<WorkResult> {
        let tokens_in = (item.dispatched.request.payload.len() as u64 / 4).max(1);
        let tokens_out = tokens_in / 2 + 8;
        Ok(WorkResult {
            success: true,
            latency_ms: 20 * self.tier.cost_weight() as u64,
            cost_micro_usd: (self.tier.cost_weight() * 1_000.0) as u64,
            tokens_in,
            tokens_out,
            quality: 0.9,
        })
    }
}

/// Run one tier's pool until shutdown. Capacity is granted up front on the
/// credit board and returned after every completed item.
#[allow(clippy::too_many_arguments)]
pub async fn run_worker_pool(
    tier: Tier,
    worker: Arc<dyn TierWorker>,
    mut rx: mpsc::Receiver<WorkItem>,
    credits: Arc<WorkerCredits>,
    scheduler: Arc<SchedulerEngine>,
    recorder: Arc<OutcomeRecorder>,
    publisher: Publisher,
    counters: Counters,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(tier = %tier, "worker pool started");
    loop {
        let item = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        // Deadline propagation: the worker gets the request's remaining
        // budget, or the 30s default when none was set.
        let start = now_ms();
        let budget_ms = item
            .dispatched
            .request
            .deadline_ts_ms
            .map(|deadline| deadline.saturating_sub(start))
            .unwrap_or(DEFAULT_EXECUTION_BUDGET_MS)
            .clamp(1, DEFAULT_EXECUTION_BUDGET_MS);
        let result = match tokio::time::timeout(
            std::time::Duration::from_millis(budget_ms),
            worker.execute(&item),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("execution exceeded {budget_ms}ms budget")),
        };
        let now = now_ms();

        match result {
            Ok(result) if result.success => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                let outcome = outcome_from(&item, &result, tier);
                recorder.record(&item, &outcome, now).await;
            }
            Ok(result) => {
                // Unsuccessful execution: escalate once per request while a
                // higher tier exists, otherwise record the failure.
                if item.dispatched.attempt == 0 && tier != Tier::C {
                    counters.escalated.fetch_add(1, Ordering::Relaxed);
                    let target = tier.escalated();
                    debug!(
                        request_id = %item.dispatched.request.request_id,
                        from = %tier, to = %target,
                        "worker failure; escalating"
                    );
                    publisher.publish(
                        EventKind::AuditLog,
                        item.dispatched.request.tenant_id,
                        item.dispatched.request.priority,
                        json!({
                            "kind": "dispatch.escalated",
                            "request_id": item.dispatched.request.request_id,
                            "from_tier": tier,
                            "to_tier": target,
                            "reason": "worker_failure",
                        }),
                        Some(item.dispatched.request.request_id),
                    );
                    scheduler.requeue_escalated(item.dispatched.clone(), target);
                } else {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    let outcome = outcome_from(&item, &result, tier);
                    recorder.record(&item, &outcome, now).await;
                }
            }
            Err(e) => {
                warn!(
                    request_id = %item.dispatched.request.request_id,
                    tier = %tier,
                    error = %e,
                    "platform fault during execution"
                );
                counters.failed.fetch_add(1, Ordering::Relaxed);
                let outcome = Outcome {
                    request_id: item.dispatched.request.request_id,
                    tenant_id: item.dispatched.request.tenant_id,
                    tier,
                    success: false,
                    latency_ms: 0,
                    cost_micro_usd: 0,
                    tokens_in: 0,
                    tokens_out: 0,
                    quality: 0.0,
                };
                recorder.record(&item, &outcome, now).await;
            }
        }

        credits.add(tier, 1);
        scheduler.poke();
    }
    info!(tier = %tier, "worker pool stopped");
}

fn outcome_from(item: &WorkItem, result: &WorkResult, tier: Tier) -> Outcome {
    Outcome {
        request_id: item.dispatched.request.request_id,
        tenant_id: item.dispatched.request.tenant_id,
        tier,
        success: result.success,
        latency_ms: result.latency_ms,
        cost_micro_usd: result.cost_micro_usd,
        tokens_in: result.tokens_in,
        tokens_out: result.tokens_out,
        quality: result.quality,
    }
}
