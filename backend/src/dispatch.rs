//! Dispatcher: scheduler output → routed, region-checked, quota-committed
//! work on the right tier's pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use bus::{EventKind, Publisher};
use common::logger::warn_if_slow;
use common::time::now_ms;
use corelib::models::Tier;
use quota::{QuotaEngine, QuotaError};
use registry::{ProviderError, ProviderTable, ProviderType};
use router::{Decision, RouteRequest, Router, RouterDecisionPayload, Strategy};
use scheduler::DispatchedRequest;

use crate::metrics::Counters;
use crate::workers::WorkItem;

pub struct Dispatcher {
    router: Arc<Router>,
    quota: Arc<QuotaEngine>,
    providers: Arc<ProviderTable>,
    publisher: Publisher,
    worker_txs: HashMap<Tier, mpsc::Sender<WorkItem>>,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(
        router: Arc<Router>,
        quota: Arc<QuotaEngine>,
        providers: Arc<ProviderTable>,
        publisher: Publisher,
        worker_txs: HashMap<Tier, mpsc::Sender<WorkItem>>,
        counters: Counters,
    ) -> Self {
        Self {
            router,
            quota,
            providers,
            publisher,
            worker_txs,
            counters,
        }
    }

    /// Consume dispatched requests until shutdown.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<DispatchedRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("dispatcher started");
        loop {
            let dispatched = tokio::select! {
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
            self.dispatch_one(dispatched).await;
        }
        info!("dispatcher stopped");
    }

    async fn dispatch_one(&self, dispatched: DispatchedRequest) {
        let now = now_ms();
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        // Escalation requeues carry their tier; everything else is routed.
        let decision = match dispatched.forced_tier {
            Some(tier) => Decision {
                request_id: dispatched.request.request_id,
                tenant_id: dispatched.request.tenant_id,
                tier,
                confidence: 1.0,
                strategy: Strategy::Escalation,
                escalation_reason: None,
                decision_ts_ms: now,
                decision_latency_ns: 0,
            },
            None => {
                self.counters.routed.fetch_add(1, Ordering::Relaxed);
                // The routing pipeline carries a p99 budget of 150ms.
                warn_if_slow(
                    "route_decision",
                    std::time::Duration::from_millis(150),
                    self.router.route(&route_request_of(&dispatched), None, now),
                )
                .await
            }
        };

        // Decision event precedes any usage event for the same request.
        match serde_json::to_value(RouterDecisionPayload::from(&decision)) {
            Ok(data) => {
                self.publisher.publish(
                    EventKind::RouterDecision,
                    dispatched.request.tenant_id,
                    dispatched.request.priority,
                    data,
                    Some(dispatched.request.request_id),
                );
            }
            Err(e) => warn!(error = %e, "failed to encode decision payload"),
        }

        // Residency gate: the backend must live in the tenant's region.
        let provider = match self.providers.resolve(&dispatched.tenant, ProviderType::Llm) {
            Ok(provider) => provider.clone(),
            Err(e) => {
                match &e {
                    ProviderError::RegionForbidden { .. } => {
                        self.counters.region_refusals.fetch_add(1, Ordering::Relaxed);
                    }
                    ProviderError::DownstreamUnavailable { .. } => {
                        self.counters
                            .provider_unavailable
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
                return self.terminal_error(dispatched, e.to_string(), now).await;
            }
        };

        // Successful hand-off to a worker commits the reservation. Escalation
        // retries re-commit the same id, which is a recorded no-op. An unknown
        // id here means the reservation aged out while the request waited;
        // the request terminates instead of running unaccounted.
        match self.quota.commit(dispatched.reservation_id, now).await {
            Ok(()) => {}
            Err(QuotaError::CommitWithoutReserve(id)) => {
                error!(reservation_id = %id, "reservation missing at commit");
                return self
                    .terminal_error(dispatched, "reservation expired before dispatch".to_string(), now)
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "commit failed; continuing with reservation pending");
            }
        }

        let Some(tx) = self.worker_txs.get(&decision.tier) else {
            return self
                .terminal_error(dispatched, format!("no worker pool for tier {}", decision.tier), now)
                .await;
        };

        let item = WorkItem {
            dispatched,
            decision,
            provider,
        };
        if tx.send(item).await.is_err() {
            warn!("worker pool channel closed during dispatch");
        }
    }

    /// A request that cannot reach a worker still gets exactly one terminal
    /// event, and its reservation goes back.
    async fn terminal_error(
        &self,
        dispatched: DispatchedRequest,
        reason: String,
        now: u64,
    ) {
        debug!(request_id = %dispatched.request.request_id, reason, "terminal dispatch error");
        let _ = self.quota.release(dispatched.reservation_id, now).await;
        self.publisher.publish(
            EventKind::AuditLog,
            dispatched.request.tenant_id,
            dispatched.request.priority,
            json!({
                "kind": "dispatch.terminal_error",
                "request_id": dispatched.request.request_id,
                "reason": reason,
            }),
            Some(dispatched.request.request_id),
        );
    }
}

fn route_request_of(dispatched: &DispatchedRequest) -> RouteRequest {
    RouteRequest {
        request_id: dispatched.request.request_id,
        tenant_id: dispatched.request.tenant_id,
        user_id: dispatched.request.user_id.clone(),
        session_id: dispatched.request.session_id,
        plan: dispatched.tenant.plan,
        payload: dispatched.request.payload.clone(),
        schema: dispatched.request.schema.clone(),
        payload_json: dispatched.request.payload_json.clone(),
        fingerprint: dispatched.request.fingerprint,
        deadline_ts_ms: dispatched.request.deadline_ts_ms,
    }
}
