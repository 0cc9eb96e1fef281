//! The main scheduler engine.
//!
//! Admission: resolve tenant, check depth cap, reserve quota, enqueue.
//! Dispatch: on every tick (and on every enqueue), drain the lowest-scoring
//! queue heads into the dispatcher while worker credits last.
//!
//! Safety/liveness properties:
//! - No global lock; queues live in per-tenant shards.
//! - Virtual-time fair queuing bounds any tenant's long-run share at
//!   `weight / Σ weights` under contention.
//! - Every queued request holds a quota reservation; every exit path
//!   (dispatch, deadline miss, cancel, drain, shutdown) settles it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::json;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, instrument, warn};

use bus::{EventKind, Publisher};
use common::logger::warn_if_slow;
use common::time::now_ms;
use corelib::models::{RequestPriority, Tier};
use quota::{QuotaEngine, QuotaError, ReserveOutcome};
use registry::{CachedTenantRegistry, TenantId};

use crate::queue::{QueuedItem, TenantQueue, TenantQueueStats};
use crate::select::{Candidate, compare, score_queue};
use crate::shard::QueueMap;
use crate::types::{
    AdmissionError, AdmissionTicket, DispatchSender, DispatchedRequest, Request, RequestId,
    SchedulerConfig, SystemStats, WorkerCredits,
};

/// Observability counters (do not affect behavior).
#[derive(Default)]
pub struct SchedulerCounters {
    pub admitted: AtomicU64,
    pub rejected_queue_full: AtomicU64,
    pub rejected_quota: AtomicU64,
    pub dispatched: AtomicU64,
    pub deadline_misses: AtomicU64,
    pub cancelled: AtomicU64,
}

pub struct SchedulerEngine {
    cfg: SchedulerConfig,
    registry: Arc<CachedTenantRegistry>,
    quota: Arc<QuotaEngine>,
    publisher: Publisher,
    queues: QueueMap,
    dispatch_tx: DispatchSender,
    credits: Arc<WorkerCredits>,
    notify: Notify,
    admitting: AtomicBool,
    pub counters: SchedulerCounters,
}

impl SchedulerEngine {
    pub fn new(
        cfg: SchedulerConfig,
        registry: Arc<CachedTenantRegistry>,
        quota: Arc<QuotaEngine>,
        publisher: Publisher,
        dispatch_tx: DispatchSender,
        credits: Arc<WorkerCredits>,
    ) -> Self {
        Self {
            cfg,
            registry,
            quota,
            publisher,
            queues: QueueMap::new(),
            dispatch_tx,
            credits,
            notify: Notify::new(),
            admitting: AtomicBool::new(true),
            counters: SchedulerCounters::default(),
        }
    }

    pub fn credits(&self) -> Arc<WorkerCredits> {
        self.credits.clone()
    }

    /// Wake the dispatch loop early, e.g. after worker capacity returns.
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    /// Admit a request: tenant checks, depth cap, quota reserve, enqueue.
    #[instrument(skip(self, request), target = "scheduler",
                 fields(request_id = %request.request_id, tenant_id = %request.tenant_id))]
    pub async fn schedule(&self, mut request: Request) -> Result<AdmissionTicket, AdmissionError> {
        if !self.admitting.load(Ordering::SeqCst) {
            return Err(AdmissionError::DownstreamUnavailable(
                "scheduler is shutting down".to_string(),
            ));
        }

        let now = now_ms();
        let tenant = self
            .registry
            .get_tenant(request.tenant_id, now)
            .await
            .map_err(|e| match e {
                registry::RegistryError::TenantBind(msg) => AdmissionError::TenantBind(msg),
                other => AdmissionError::DownstreamUnavailable(other.to_string()),
            })?
            .ok_or(AdmissionError::TenantInactive)?;

        if !tenant.is_active() {
            return Err(AdmissionError::TenantInactive);
        }
        if !tenant.region_allowed(&tenant.data_region) {
            return Err(AdmissionError::RegionForbidden);
        }

        // Depth gate before the quota round trip.
        let weight = self.cfg.weights.for_tenant(&tenant);
        let full = self.queues.with_shard(&request.tenant_id, |shard| {
            let queue = shard.entry(request.tenant_id).or_insert_with(|| {
                TenantQueue::new(request.tenant_id, weight, self.cfg.queue_depth_cap, now)
            });
            if queue.is_full() {
                queue.on_rejected(now);
                true
            } else {
                false
            }
        });
        if full {
            self.counters.rejected_queue_full.fetch_add(1, Ordering::Relaxed);
            self.emit_drop(&request, "queue_full");
            return Err(AdmissionError::QueueFull {
                retry_after_ms: self.cfg.tick_interval.as_millis() as u64,
            });
        }

        let reserve_outcome = warn_if_slow(
            "quota_reserve",
            std::time::Duration::from_millis(100),
            self.quota.reserve(
                &tenant,
                self.cfg.admission_resource,
                self.cfg.admission_amount,
                request.priority,
                now,
            ),
        )
        .await;
        let reservation = match reserve_outcome {
            Ok(ReserveOutcome::Granted(reservation)) => reservation,
            Ok(ReserveOutcome::Denied { reset_ts_s, .. }) => {
                self.counters.rejected_quota.fetch_add(1, Ordering::Relaxed);
                self.queues.with_shard(&request.tenant_id, |shard| {
                    if let Some(queue) = shard.get_mut(&request.tenant_id) {
                        queue.on_rejected(now);
                    }
                });
                return Err(AdmissionError::QuotaExceeded {
                    resource: self.cfg.admission_resource,
                    retry_after_ms: (reset_ts_s * 1000).saturating_sub(now),
                });
            }
            Err(QuotaError::StoreUnavailable(msg)) => {
                return Err(AdmissionError::DownstreamUnavailable(msg));
            }
            Err(e) => {
                return Err(AdmissionError::DownstreamUnavailable(e.to_string()));
            }
        };

        request.arrival_ts_ms = now;
        let item = QueuedItem {
            request,
            reservation_id: reservation.id,
            attempt: 0,
            forced_tier: None,
        };
        let request_id = item.request.request_id;

        // Re-check the cap: another admission may have filled the queue while
        // the quota reserve was in flight.
        let overflowed = self.queues.with_shard(&item.request.tenant_id, |shard| {
            let queue = shard.entry(item.request.tenant_id).or_insert_with(|| {
                TenantQueue::new(item.request.tenant_id, weight, self.cfg.queue_depth_cap, now)
            });
            if queue.is_full() {
                queue.on_rejected(now);
                Err(item.clone())
            } else {
                queue.push_back(item.clone(), now);
                Ok(())
            }
        });
        if let Err(rejected) = overflowed {
            self.counters.rejected_queue_full.fetch_add(1, Ordering::Relaxed);
            let _ = self.quota.release(rejected.reservation_id, now).await;
            self.emit_drop(&rejected.request, "queue_full");
            return Err(AdmissionError::QueueFull {
                retry_after_ms: self.cfg.tick_interval.as_millis() as u64,
            });
        }

        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        debug!("request admitted");

        Ok(AdmissionTicket {
            request_id,
            reservation_id: reservation.id,
            quota_status: reservation.status,
        })
    }

    /// Requeue an escalated request at the head of its tenant's queue with
    /// `HIGH` priority and the escalated tier pinned. The original quota
    /// reservation rides along; no admission-time checks rerun.
    pub fn requeue_escalated(&self, dispatched: DispatchedRequest, tier: Tier) {
        let now = now_ms();
        let mut request = dispatched.request;
        request.priority = RequestPriority::High;

        let tenant_id = request.tenant_id;
        let weight = self.cfg.weights.for_tenant(&dispatched.tenant);
        let item = QueuedItem {
            request,
            reservation_id: dispatched.reservation_id,
            attempt: dispatched.attempt + 1,
            forced_tier: Some(tier),
        };

        self.queues.with_shard(&tenant_id, |shard| {
            let queue = shard.entry(tenant_id).or_insert_with(|| {
                TenantQueue::new(tenant_id, weight, self.cfg.queue_depth_cap, now)
            });
            queue.push_front(item, now);
        });
        self.notify.notify_one();
    }

    /// Remove a still-queued request and release its reservation. Idempotent;
    /// returns whether anything was removed.
    pub async fn cancel(&self, request_id: RequestId) -> bool {
        let now = now_ms();
        let mut removed: Option<QueuedItem> = None;

        for idx in 0..self.queues.shard_count() {
            removed = self.queues.with_shard_index(idx, |shard| {
                shard
                    .values_mut()
                    .find_map(|queue| queue.remove(request_id, now))
            });
            if removed.is_some() {
                break;
            }
        }

        match removed {
            Some(item) => {
                let _ = self.quota.release(item.reservation_id, now).await;
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                info!(request_id = %request_id, "queued request cancelled");
                true
            }
            None => false,
        }
    }

    /// Drop everything a tenant has queued, releasing each reservation.
    /// Returns the number of requests dropped.
    pub async fn clear_tenant_queue(&self, tenant_id: TenantId) -> usize {
        let now = now_ms();
        let drained = self.queues.with_shard(&tenant_id, |shard| {
            shard
                .get_mut(&tenant_id)
                .map(|queue| queue.drain_all(now))
                .unwrap_or_default()
        });

        for item in &drained {
            let _ = self.quota.release(item.reservation_id, now).await;
        }
        if !drained.is_empty() {
            info!(tenant_id = %tenant_id, dropped = drained.len(), "tenant queue cleared");
        }
        drained.len()
    }

    pub fn queue_stats(&self, tenant_id: TenantId) -> Option<TenantQueueStats> {
        self.queues
            .with_shard(&tenant_id, |shard| shard.get(&tenant_id).map(|q| q.stats()))
    }

    pub fn system_stats(&self) -> SystemStats {
        let mut stats = SystemStats::default();
        for idx in 0..self.queues.shard_count() {
            self.queues.with_shard_index(idx, |shard| {
                for queue in shard.values() {
                    stats.total_queues += 1;
                    stats.total_queued += queue.depth();
                    *stats.weight_distribution.entry(queue.weight).or_insert(0) += 1;
                }
            });
        }
        stats
    }

    /// The dispatch loop: runs until shutdown flips, then drains and releases
    /// whatever is still queued.
    pub async fn run_dispatch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler dispatch loop started");
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.cfg.tick_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.drain_once().await;
            self.queues.evict_idle(now_ms(), self.cfg.idle_queue_ttl_ms);
        }

        self.admitting.store(false, Ordering::SeqCst);
        let released = self.release_all_queued().await;
        info!(released, "scheduler dispatch loop stopped");
    }

    /// Stop admitting new work (shutdown step one).
    pub fn stop_admitting(&self) {
        self.admitting.store(false, Ordering::SeqCst);
    }

    /// One drain pass: move queue heads to the dispatcher while credits and
    /// channel capacity last.
    pub async fn drain_once(&self) {
        loop {
            // A slot in the dispatch channel, claimed before popping so a
            // full channel never loses a popped request.
            let Ok(permit) = self.dispatch_tx.try_reserve() else {
                return;
            };

            let now = now_ms();
            let Some(best) = self.best_candidate(now) else {
                return;
            };

            let Some(credit_tier) = self.credits.take_any() else {
                return;
            };

            let popped = self.queues.with_shard_index(best.shard, |shard| {
                let queue = shard.get_mut(&best.tenant_id)?;
                let item = queue.pop_front(now)?;
                Some((item, queue.weight))
            });
            let Some((item, _weight)) = popped else {
                self.credits.add(credit_tier, 1);
                continue;
            };

            // Deadline already blown: terminal miss, never dispatched.
            if let Some(deadline_ms) = item.request.deadline_ts_ms {
                if deadline_ms <= now {
                    self.credits.add(credit_tier, 1);
                    self.on_deadline_miss(item, now).await;
                    continue;
                }
            }

            let tenant = match self.registry.get_tenant(item.request.tenant_id, now).await {
                Ok(Some(tenant)) => tenant,
                _ => {
                    // Tenant vanished between admission and dispatch; settle
                    // the reservation and drop.
                    self.credits.add(credit_tier, 1);
                    let _ = self.quota.release(item.reservation_id, now).await;
                    self.queues.with_shard_index(best.shard, |shard| {
                        if let Some(queue) = shard.get_mut(&best.tenant_id) {
                            queue.on_dropped(1, now);
                        }
                    });
                    continue;
                }
            };

            self.queues.with_shard_index(best.shard, |shard| {
                if let Some(queue) = shard.get_mut(&best.tenant_id) {
                    queue.on_served(1.0, now);
                }
            });

            permit.send(DispatchedRequest {
                request: item.request,
                reservation_id: item.reservation_id,
                tenant,
                attempt: item.attempt,
                forced_tier: item.forced_tier,
            });
            self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn best_candidate(&self, now: u64) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;
        for idx in 0..self.queues.shard_count() {
            self.queues.with_shard_index(idx, |shard| {
                for queue in shard.values() {
                    if let Some(candidate) = score_queue(queue, idx, now, &self.cfg) {
                        if best.is_none_or(|b| compare(&candidate, &b).is_lt()) {
                            best = Some(candidate);
                        }
                    }
                }
            });
        }
        best
    }

    async fn on_deadline_miss(&self, item: QueuedItem, now: u64) {
        self.counters.deadline_misses.fetch_add(1, Ordering::Relaxed);
        let _ = self.quota.release(item.reservation_id, now).await;

        // The miss is terminal for the request's accounting.
        self.queues.with_shard(&item.request.tenant_id, |shard| {
            if let Some(queue) = shard.get_mut(&item.request.tenant_id) {
                queue.on_dropped(1, now);
            }
        });

        warn!(
            request_id = %item.request.request_id,
            tenant_id = %item.request.tenant_id,
            "deadline missed in queue"
        );
        self.publisher.publish(
            EventKind::AuditLog,
            item.request.tenant_id,
            item.request.priority,
            json!({
                "kind": "scheduler.deadline_miss",
                "request_id": item.request.request_id,
                "deadline_ts_ms": item.request.deadline_ts_ms,
                "missed_at_ms": now,
            }),
            Some(item.request.request_id),
        );
    }

    async fn release_all_queued(&self) -> usize {
        let now = now_ms();
        let mut drained = Vec::new();
        for idx in 0..self.queues.shard_count() {
            self.queues.with_shard_index(idx, |shard| {
                for queue in shard.values_mut() {
                    drained.extend(queue.drain_all(now));
                }
            });
        }
        for item in &drained {
            let _ = self.quota.release(item.reservation_id, now).await;
        }
        drained.len()
    }

    fn emit_drop(&self, request: &Request, reason: &str) {
        self.publisher.publish(
            EventKind::AuditLog,
            request.tenant_id,
            request.priority,
            json!({
                "kind": "scheduler.drop",
                "request_id": request.request_id,
                "reason": reason,
            }),
            Some(request.request_id),
        );
    }
}
