//! Reserve / commit / release quota engine.
//!
//! Admission reserves, dispatch commits, every failure path releases. A
//! reservation that is neither committed nor released auto-releases when its
//! TTL lapses, so a crashed dispatcher cannot leak quota.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use bus::{EventKind, Publisher};
use corelib::models::{RequestPriority, Resource};
use registry::Tenant;

use crate::counters::{CounterKey, CounterStore};
use crate::error::QuotaError;
use crate::events::{QuotaAuditPayload, UsageMeteredPayload};
use crate::period::Period;

/// How long closed (committed or released) reservation ids are remembered for
/// idempotency before the sweeper forgets them.
const CLOSED_RETENTION_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Fraction of the limit at which `ApproachingLimit` surfaces.
    pub warning_threshold: f64,
    /// Pending reservation lifetime before auto-release.
    pub reservation_ttl_ms: u64,
    /// Platform-default limits; absence means unlimited.
    pub default_limits: HashMap<Resource, u64>,
    /// Accounting period per resource.
    pub periods: HashMap<Resource, Period>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let mut periods = HashMap::new();
        for resource in Resource::ALL {
            periods.insert(resource, Period::Month);
        }
        // API call quotas are enforced hourly.
        periods.insert(Resource::ApiCalls, Period::Hour);

        Self {
            warning_threshold: 0.8,
            reservation_ttl_ms: 30_000,
            default_limits: HashMap::new(),
            periods,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStatus {
    WithinLimits,
    ApproachingLimit,
    Unlimited,
    /// Counter store was unreachable and the fail policy admitted the request
    /// uncounted.
    DegradedOpen,
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: Uuid,
    pub status: QuotaStatus,
    /// Headroom left after this reservation; `None` when unlimited.
    pub remaining: Option<u64>,
    /// When the current period's counter resets, unix seconds.
    pub reset_ts_s: u64,
}

#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Granted(Reservation),
    Denied { remaining: u64, reset_ts_s: u64 },
}

struct PendingReservation {
    key: CounterKey,
    amount: u64,
    /// False when the grant happened in degraded-open mode and never touched
    /// the counter.
    counted: bool,
    expires_at_ms: u64,
}

pub struct QuotaEngine {
    store: Arc<dyn CounterStore>,
    publisher: Publisher,
    config: QuotaConfig,
    pending: Mutex<HashMap<Uuid, PendingReservation>>,
    /// Committed or released ids, kept briefly for idempotent re-application.
    closed: Mutex<HashMap<Uuid, u64>>,
}

impl QuotaEngine {
    pub fn new(store: Arc<dyn CounterStore>, publisher: Publisher, config: QuotaConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            pending: Mutex::new(HashMap::new()),
            closed: Mutex::new(HashMap::new()),
        }
    }

    fn effective_limit(&self, tenant: &Tenant, resource: Resource) -> Option<u64> {
        tenant
            .quota_override(resource)
            .or_else(|| self.config.default_limits.get(&resource).copied())
    }

    fn period_for(&self, resource: Resource) -> Period {
        self.config
            .periods
            .get(&resource)
            .copied()
            .unwrap_or(Period::Month)
    }

    /// Whether a store outage admits (`true`) or refuses (`false`) this
    /// request. Low/normal traffic fails open, high/critical fails closed;
    /// tenants may override either way.
    fn fails_open(tenant: &Tenant, priority: RequestPriority) -> bool {
        tenant.fail_open_override.unwrap_or(matches!(
            priority,
            RequestPriority::Low | RequestPriority::Normal
        ))
    }

    /// Conditionally reserve `amount` units of `resource` for the tenant.
    #[instrument(skip(self, tenant), target = "quota", fields(tenant_id = %tenant.id, resource = %resource))]
    pub async fn reserve(
        &self,
        tenant: &Tenant,
        resource: Resource,
        amount: u64,
        priority: RequestPriority,
        now_ms: u64,
    ) -> Result<ReserveOutcome, QuotaError> {
        let limit = self.effective_limit(tenant, resource);
        let period = self.period_for(resource);
        let (period_start_s, reset_ts_s) = period.bounds(now_ms / 1000);
        let key = CounterKey {
            tenant_id: tenant.id,
            resource,
            period,
            period_start_s,
        };

        let consumed = match self.store.try_increment(&key, amount, limit).await {
            Ok(consumed) => consumed,
            Err(e) => {
                return if Self::fails_open(tenant, priority) {
                    warn!(error = %e, "quota store unavailable; admitting uncounted");
                    self.emit_audit("quota.degraded_open", tenant.id, resource, None, limit);
                    Ok(ReserveOutcome::Granted(self.grant(
                        key, amount, false, now_ms, QuotaStatus::DegradedOpen, None, reset_ts_s,
                    )))
                } else {
                    warn!(error = %e, "quota store unavailable; failing closed");
                    Err(QuotaError::StoreUnavailable(e.to_string()))
                };
            }
        };

        let Some(consumed) = consumed else {
            let current = self.store.get(&key).await.unwrap_or_default();
            let remaining = limit.map(|l| l.saturating_sub(current)).unwrap_or(0);
            debug!(remaining, "reservation denied");
            return Ok(ReserveOutcome::Denied {
                remaining,
                reset_ts_s,
            });
        };

        let (status, remaining) = match limit {
            None => (QuotaStatus::Unlimited, None),
            Some(limit) => {
                let status = if consumed as f64 >= limit as f64 * self.config.warning_threshold {
                    self.emit_audit(
                        "quota.approaching_limit",
                        tenant.id,
                        resource,
                        Some(consumed),
                        Some(limit),
                    );
                    QuotaStatus::ApproachingLimit
                } else {
                    QuotaStatus::WithinLimits
                };
                (status, Some(limit.saturating_sub(consumed)))
            }
        };

        Ok(ReserveOutcome::Granted(self.grant(
            key, amount, true, now_ms, status, remaining, reset_ts_s,
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn grant(
        &self,
        key: CounterKey,
        amount: u64,
        counted: bool,
        now_ms: u64,
        status: QuotaStatus,
        remaining: Option<u64>,
        reset_ts_s: u64,
    ) -> Reservation {
        let id = Uuid::new_v4();
        self.pending.lock().insert(
            id,
            PendingReservation {
                key,
                amount,
                counted,
                expires_at_ms: now_ms + self.config.reservation_ttl_ms,
            },
        );

        Reservation {
            id,
            status,
            remaining,
            reset_ts_s,
        }
    }

    /// Finalize a reservation; the consumption sticks and exactly one
    /// `usage_metered` event is emitted. Idempotent per reservation id.
    #[instrument(skip(self), target = "quota")]
    pub async fn commit(&self, reservation_id: Uuid, now_ms: u64) -> Result<(), QuotaError> {
        let pending = self.pending.lock().remove(&reservation_id);

        let Some(pending) = pending else {
            if self.closed.lock().contains_key(&reservation_id) {
                // Duplicate commit (or commit racing an auto-release): no-op.
                return Ok(());
            }
            return Err(QuotaError::CommitWithoutReserve(reservation_id));
        };

        self.closed.lock().insert(reservation_id, now_ms);

        let payload = UsageMeteredPayload {
            tenant_id: pending.key.tenant_id,
            resource: pending.key.resource.as_str().to_string(),
            quantity: pending.amount,
            period: pending.key.period.as_str().to_string(),
            period_start_s: pending.key.period_start_s,
            ts_s: now_ms / 1000,
        };
        match serde_json::to_value(&payload) {
            Ok(data) => {
                self.publisher.publish(
                    EventKind::UsageMetered,
                    pending.key.tenant_id,
                    RequestPriority::Normal,
                    data,
                    None,
                );
            }
            Err(e) => warn!(error = %e, "failed to encode usage_metered payload"),
        }

        Ok(())
    }

    /// Undo a reservation, returning its quota. Idempotent; unknown ids are
    /// treated as already released.
    #[instrument(skip(self), target = "quota")]
    pub async fn release(&self, reservation_id: Uuid, now_ms: u64) -> Result<(), QuotaError> {
        let pending = self.pending.lock().remove(&reservation_id);

        let Some(pending) = pending else {
            return Ok(());
        };

        self.closed.lock().insert(reservation_id, now_ms);

        if pending.counted {
            self.store.decrement(&pending.key, pending.amount).await?;
        }
        Ok(())
    }

    /// Auto-release reservations whose TTL lapsed and prune old closed ids.
    /// Returns how many reservations expired.
    pub async fn sweep_expired(&self, now_ms: u64) -> u64 {
        let expired: Vec<Uuid> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, p)| p.expires_at_ms <= now_ms)
                .map(|(id, _)| *id)
                .collect()
        };

        for id in &expired {
            let Some(p) = self.pending.lock().remove(id) else {
                continue;
            };
            if p.counted {
                if let Err(e) = self.store.decrement(&p.key, p.amount).await {
                    warn!(reservation_id = %id, error = %e, "failed to return expired reservation");
                }
            }
            self.closed.lock().insert(*id, now_ms);
            self.emit_audit(
                "quota.reservation_expired",
                p.key.tenant_id,
                p.key.resource,
                None,
                None,
            );
            debug!(reservation_id = %id, "reservation auto-released");
        }

        self.closed
            .lock()
            .retain(|_, closed_at| now_ms.saturating_sub(*closed_at) < CLOSED_RETENTION_MS);

        expired.len() as u64
    }

    /// Release every pending reservation; shutdown path.
    pub async fn release_all_pending(&self, now_ms: u64) -> u64 {
        let ids: Vec<Uuid> = self.pending.lock().keys().copied().collect();
        for id in &ids {
            if let Err(e) = self.release(*id, now_ms).await {
                warn!(reservation_id = %id, error = %e, "failed to release pending reservation");
            }
        }
        ids.len() as u64
    }

    /// Current consumption for introspection and tests.
    pub async fn consumed(
        &self,
        tenant_id: Uuid,
        resource: Resource,
        now_ms: u64,
    ) -> Result<u64, QuotaError> {
        let period = self.period_for(resource);
        let key = CounterKey {
            tenant_id,
            resource,
            period,
            period_start_s: period.start(now_ms / 1000),
        };
        self.store.get(&key).await
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn emit_audit(
        &self,
        kind: &str,
        tenant_id: Uuid,
        resource: Resource,
        consumed: Option<u64>,
        limit: Option<u64>,
    ) {
        let payload = QuotaAuditPayload {
            kind: kind.to_string(),
            tenant_id,
            resource: resource.as_str().to_string(),
            consumed,
            limit,
        };
        if let Ok(data) = serde_json::to_value(&payload) {
            self.publisher.publish(
                EventKind::AuditLog,
                tenant_id,
                RequestPriority::Normal,
                data,
                None,
            );
        }
    }
}

/// Owned sweeper loop; the runtime starts and stops it.
pub fn spawn_sweeper(
    engine: Arc<QuotaEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("quota sweeper stopped");
                        return;
                    }
                }
            }
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            engine.sweep_expired(now_ms).await;
        }
    })
}
