//! Billing read model over `usage_metered` events.
//!
//! The events are the source of truth; these totals are a rebuildable fold
//! used for invoice previews and quota dashboards. Any drift between this
//! view and the billing engine's own aggregation is a bug, not a design
//! choice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use bus::{Event, EventHandler};
use quota::UsageMeteredPayload;

/// USD per unit, by resource name.
fn default_rates() -> HashMap<String, f64> {
    HashMap::from([
        ("tokens".to_string(), 0.0001),
        ("tool_calls".to_string(), 0.01),
        ("ws_minutes".to_string(), 0.05),
        ("storage_mb".to_string(), 0.10),
        ("api_calls".to_string(), 0.001),
    ])
}

const TAX_RATE: f64 = 0.08;

type UsageKey = (Uuid, String, u64);

pub struct UsageAggregator {
    rates: HashMap<String, f64>,
    totals: Mutex<HashMap<UsageKey, u64>>,
    seen_events: Mutex<HashSet<Uuid>>,
}

impl Default for UsageAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self {
            rates: default_rates(),
            totals: Mutex::new(HashMap::new()),
            seen_events: Mutex::new(HashSet::new()),
        }
    }

    pub fn usage(&self, tenant_id: Uuid, resource: &str, period_start_s: u64) -> u64 {
        self.totals
            .lock()
            .get(&(tenant_id, resource.to_string(), period_start_s))
            .copied()
            .unwrap_or(0)
    }

    /// Price the tenant's usage for the period.
    pub fn invoice_preview(
        &self,
        tenant_id: Uuid,
        period_start_s: u64,
        now_s: u64,
    ) -> InvoicePreview {
        let totals = self.totals.lock();
        let mut lines: Vec<InvoiceLine> = totals
            .iter()
            .filter(|((tenant, _, period), _)| *tenant == tenant_id && *period == period_start_s)
            .map(|((_, resource, _), quantity)| {
                let unit_price_usd = self.rates.get(resource).copied().unwrap_or(0.0);
                InvoiceLine {
                    resource: resource.clone(),
                    quantity: *quantity,
                    unit_price_usd,
                    total_usd: unit_price_usd * *quantity as f64,
                }
            })
            .collect();
        lines.sort_by(|a, b| a.resource.cmp(&b.resource));

        let subtotal_usd: f64 = lines.iter().map(|l| l.total_usd).sum();
        let tax_usd = subtotal_usd * TAX_RATE;

        InvoicePreview {
            preview_id: format!("preview-{}", common::logger::CorrelationId::new()),
            tenant_id,
            period_start_s,
            lines,
            subtotal_usd,
            tax_usd,
            total_usd: subtotal_usd + tax_usd,
            generated_at_s: now_s,
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for UsageAggregator {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        event.check_version()?;

        // At-least-once delivery: the event id dedups replays.
        if !self.seen_events.lock().insert(event.event_id) {
            debug!(event_id = %event.event_id, "duplicate usage event skipped");
            return Ok(());
        }

        let payload: UsageMeteredPayload = serde_json::from_value(event.data.clone())?;
        let mut totals = self.totals.lock();
        *totals
            .entry((payload.tenant_id, payload.resource, payload.period_start_s))
            .or_insert(0) += payload.quantity;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub resource: String,
    pub quantity: u64,
    pub unit_price_usd: f64,
    pub total_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoicePreview {
    pub preview_id: String,
    pub tenant_id: Uuid,
    pub period_start_s: u64,
    pub lines: Vec<InvoiceLine>,
    pub subtotal_usd: f64,
    pub tax_usd: f64,
    pub total_usd: f64,
    pub generated_at_s: u64,
}
