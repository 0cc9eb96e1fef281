//! Calibrated tier classifier.
//!
//! A rule-scored difficulty estimate produces per-tier logits; temperature
//! scaling calibrates the softmax per tenant. No training happens here; the
//! calibration store is written offline and read at decision time.

use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use corelib::models::Tier;

use crate::features::RouterFeatures;

/// Difficulty centers for the three tiers; a request lands on the tier whose
/// center its difficulty estimate is closest to.
const TIER_CENTERS: [f64; 3] = [0.15, 0.5, 0.85];
const CENTER_WIDTH: f64 = 0.08;

/// Per-tenant softmax temperatures, default 1.0.
#[derive(Default)]
pub struct CalibrationMap {
    temperatures: Mutex<HashMap<Uuid, f64>>,
}

impl CalibrationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn temperature(&self, tenant_id: Uuid) -> f64 {
        self.temperatures
            .lock()
            .get(&tenant_id)
            .copied()
            .unwrap_or(1.0)
    }

    pub fn set_temperature(&self, tenant_id: Uuid, temperature: f64) {
        self.temperatures
            .lock()
            .insert(tenant_id, temperature.max(0.05));
    }
}

/// Scalar difficulty estimate in `[0, 1]`.
fn difficulty(features: &RouterFeatures) -> f64 {
    let token_pressure = (features.token_count as f64 / 1000.0).min(1.0);
    (0.35 * features.complexity
        + 0.20 * features.novelty
        + 0.25 * features.historical_failure_rate
        + 0.20 * token_pressure)
        .clamp(0.0, 1.0)
}

fn logits(features: &RouterFeatures) -> [f64; 3] {
    let d = difficulty(features);
    let mut out = [0.0; 3];
    for (i, center) in TIER_CENTERS.iter().enumerate() {
        let dist = d - center;
        out[i] = -(dist * dist) / CENTER_WIDTH;
    }
    out
}

fn softmax(logits: [f64; 3], temperature: f64) -> [f64; 3] {
    let t = temperature.max(0.05);
    let max = logits.iter().cloned().fold(f64::MIN, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| ((l - max) / t).exp()).collect();
    let sum: f64 = exps.iter().sum();
    [exps[0] / sum, exps[1] / sum, exps[2] / sum]
}

/// Classify into a tier with a calibrated confidence.
pub fn classify(features: &RouterFeatures, temperature: f64) -> (Tier, f64, [f64; 3]) {
    let probs = softmax(logits(features), temperature);
    let (idx, confidence) = probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, p)| (i, *p))
        .unwrap_or((1, 0.0));
    (Tier::ALL[idx], confidence, probs)
}
