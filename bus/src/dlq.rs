//! Dead-letter envelope.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;

/// What lands on `dlq.<kind>` after redelivery is exhausted. The original
/// event rides along untouched so operators can requeue it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub original_subject: String,
    pub data: Event,
    pub headers: HashMap<String, String>,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DlqEnvelope {
    pub fn new(original: &Event, subject: String, error: String, retry_count: u32) -> Self {
        Self {
            original_subject: subject,
            headers: original.headers(),
            data: original.clone(),
            error,
            retry_count,
            failed_at: Utc::now(),
        }
    }
}
