//! Versioned event envelope and stream kinds.
//!
//! Every event on the bus is one of these envelopes; producers put their typed
//! payload under `data` and consumers reject envelopes whose major version
//! they do not understand.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use corelib::models::RequestPriority;

use crate::error::BusError;

pub const ENVELOPE_VERSION: &str = "1.0";

/// Logical streams, one per event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentRun,
    ToolCall,
    IngestDoc,
    UsageMetered,
    RouterDecision,
    WsMessage,
    BillingEvent,
    AuditLog,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::AgentRun,
        EventKind::ToolCall,
        EventKind::IngestDoc,
        EventKind::UsageMetered,
        EventKind::RouterDecision,
        EventKind::WsMessage,
        EventKind::BillingEvent,
        EventKind::AuditLog,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::AgentRun => "agent_run",
            EventKind::ToolCall => "tool_call",
            EventKind::IngestDoc => "ingest_doc",
            EventKind::UsageMetered => "usage_metered",
            EventKind::RouterDecision => "router_decision",
            EventKind::WsMessage => "ws_message",
            EventKind::BillingEvent => "billing_event",
            EventKind::AuditLog => "audit_log",
        }
    }

    pub fn dlq_subject(self) -> String {
        format!("dlq.{}", self.as_str())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| BusError::UnknownStream(s.to_string()))
    }
}

/// The wire envelope. Headers mirror the top-level fields so consumers can
/// filter without parsing `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub tenant_id: Uuid,
    /// 1..4, mirroring request priority levels.
    pub priority: u8,
    pub correlation_id: Uuid,
    /// Unix seconds.
    pub ts: u64,
    pub version: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(
        kind: EventKind,
        tenant_id: Uuid,
        priority: RequestPriority,
        data: serde_json::Value,
        correlation_id: Option<Uuid>,
        ts: u64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            tenant_id,
            priority: priority.level(),
            correlation_id: correlation_id.unwrap_or_else(Uuid::new_v4),
            ts,
            version: ENVELOPE_VERSION.to_string(),
            data,
        }
    }

    /// Subject the event is published on: `events.<priority?>.<kind>`.
    /// Only high and critical priorities get their own subject segment.
    pub fn subject(&self) -> String {
        match RequestPriority::from_level(self.priority) {
            Some(RequestPriority::Critical) => format!("events.critical.{}", self.kind),
            Some(RequestPriority::High) => format!("events.high.{}", self.kind),
            _ => format!("events.{}", self.kind),
        }
    }

    pub fn headers(&self) -> HashMap<String, String> {
        HashMap::from([
            ("event_id".to_string(), self.event_id.to_string()),
            ("type".to_string(), self.kind.to_string()),
            ("tenant_id".to_string(), self.tenant_id.to_string()),
            ("priority".to_string(), self.priority.to_string()),
            ("correlation_id".to_string(), self.correlation_id.to_string()),
        ])
    }

    /// Consumers call this before handling; envelopes from a future major
    /// version are rejected rather than half-understood.
    pub fn check_version(&self) -> Result<(), BusError> {
        match self.version.split('.').next() {
            Some("1") => Ok(()),
            _ => Err(BusError::UnsupportedVersion(self.version.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(priority: RequestPriority) -> Event {
        Event::new(
            EventKind::UsageMetered,
            Uuid::new_v4(),
            priority,
            serde_json::json!({"quantity": 1}),
            None,
            1_700_000_000,
        )
    }

    #[test]
    fn subjects_carry_priority_segment_only_when_elevated() {
        assert_eq!(event(RequestPriority::Low).subject(), "events.usage_metered");
        assert_eq!(
            event(RequestPriority::Normal).subject(),
            "events.usage_metered"
        );
        assert_eq!(
            event(RequestPriority::High).subject(),
            "events.high.usage_metered"
        );
        assert_eq!(
            event(RequestPriority::Critical).subject(),
            "events.critical.usage_metered"
        );
    }

    #[test]
    fn envelope_round_trips_json() {
        let ev = event(RequestPriority::Normal);
        let raw = serde_json::to_string(&ev).unwrap();
        assert!(raw.contains("\"type\":\"usage_metered\""));

        let back: Event = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.event_id, ev.event_id);
        assert_eq!(back.kind, EventKind::UsageMetered);
        assert_eq!(back.version, ENVELOPE_VERSION);
    }

    #[test]
    fn future_major_version_is_rejected() {
        let mut ev = event(RequestPriority::Normal);
        ev.check_version().unwrap();

        ev.version = "2.0".to_string();
        assert!(matches!(
            ev.check_version(),
            Err(BusError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn kind_names_round_trip() {
        for k in EventKind::ALL {
            assert_eq!(k.as_str().parse::<EventKind>().unwrap(), k);
        }
        assert!("no_such_stream".parse::<EventKind>().is_err());
    }
}
