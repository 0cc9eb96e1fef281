//! Shared domain primitives used across the request plane.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Service tiers, cheapest/fastest first.
///
/// Tier A is the small fast model class, Tier C the most capable and most
/// expensive. Escalation moves one level up and saturates at C.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    A,
    B,
    C,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::A, Tier::B, Tier::C];

    /// One level up, saturating at C.
    pub fn escalated(self) -> Tier {
        match self {
            Tier::A => Tier::B,
            Tier::B | Tier::C => Tier::C,
        }
    }

    /// Relative cost of serving on this tier, normalized so that A = 1.
    pub fn cost_weight(self) -> f64 {
        match self {
            Tier::A => 1.0,
            Tier::B => 4.0,
            Tier::C => 16.0,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::A => "A",
            Tier::B => "B",
            Tier::C => "C",
        };
        f.write_str(s)
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(Tier::A),
            "B" => Ok(Tier::B),
            "C" => Ok(Tier::C),
            other => Err(format!("invalid tier: {other}")),
        }
    }
}

/// Request priority levels. The numeric level feeds the scheduler's
/// priority boost and the event envelope's priority field.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum RequestPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl RequestPriority {
    pub fn level(self) -> u8 {
        match self {
            RequestPriority::Low => 1,
            RequestPriority::Normal => 2,
            RequestPriority::High => 3,
            RequestPriority::Critical => 4,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(RequestPriority::Low),
            2 => Some(RequestPriority::Normal),
            3 => Some(RequestPriority::High),
            4 => Some(RequestPriority::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestPriority::Low => "low",
            RequestPriority::Normal => "normal",
            RequestPriority::High => "high",
            RequestPriority::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Metered resource kinds. These key quota counters and usage events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    ApiCalls,
    Tokens,
    ToolCalls,
    WsMinutes,
    StorageMb,
}

impl Resource {
    pub const ALL: [Resource; 5] = [
        Resource::ApiCalls,
        Resource::Tokens,
        Resource::ToolCalls,
        Resource::WsMinutes,
        Resource::StorageMb,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Resource::ApiCalls => "api_calls",
            Resource::Tokens => "tokens",
            Resource::ToolCalls => "tool_calls",
            Resource::WsMinutes => "ws_minutes",
            Resource::StorageMb => "storage_mb",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api_calls" => Ok(Resource::ApiCalls),
            "tokens" => Ok(Resource::Tokens),
            "tool_calls" => Ok(Resource::ToolCalls),
            "ws_minutes" => Ok(Resource::WsMinutes),
            "storage_mb" => Ok(Resource::StorageMb),
            other => Err(format!("invalid resource: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_saturates_at_c() {
        assert_eq!(Tier::A.escalated(), Tier::B);
        assert_eq!(Tier::B.escalated(), Tier::C);
        assert_eq!(Tier::C.escalated(), Tier::C);
    }

    #[test]
    fn priority_levels_round_trip() {
        for p in [
            RequestPriority::Low,
            RequestPriority::Normal,
            RequestPriority::High,
            RequestPriority::Critical,
        ] {
            assert_eq!(RequestPriority::from_level(p.level()), Some(p));
        }
        assert_eq!(RequestPriority::from_level(0), None);
        assert_eq!(RequestPriority::from_level(5), None);
    }

    #[test]
    fn resource_names_round_trip() {
        for r in Resource::ALL {
            assert_eq!(r.as_str().parse::<Resource>().unwrap(), r);
        }
    }
}
