use crate::streams::SessionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Trust-score penalty applied per violation of this severity.
    pub fn trust_penalty(&self) -> i32 {
        match self {
            Severity::Info => 5,
            Severity::Warning => 10,
            Severity::Critical => 20,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Concurrent,
    GeoRestriction,
    ImpossibleTravel,
    SimultaneousLocations,
    DeviceVelocity,
    IspVelocity,
    NewDevice,
    NewLocation,
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuleKind::Concurrent => "concurrent",
            RuleKind::GeoRestriction => "geo_restriction",
            RuleKind::ImpossibleTravel => "impossible_travel",
            RuleKind::SimultaneousLocations => "simultaneous_locations",
            RuleKind::DeviceVelocity => "device_velocity",
            RuleKind::IspVelocity => "isp_velocity",
            RuleKind::NewDevice => "new_device",
            RuleKind::NewLocation => "new_location",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "concurrent" => Ok(RuleKind::Concurrent),
            "geo_restriction" => Ok(RuleKind::GeoRestriction),
            "impossible_travel" => Ok(RuleKind::ImpossibleTravel),
            "simultaneous_locations" => Ok(RuleKind::SimultaneousLocations),
            "device_velocity" => Ok(RuleKind::DeviceVelocity),
            "isp_velocity" => Ok(RuleKind::IspVelocity),
            "new_device" => Ok(RuleKind::NewDevice),
            "new_location" => Ok(RuleKind::NewLocation),
            _ => Err(format!("Invalid rule kind: {}", s)),
        }
    }
}

/// A configured detection rule. The config blob is parsed into the
/// kind-specific typed config by the evaluator that handles it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    pub kind: RuleKind,
    pub enabled: bool,
    #[serde(default)]
    pub config_json: serde_json::Value,
    #[serde(default)]
    pub channel_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Discord,
    Webhook,
    Pushover,
    Ntfy,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Discord => write!(f, "discord"),
            ChannelKind::Webhook => write!(f, "webhook"),
            ChannelKind::Pushover => write!(f, "pushover"),
            ChannelKind::Ntfy => write!(f, "ntfy"),
        }
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "discord" => Ok(ChannelKind::Discord),
            "webhook" => Ok(ChannelKind::Webhook),
            "pushover" => Ok(ChannelKind::Pushover),
            "ntfy" => Ok(ChannelKind::Ntfy),
            _ => Err(format!("Invalid channel kind: {}", s)),
        }
    }
}

/// A delivery target for violation notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub kind: ChannelKind,
    pub enabled: bool,
    #[serde(default)]
    pub config_json: serde_json::Value,
}

/// One detected rule violation. `session_key` is set when a live stream
/// caused the violation and is the dedup identity for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub user_name: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
    /// Confidence in [0, 100].
    pub confidence: u8,
    pub occurred_at: DateTime<Utc>,
    pub session_key: Option<SessionKey>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_penalties() {
        assert_eq!(Severity::Critical.trust_penalty(), 20);
        assert_eq!(Severity::Warning.trust_penalty(), 10);
        assert_eq!(Severity::Info.trust_penalty(), 5);
    }

    #[test]
    fn rule_kind_round_trip() {
        for kind in [
            RuleKind::Concurrent,
            RuleKind::GeoRestriction,
            RuleKind::ImpossibleTravel,
            RuleKind::SimultaneousLocations,
            RuleKind::DeviceVelocity,
            RuleKind::IspVelocity,
            RuleKind::NewDevice,
            RuleKind::NewLocation,
        ] {
            assert_eq!(kind.to_string().parse::<RuleKind>().ok(), Some(kind));
        }
    }
}
