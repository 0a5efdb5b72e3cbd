//! Meter availability types shared between the bridge and its consumers.

use serde::{Deserialize, Serialize};

/// Meter availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Last poll succeeded.
    Online,
    /// Failure threshold exceeded; values are stale.
    Offline,
    /// Recent polls failed but the threshold is not yet exceeded.
    Degraded,
    /// Never polled successfully.
    #[default]
    Unknown,
}

impl DeviceStatus {
    /// Whether published values from a meter in this state can be trusted.
    pub fn is_available(&self) -> bool {
        matches!(self, DeviceStatus::Online | DeviceStatus::Degraded)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Degraded => write!(f, "degraded"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Availability record published whenever a meter's availability flips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterLiveness {
    /// Meter name.
    pub meter: String,
    /// Availability flag consumers should honor.
    pub available: bool,
    /// Detailed status.
    pub status: DeviceStatus,
    /// Last successful poll (millis since epoch), 0 if never.
    pub last_seen: i64,
    /// Consecutive failed polls.
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When this record was produced.
    pub timestamp: i64,
}

/// Bridge lifecycle status published at `<prefix>/@/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub bridge: String,
    pub version: String,
    /// "running" or "offline".
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meters: Vec<String>,
}

impl BridgeStatus {
    pub fn running(bridge: impl Into<String>, version: impl Into<String>, meters: Vec<String>) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status: "running".to_string(),
            meters,
        }
    }

    pub fn offline(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status: "offline".to_string(),
            meters: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_status_default() {
        assert_eq!(DeviceStatus::default(), DeviceStatus::Unknown);
        assert!(!DeviceStatus::Unknown.is_available());
        assert!(DeviceStatus::Degraded.is_available());
        assert!(!DeviceStatus::Offline.is_available());
    }

    #[test]
    fn test_liveness_deserialize() {
        let json = r#"{
            "meter": "main-panel",
            "available": false,
            "status": "offline",
            "last_seen": 1703500000000,
            "consecutive_failures": 4,
            "last_error": "Timeout after 500ms",
            "timestamp": 1703500040000
        }"#;

        let liveness: MeterLiveness = serde_json::from_str(json).unwrap();
        assert_eq!(liveness.meter, "main-panel");
        assert_eq!(liveness.status, DeviceStatus::Offline);
        assert_eq!(liveness.consecutive_failures, 4);
    }

    #[test]
    fn test_offline_status_omits_meters() {
        let status = BridgeStatus::offline("jsy", "0.2.0");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "offline");
        assert!(json.get("meters").is_none());
    }
}
