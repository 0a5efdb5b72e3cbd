//! Per-meter failure tracking and availability.

use jsy_common::{DeviceStatus, MeterLiveness, current_timestamp_millis};

/// Default number of consecutive failures tolerated before a meter is
/// reported unavailable.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Availability change caused by a poll outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    BecameAvailable,
    BecameUnavailable,
}

/// Health of one meter instance.
///
/// A meter starts unavailable and becomes available on its first successful
/// poll. It becomes unavailable again once the consecutive failure count
/// exceeds the threshold.
#[derive(Debug, Clone)]
pub struct HealthState {
    threshold: u32,
    consecutive_failures: u32,
    available: bool,
    ever_succeeded: bool,
    last_seen: i64,
    last_error: Option<String>,
}

impl HealthState {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive_failures: 0,
            available: false,
            ever_succeeded: false,
            last_seen: 0,
            last_error: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn record_success(&mut self) -> Transition {
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_seen = current_timestamp_millis();
        self.ever_succeeded = true;

        if self.available {
            Transition::Unchanged
        } else {
            self.available = true;
            Transition::BecameAvailable
        }
    }

    pub fn record_failure(&mut self, error: impl Into<String>) -> Transition {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.into());

        if self.available && self.consecutive_failures > self.threshold {
            self.available = false;
            Transition::BecameUnavailable
        } else {
            Transition::Unchanged
        }
    }

    pub fn status(&self) -> DeviceStatus {
        match (self.ever_succeeded, self.available, self.consecutive_failures) {
            (false, _, _) => DeviceStatus::Unknown,
            (true, false, _) => DeviceStatus::Offline,
            (true, true, 0) => DeviceStatus::Online,
            (true, true, _) => DeviceStatus::Degraded,
        }
    }

    /// Availability record for publishing.
    pub fn liveness(&self, meter: &str) -> MeterLiveness {
        MeterLiveness {
            meter: meter.to_string(),
            available: self.available,
            status: self.status(),
            last_seen: self.last_seen,
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error.clone(),
            timestamp: current_timestamp_millis(),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_unknown_and_unavailable() {
        let health = HealthState::default();
        assert!(!health.is_available());
        assert_eq!(health.status(), DeviceStatus::Unknown);
    }

    #[test]
    fn test_first_success_makes_available() {
        let mut health = HealthState::default();
        assert_eq!(health.record_success(), Transition::BecameAvailable);
        assert_eq!(health.record_success(), Transition::Unchanged);
        assert_eq!(health.status(), DeviceStatus::Online);
    }

    #[test]
    fn test_unavailable_only_after_threshold_exceeded() {
        let mut health = HealthState::new(3);
        health.record_success();

        for _ in 0..3 {
            assert_eq!(health.record_failure("timeout"), Transition::Unchanged);
            assert!(health.is_available());
            assert_eq!(health.status(), DeviceStatus::Degraded);
        }

        assert_eq!(health.record_failure("timeout"), Transition::BecameUnavailable);
        assert!(!health.is_available());
        assert_eq!(health.status(), DeviceStatus::Offline);
        assert_eq!(health.consecutive_failures(), 4);

        assert_eq!(health.record_failure("timeout"), Transition::Unchanged);
        assert_eq!(health.consecutive_failures(), 5);
    }

    #[test]
    fn test_success_resets_and_restores() {
        let mut health = HealthState::new(1);
        health.record_success();
        health.record_failure("crc");
        health.record_failure("crc");
        assert!(!health.is_available());

        assert_eq!(health.record_success(), Transition::BecameAvailable);
        assert_eq!(health.consecutive_failures(), 0);
        assert!(health.last_error().is_none());
    }

    #[test]
    fn test_failures_before_first_success_stay_unknown() {
        let mut health = HealthState::new(1);
        health.record_failure("timeout");
        health.record_failure("timeout");

        let liveness = health.liveness("m1");
        assert_eq!(liveness.status, DeviceStatus::Unknown);
        assert!(!liveness.available);
        assert_eq!(liveness.consecutive_failures, 2);
        assert_eq!(liveness.last_error.as_deref(), Some("timeout"));
    }
}
