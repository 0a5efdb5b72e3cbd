use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// A single measurement published for one meter channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterReading {
    /// Unix epoch milliseconds when the value was decoded.
    pub timestamp: i64,

    /// Meter name from configuration (e.g. "main-panel").
    pub meter: String,

    /// Channel path (e.g. "phase_a/voltage", "frequency").
    pub channel: String,

    /// Physical value after scaling.
    pub value: f64,

    /// Unit of measurement.
    pub unit: Unit,

    /// Additional metadata (device class, accuracy, display name).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl MeterReading {
    /// Create a reading stamped with the current time.
    pub fn new(
        meter: impl Into<String>,
        channel: impl Into<String>,
        value: f64,
        unit: Unit,
    ) -> Self {
        Self {
            timestamp: current_timestamp_millis(),
            meter: meter.into(),
            channel: channel.into(),
            value,
            unit,
            labels: HashMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Units produced by the JSY register map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "V")]
    Volt,
    #[serde(rename = "A")]
    Ampere,
    #[serde(rename = "W")]
    Watt,
    #[serde(rename = "kWh")]
    KilowattHour,
    #[serde(rename = "Hz")]
    Hertz,
    /// Free-form unit set through `unit_of_measurement`.
    #[serde(untagged)]
    Custom(String),
}

impl Unit {
    pub fn symbol(&self) -> &str {
        match self {
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Watt => "W",
            Unit::KilowattHour => "kWh",
            Unit::Hertz => "Hz",
            Unit::Custom(s) => s,
        }
    }

    /// Parse a unit symbol, falling back to [`Unit::Custom`].
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol {
            "V" => Unit::Volt,
            "A" => Unit::Ampere,
            "W" => Unit::Watt,
            "kWh" => Unit::KilowattHour,
            "Hz" => Unit::Hertz,
            other => Unit::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// What kind of physical quantity a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Voltage,
    Current,
    Power,
    Energy,
    Frequency,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Voltage => "voltage",
            DeviceClass::Current => "current",
            DeviceClass::Power => "power",
            DeviceClass::Energy => "energy",
            DeviceClass::Frequency => "frequency",
        }
    }
}

/// How consumers should aggregate a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    /// Instantaneous value that moves up and down.
    Measurement,
    /// Monotonic counter (energy totals).
    TotalIncreasing,
}

impl StateClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateClass::Measurement => "measurement",
            StateClass::TotalIncreasing => "total_increasing",
        }
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if the system clock is before the epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
