//! Configuration for the JSY bridge.

use jsy_common::{Format, KEY_PREFIX, LoggingConfig, Unit, ZenohConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::health::DEFAULT_FAILURE_THRESHOLD;
use crate::registers::{Channel, ChannelSet, Phase, ReadFunction};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsyBridgeConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Meter and bus settings
    pub jsy: JsyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsyConfig {
    /// Key expression prefix (default: "jsy")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Payload encoding for published readings
    #[serde(default)]
    pub serialization: Format,

    /// RS-485 buses; meters reference them by name
    pub buses: Vec<BusConfig>,

    /// Meters to poll
    pub meters: Vec<MeterConfig>,
}

fn default_key_prefix() -> String {
    KEY_PREFIX.to_string()
}

/// Serial line settings of one RS-485 bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub name: String,
    /// Serial port path (e.g. "/dev/ttyUSB0" or "COM3")
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// "none", "even", or "odd"
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

/// One JSY meter on a bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Meter name (used in key expressions)
    pub name: String,

    /// Name of the bus the meter is wired to
    pub bus: String,

    /// Modbus slave address (1-247)
    #[serde(default = "default_address")]
    pub address: u8,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Response timeout; derived from the baud rate when unset
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Register read function used by this firmware revision
    #[serde(default)]
    pub function: ReadFunction,

    /// Consecutive failures tolerated before the meter is marked unavailable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default)]
    pub phase_a: Option<PhaseSensors>,
    #[serde(default)]
    pub phase_b: Option<PhaseSensors>,
    #[serde(default)]
    pub phase_c: Option<PhaseSensors>,

    #[serde(default)]
    pub frequency: Option<SensorConfig>,
    /// Total active power
    #[serde(default)]
    pub active_power: Option<SensorConfig>,
    #[serde(default)]
    pub forward_active_energy: Option<SensorConfig>,
    #[serde(default)]
    pub backward_active_energy: Option<SensorConfig>,
}

fn default_address() -> u8 {
    0x01
}

fn default_poll_interval() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

/// Per-phase sensors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseSensors {
    #[serde(default)]
    pub voltage: Option<SensorConfig>,
    #[serde(default)]
    pub current: Option<SensorConfig>,
    #[serde(default)]
    pub active_power: Option<SensorConfig>,
    #[serde(default)]
    pub forward_active_energy: Option<SensorConfig>,
    #[serde(default)]
    pub backward_active_energy: Option<SensorConfig>,
}

/// Optional overrides for one published channel. `{}` enables it with
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    /// Display name carried as a label
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unit_of_measurement: Option<String>,
    #[serde(default)]
    pub accuracy_decimals: Option<u8>,
    /// Smallest change that triggers a notification
    #[serde(default)]
    pub min_delta: Option<f64>,
}

/// Resolved metadata of an enabled channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub channel: Channel,
    pub name: Option<String>,
    pub unit: Unit,
    pub accuracy_decimals: u8,
    pub min_delta: f64,
}

impl ChannelSpec {
    /// Apply sensor overrides on top of the channel defaults.
    ///
    /// Energy counters publish every sample by default; continuous values
    /// ignore changes smaller than half of their last displayed decimal.
    pub fn resolve(channel: Channel, sensor: &SensorConfig) -> Self {
        let accuracy_decimals = sensor
            .accuracy_decimals
            .unwrap_or_else(|| channel.default_accuracy_decimals());

        let default_delta = match channel.state_class() {
            jsy_common::StateClass::TotalIncreasing => 0.0,
            jsy_common::StateClass::Measurement => 0.5 * 10f64.powi(-(accuracy_decimals as i32)),
        };

        Self {
            channel,
            name: sensor.name.clone(),
            unit: sensor
                .unit_of_measurement
                .as_deref()
                .map(Unit::from_symbol)
                .unwrap_or_else(|| channel.default_unit()),
            accuracy_decimals,
            min_delta: sensor.min_delta.unwrap_or(default_delta),
        }
    }
}

impl JsyBridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: JsyBridgeConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        if self.jsy.buses.is_empty() {
            return invalid("At least one bus must be configured".to_string());
        }
        if self.jsy.meters.is_empty() {
            return invalid("At least one meter must be configured".to_string());
        }

        let mut bus_names = HashSet::new();
        for bus in &self.jsy.buses {
            if bus.name.is_empty() {
                return invalid("Bus name cannot be empty".to_string());
            }
            if !bus_names.insert(bus.name.as_str()) {
                return invalid(format!("Duplicate bus name '{}'", bus.name));
            }
            bus.validate()?;
        }

        let mut meter_names = HashSet::new();
        let mut addresses = HashSet::new();
        for meter in &self.jsy.meters {
            if meter.name.is_empty() || meter.name.contains(['/', '*', '$', '#', '?']) {
                return invalid(format!(
                    "Meter name '{}' must be non-empty and usable in a key expression",
                    meter.name
                ));
            }
            if !meter_names.insert(meter.name.as_str()) {
                return invalid(format!("Duplicate meter name '{}'", meter.name));
            }
            if !bus_names.contains(meter.bus.as_str()) {
                return invalid(format!(
                    "Meter '{}': unknown bus '{}'",
                    meter.name, meter.bus
                ));
            }
            if !addresses.insert((meter.bus.as_str(), meter.address)) {
                return invalid(format!(
                    "Meter '{}': address {} already used on bus '{}'",
                    meter.name, meter.address, meter.bus
                ));
            }
            meter.validate()?;
        }

        Ok(())
    }

    pub fn bus(&self, name: &str) -> Option<&BusConfig> {
        self.jsy.buses.iter().find(|b| b.name == name)
    }
}

impl BusConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| {
            Err(ConfigError::Validation(format!(
                "Bus '{}': {}",
                self.name, msg
            )))
        };

        if self.port.is_empty() {
            return fail("port cannot be empty");
        }
        if self.baud_rate == 0 {
            return fail("baud_rate must be positive");
        }
        if !(5..=8).contains(&self.data_bits) {
            return fail("data_bits must be 5-8");
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return fail("stop_bits must be 1 or 2");
        }
        match self.parity.to_lowercase().as_str() {
            "none" | "even" | "odd" => Ok(()),
            _ => fail("invalid parity (use none, even, or odd)"),
        }
    }
}

impl MeterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| {
            Err(ConfigError::Validation(format!(
                "Meter '{}': {}",
                self.name, msg
            )))
        };

        if !(1..=247).contains(&self.address) {
            return fail(format!("address {} must be 1-247", self.address));
        }
        if self.poll_interval_secs == 0 {
            return fail("poll_interval_secs must be positive".to_string());
        }
        if self.timeout_ms == Some(0) {
            return fail("timeout_ms must be positive".to_string());
        }
        if self.failure_threshold == 0 {
            return fail("failure_threshold must be at least 1".to_string());
        }

        let sensors = self.sensors();
        if sensors.is_empty() {
            return fail("no sensors enabled".to_string());
        }
        for (channel, sensor) in sensors {
            if let Some(delta) = sensor.min_delta {
                if !(delta.is_finite() && delta >= 0.0) {
                    return fail(format!("{}: min_delta must be >= 0", channel));
                }
            }
            if sensor.accuracy_decimals.is_some_and(|d| d > 6) {
                return fail(format!("{}: accuracy_decimals must be 0-6", channel));
            }
        }

        Ok(())
    }

    /// Enabled channels with their sensor overrides, in table order.
    pub fn sensors(&self) -> Vec<(Channel, &SensorConfig)> {
        let mut sensors = Vec::new();

        let phases = [
            (Phase::A, &self.phase_a),
            (Phase::B, &self.phase_b),
            (Phase::C, &self.phase_c),
        ];
        for (phase, sensors_cfg) in phases {
            let Some(p) = sensors_cfg else { continue };
            let entries = [
                (Channel::Voltage(phase), &p.voltage),
                (Channel::Current(phase), &p.current),
                (Channel::ActivePower(phase), &p.active_power),
                (Channel::ForwardActiveEnergy(phase), &p.forward_active_energy),
                (Channel::BackwardActiveEnergy(phase), &p.backward_active_energy),
            ];
            for (channel, sensor) in entries {
                if let Some(sensor) = sensor {
                    sensors.push((channel, sensor));
                }
            }
        }

        let totals = [
            (Channel::TotalActivePower, &self.active_power),
            (Channel::TotalForwardActiveEnergy, &self.forward_active_energy),
            (Channel::TotalBackwardActiveEnergy, &self.backward_active_energy),
            (Channel::Frequency, &self.frequency),
        ];
        for (channel, sensor) in totals {
            if let Some(sensor) = sensor {
                sensors.push((channel, sensor));
            }
        }

        sensors.sort_by_key(|(channel, _)| channel.index());
        sensors
    }

    pub fn channel_set(&self) -> ChannelSet {
        self.sensors().into_iter().map(|(c, _)| c).collect()
    }

    pub fn channel_specs(&self) -> Vec<ChannelSpec> {
        self.sensors()
            .into_iter()
            .map(|(channel, sensor)| ChannelSpec::resolve(channel, sensor))
            .collect()
    }
}
