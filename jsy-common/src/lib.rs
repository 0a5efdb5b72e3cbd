//! Shared types and plumbing for the JSY meter bridge.
//!
//! - [`telemetry`] - published measurement model (`MeterReading`, `Unit`)
//! - [`health`] - meter availability records
//! - [`serialization`] - JSON/CBOR payload encoding
//! - [`config`] - JSON5 configuration loading
//! - [`session`] - Zenoh session setup
//! - [`keyexpr`] - key expression builders

pub mod config;
pub mod error;
pub mod health;
pub mod keyexpr;
pub mod serialization;
pub mod session;
pub mod telemetry;

pub use config::{LogFormat, LoggingConfig, ZenohConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use health::{BridgeStatus, DeviceStatus, MeterLiveness};
pub use keyexpr::{KEY_PREFIX, KeyExprBuilder, ParsedKeyExpr, parse_reading_key};
pub use serialization::{Format, decode, encode};
pub use session::connect;
pub use telemetry::{DeviceClass, MeterReading, StateClass, Unit, current_timestamp_millis};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level` when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };

    result.map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))
}
