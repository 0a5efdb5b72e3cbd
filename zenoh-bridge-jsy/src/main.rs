//! Zenoh bridge for JSY energy meters.
//!
//! Polls JSY meters over Modbus RTU and publishes readings to Zenoh.

use anyhow::{Context, Result};
use clap::Parser;
use jsy_common::{BridgeStatus, Format, KeyExprBuilder, LoggingConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use zenoh_bridge_jsy::client::{ModbusClient, SharedBus, meter_timeout, open_serial};
use zenoh_bridge_jsy::config::JsyBridgeConfig;
use zenoh_bridge_jsy::poller::MeterPoller;
use zenoh_bridge_jsy::publisher::ZenohSink;

const BRIDGE_NAME: &str = "jsy";

/// Zenoh bridge for JSY energy meters (Modbus RTU).
#[derive(Parser, Debug)]
#[command(name = "zenoh-bridge-jsy")]
#[command(about = "Polls JSY energy meters and publishes to Zenoh")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "jsy.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = JsyBridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    jsy_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting zenoh-bridge-jsy");
    info!("Loaded configuration from {:?}", args.config);

    // Buses are opened before connecting to Zenoh.
    let mut buses = HashMap::new();
    for bus in &config.jsy.buses {
        let port = open_serial(bus)
            .with_context(|| format!("Failed to open serial port {} for bus '{}'", bus.port, bus.name))?;
        info!(bus = %bus.name, port = %bus.port, baud_rate = bus.baud_rate, "Opened serial bus");
        buses.insert(bus.name.clone(), SharedBus::new(bus.name.as_str(), bus.baud_rate, port));
    }

    info!("Connecting to Zenoh...");
    let session = jsy_common::connect(&config.zenoh)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Zenoh: {}", e))?;
    info!("Connected to Zenoh");

    let keys = KeyExprBuilder::new(config.jsy.key_prefix.clone());
    let sink = ZenohSink::new(session.clone(), keys.clone(), config.jsy.serialization);

    let mut tasks = Vec::new();
    for meter in &config.jsy.meters {
        let (Some(bus), Some(bus_config)) = (buses.get(&meter.bus), config.bus(&meter.bus)) else {
            anyhow::bail!("Meter '{}' references unknown bus '{}'", meter.name, meter.bus);
        };

        let client = ModbusClient::new(bus.clone(), meter.function, meter_timeout(meter, bus_config));
        let poller = Arc::new(MeterPoller::new(meter, client, sink.clone()));
        info!(meter = %meter.name, keys = %keys.meter_wildcard(&meter.name), "Publishing meter");
        tasks.push(tokio::spawn(poller.run()));
    }

    info!(
        "JSY bridge running with {} meter(s) under '{}'",
        config.jsy.meters.len(),
        keys.prefix()
    );

    let status_key = keys.status();
    let meters = config.jsy.meters.iter().map(|m| m.name.clone()).collect();
    let status = BridgeStatus::running(BRIDGE_NAME, env!("CARGO_PKG_VERSION"), meters);
    match serde_json::to_vec(&status) {
        Ok(payload) => {
            if let Err(e) = session
                .put(&status_key, payload)
                .encoding(Format::Json.mime_type())
                .await
            {
                error!("Failed to publish bridge status: {}", e);
            }
        }
        Err(e) => error!("Failed to encode bridge status: {}", e),
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    for task in tasks {
        task.abort();
    }

    let status = BridgeStatus::offline(BRIDGE_NAME, env!("CARGO_PKG_VERSION"));
    if let Ok(payload) = serde_json::to_vec(&status) {
        let _ = session
            .put(&status_key, payload)
            .encoding(Format::Json.mime_type())
            .await;
    }

    session
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;
    info!("JSY bridge stopped");

    Ok(())
}
