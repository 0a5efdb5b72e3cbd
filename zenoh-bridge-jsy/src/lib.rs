//! Zenoh bridge for JSY energy meters.
//!
//! This bridge polls JSY-MK-333 three-phase meters over Modbus RTU and
//! publishes decoded measurements to Zenoh. Meters sharing an RS-485 bus
//! take turns on it; a meter that keeps failing is reported unavailable
//! until it answers again.
//!
//! # Key Expressions
//!
//! ```text
//! jsy/<meter>/<channel>                  # MeterReading
//! jsy/@/meters/<meter>/liveness          # MeterLiveness
//! jsy/@/status                           # BridgeStatus
//! ```
//!
//! Where `<channel>` is `phase_a/voltage`, `phase_b/active_power`,
//! `forward_active_energy`, `frequency`, and so on.

pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod health;
pub mod poller;
pub mod publisher;
pub mod registers;
pub mod rtu;
