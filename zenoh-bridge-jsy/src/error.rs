//! Error types for meter polling.

use std::time::Duration;

use thiserror::Error;

/// Modbus exception code returned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Other(u8),
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::ServerDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::ServerDeviceBusy,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailedToRespond,
            other => ExceptionCode::Other(other),
        }
    }
}

impl ExceptionCode {
    pub fn code(&self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::ServerDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::ServerDeviceBusy => 0x06,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetFailedToRespond => 0x0B,
            ExceptionCode::Other(code) => *code,
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X} ({:?})", self.code(), self)
    }
}

/// Failure of a single request/response exchange on the bus.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Short read: received {received} of {expected} bytes")]
    ShortRead { expected: usize, received: usize },

    #[error("CRC mismatch: frame carries 0x{received:04X}, computed 0x{computed:04X}")]
    CrcMismatch { received: u16, computed: u16 },

    #[error("Device exception {0}")]
    DeviceException(ExceptionCode),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The register payload does not cover the map being decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Payload too short: {actual} bytes, register map needs {required}")]
pub struct DecodeError {
    pub required: usize,
    pub actual: usize,
}

/// Why a poll cycle produced no readings.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl PollError {
    /// Short classification used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PollError::Transaction(TransactionError::Timeout(_)) => "timeout",
            PollError::Transaction(TransactionError::ShortRead { .. }) => "short_read",
            PollError::Transaction(TransactionError::CrcMismatch { .. }) => "crc_mismatch",
            PollError::Transaction(TransactionError::DeviceException(_)) => "device_exception",
            PollError::Transaction(TransactionError::UnexpectedResponse(_)) => {
                "unexpected_response"
            }
            PollError::Transaction(TransactionError::Io(_)) => "io",
            PollError::Decode(_) => "decode",
        }
    }
}
