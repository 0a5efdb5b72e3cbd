use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Payload encoding for published telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// JSON (default, readable with any Zenoh tool).
    #[default]
    Json,

    /// CBOR (compact binary).
    Cbor,
}

impl Format {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Cbor => "application/cbor",
        }
    }
}

/// Encode a value to bytes using the specified format.
pub fn encode<T: Serialize>(value: &T, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => serde_json::to_vec(value).map_err(Error::from),
        Format::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(value, &mut buf)?;
            Ok(buf)
        }
    }
}

/// Decode bytes to a value using the specified format.
pub fn decode<T: DeserializeOwned>(data: &[u8], format: Format) -> Result<T> {
    match format {
        Format::Json => serde_json::from_slice(data).map_err(Error::from),
        Format::Cbor => ciborium::from_reader(data).map_err(|e| Error::Cbor(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{MeterReading, Unit};

    #[test]
    fn test_cbor_keeps_unit_symbol() {
        let reading = MeterReading::new("main", "frequency", 50.01, Unit::Hertz);

        let encoded = encode(&reading, Format::Cbor).unwrap();
        let decoded: MeterReading = decode(&encoded, Format::Cbor).unwrap();

        assert_eq!(decoded.unit, Unit::Hertz);
        assert_eq!(decoded.channel, "frequency");
        assert_eq!(decoded.value, 50.01);
    }

    #[test]
    fn test_json_payload_shape() {
        let reading = MeterReading::new("main", "active_power", -1200.0, Unit::Watt)
            .with_timestamp(42);

        let encoded = encode(&reading, Format::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(value["unit"], "W");
        assert_eq!(value["value"], -1200.0);
        assert_eq!(value["timestamp"], 42);
        assert!(value.get("labels").is_none());
    }

    #[test]
    fn test_mime_types() {
        assert_eq!(Format::Json.mime_type(), "application/json");
        assert_eq!(Format::Cbor.mime_type(), "application/cbor");
    }

    #[test]
    fn test_cbor_is_smaller() {
        let reading = MeterReading::new("main", "phase_b/current", 4.25, Unit::Ampere);

        let json = encode(&reading, Format::Json).unwrap();
        let cbor = encode(&reading, Format::Cbor).unwrap();

        assert!(cbor.len() < json.len());
    }
}
