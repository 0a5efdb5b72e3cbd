//! Raw register payload to physical values.

use crate::error::DecodeError;
use crate::registers::{Channel, RegisterField, RegisterMap, Signedness, Width};

/// Decoded values of one poll, in register map order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readings(Vec<(Channel, f64)>);

impl Readings {
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.0
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, f64)> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Decode a register image that starts at the map's start register.
///
/// `raw` must be at least [`RegisterMap::span_bytes`] long.
pub fn decode(raw: &[u8], map: &RegisterMap) -> Result<Readings, DecodeError> {
    let required = map.span_bytes();
    if raw.len() < required {
        return Err(DecodeError {
            required,
            actual: raw.len(),
        });
    }

    let direction = map
        .direction_offset
        .map(|offset| read_u16(raw, offset))
        .unwrap_or(0);

    let values = map
        .fields
        .iter()
        .map(|field| (field.channel, field_value(raw, field, direction)))
        .collect();

    Ok(Readings(values))
}

fn field_value(raw: &[u8], field: &RegisterField, direction: u16) -> f64 {
    let raw_value = match (field.width, field.signedness) {
        (Width::U16, Signedness::Unsigned) => read_u16(raw, field.start_offset) as f64,
        (Width::U16, Signedness::Signed) => read_u16(raw, field.start_offset) as i16 as f64,
        (Width::U32, Signedness::Unsigned) => read_u32(raw, field.start_offset) as f64,
        (Width::U32, Signedness::Signed) => read_u32(raw, field.start_offset) as i32 as f64,
    };

    let value = raw_value * field.scale_factor;

    match field.direction_bit {
        Some(bit) if direction & (1 << bit) != 0 => -value,
        _ => value,
    }
}

fn read_u16(raw: &[u8], offset: u16) -> u16 {
    let i = offset as usize * 2;
    u16::from_be_bytes([raw[i], raw[i + 1]])
}

fn read_u32(raw: &[u8], offset: u16) -> u32 {
    let i = offset as usize * 2;
    u32::from_be_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]])
}
