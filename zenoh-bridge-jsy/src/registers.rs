//! Static JSY-MK-333 register layout.
//!
//! The meter exposes every measurement in one block of 0x44 holding registers
//! starting at 0x0100. Field offsets below are register offsets relative to
//! the start of that block.

use jsy_common::{DeviceClass, StateClass, Unit};
use serde::{Deserialize, Serialize};

/// First register of the measurement block.
pub const BLOCK_START: u16 = 0x0100;

/// Number of registers in the measurement block.
pub const BLOCK_REGISTERS: u16 = 0x44;

/// Offset of the power direction bitmask (bit0..2 = phases, bit3 = total).
pub const DIRECTION_OFFSET: u16 = 0x32;

/// Largest register count a single read request may ask for.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Number of channels defined by the register map.
pub const CHANNEL_COUNT: usize = 19;

const UNIT_NO_DEC: f64 = 1.0;
const UNIT_TWO_DEC: f64 = 0.01;

/// Read function code, fixed per meter firmware revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadFunction {
    /// 0x03 Read Holding Registers.
    #[default]
    Holding,
    /// 0x04 Read Input Registers.
    Input,
}

impl ReadFunction {
    pub fn code(&self) -> u8 {
        match self {
            ReadFunction::Holding => 0x03,
            ReadFunction::Input => 0x04,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadFunction::Holding => "holding",
            ReadFunction::Input => "input",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    A,
    B,
    C,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

    pub fn index(&self) -> u16 {
        match self {
            Phase::A => 0,
            Phase::B => 1,
            Phase::C => 2,
        }
    }
}

/// One published measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Voltage(Phase),
    Current(Phase),
    ActivePower(Phase),
    ForwardActiveEnergy(Phase),
    BackwardActiveEnergy(Phase),
    TotalActivePower,
    TotalForwardActiveEnergy,
    TotalBackwardActiveEnergy,
    Frequency,
}

impl Channel {
    /// Every channel, in table order (`ALL[c.index()] == c`).
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::Voltage(Phase::A),
        Channel::Voltage(Phase::B),
        Channel::Voltage(Phase::C),
        Channel::Current(Phase::A),
        Channel::Current(Phase::B),
        Channel::Current(Phase::C),
        Channel::ActivePower(Phase::A),
        Channel::ActivePower(Phase::B),
        Channel::ActivePower(Phase::C),
        Channel::ForwardActiveEnergy(Phase::A),
        Channel::ForwardActiveEnergy(Phase::B),
        Channel::ForwardActiveEnergy(Phase::C),
        Channel::BackwardActiveEnergy(Phase::A),
        Channel::BackwardActiveEnergy(Phase::B),
        Channel::BackwardActiveEnergy(Phase::C),
        Channel::TotalActivePower,
        Channel::TotalForwardActiveEnergy,
        Channel::TotalBackwardActiveEnergy,
        Channel::Frequency,
    ];

    /// Position of this channel in per-meter tables.
    pub fn index(&self) -> usize {
        let phased = |base: usize, phase: &Phase| base + phase.index() as usize;
        match self {
            Channel::Voltage(p) => phased(0, p),
            Channel::Current(p) => phased(3, p),
            Channel::ActivePower(p) => phased(6, p),
            Channel::ForwardActiveEnergy(p) => phased(9, p),
            Channel::BackwardActiveEnergy(p) => phased(12, p),
            Channel::TotalActivePower => 15,
            Channel::TotalForwardActiveEnergy => 16,
            Channel::TotalBackwardActiveEnergy => 17,
            Channel::Frequency => 18,
        }
    }

    /// Key expression suffix, e.g. `phase_b/current`.
    pub fn path(&self) -> &'static str {
        use Phase::*;
        match self {
            Channel::Voltage(A) => "phase_a/voltage",
            Channel::Voltage(B) => "phase_b/voltage",
            Channel::Voltage(C) => "phase_c/voltage",
            Channel::Current(A) => "phase_a/current",
            Channel::Current(B) => "phase_b/current",
            Channel::Current(C) => "phase_c/current",
            Channel::ActivePower(A) => "phase_a/active_power",
            Channel::ActivePower(B) => "phase_b/active_power",
            Channel::ActivePower(C) => "phase_c/active_power",
            Channel::ForwardActiveEnergy(A) => "phase_a/forward_active_energy",
            Channel::ForwardActiveEnergy(B) => "phase_b/forward_active_energy",
            Channel::ForwardActiveEnergy(C) => "phase_c/forward_active_energy",
            Channel::BackwardActiveEnergy(A) => "phase_a/backward_active_energy",
            Channel::BackwardActiveEnergy(B) => "phase_b/backward_active_energy",
            Channel::BackwardActiveEnergy(C) => "phase_c/backward_active_energy",
            Channel::TotalActivePower => "active_power",
            Channel::TotalForwardActiveEnergy => "forward_active_energy",
            Channel::TotalBackwardActiveEnergy => "backward_active_energy",
            Channel::Frequency => "frequency",
        }
    }

    pub fn device_class(&self) -> DeviceClass {
        match self {
            Channel::Voltage(_) => DeviceClass::Voltage,
            Channel::Current(_) => DeviceClass::Current,
            Channel::ActivePower(_) | Channel::TotalActivePower => DeviceClass::Power,
            Channel::ForwardActiveEnergy(_)
            | Channel::BackwardActiveEnergy(_)
            | Channel::TotalForwardActiveEnergy
            | Channel::TotalBackwardActiveEnergy => DeviceClass::Energy,
            Channel::Frequency => DeviceClass::Frequency,
        }
    }

    pub fn state_class(&self) -> StateClass {
        match self.device_class() {
            DeviceClass::Energy => StateClass::TotalIncreasing,
            _ => StateClass::Measurement,
        }
    }

    /// Decimals the meter actually resolves for this channel.
    pub fn default_accuracy_decimals(&self) -> u8 {
        match self.device_class() {
            DeviceClass::Power => 0,
            _ => 2,
        }
    }

    pub fn default_unit(&self) -> Unit {
        match self.device_class() {
            DeviceClass::Voltage => Unit::Volt,
            DeviceClass::Current => Unit::Ampere,
            DeviceClass::Power => Unit::Watt,
            DeviceClass::Energy => Unit::KilowattHour,
            DeviceClass::Frequency => Unit::Hertz,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

/// Set of enabled channels, computed once from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChannelSet(u32);

impl ChannelSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self((1u32 << CHANNEL_COUNT as u32) - 1)
    }

    pub fn insert(&mut self, channel: Channel) {
        self.0 |= 1 << channel.index();
    }

    pub fn with(mut self, channel: Channel) -> Self {
        self.insert(channel);
        self
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.0 & (1 << channel.index()) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Channel> + use<> {
        let set = *self;
        Channel::ALL.into_iter().filter(move |c| set.contains(*c))
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = Channel>>(iter: I) -> Self {
        let mut set = ChannelSet::empty();
        for channel in iter {
            set.insert(channel);
        }
        set
    }
}

/// Register width of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// One register.
    U16,
    /// Two registers, high word first.
    U32,
}

impl Width {
    pub fn register_count(&self) -> u16 {
        match self {
            Width::U16 => 1,
            Width::U32 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signedness {
    Unsigned,
    Signed,
}

/// Location and scaling of one measurement inside the register block.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterField {
    pub channel: Channel,
    /// Register offset from the map's start register.
    pub start_offset: u16,
    pub width: Width,
    pub signedness: Signedness,
    /// Multiplier from raw count to physical value.
    pub scale_factor: f64,
    pub unit: Unit,
    /// Bit in the direction register that flips the sign of this value.
    pub direction_bit: Option<u8>,
}

impl RegisterField {
    fn unsigned(channel: Channel, start_offset: u16, width: Width, scale_factor: f64) -> Self {
        Self {
            channel,
            start_offset,
            width,
            signedness: Signedness::Unsigned,
            scale_factor,
            unit: channel.default_unit(),
            direction_bit: None,
        }
    }

    fn with_direction_bit(mut self, bit: u8) -> Self {
        self.direction_bit = Some(bit);
        self
    }

    pub fn register_count(&self) -> u16 {
        self.width.register_count()
    }

    /// One past the last register this field occupies.
    pub fn end_offset(&self) -> u16 {
        self.start_offset + self.register_count()
    }
}

/// A contiguous read covering part of the register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    /// Offset of the first register relative to the map start.
    pub offset: u16,
    pub count: u16,
}

/// Register layout of a meter instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterMap {
    pub function: ReadFunction,
    /// Absolute address of offset 0.
    pub start: u16,
    pub fields: Vec<RegisterField>,
    /// Offset of the power direction register, if any field needs it.
    pub direction_offset: Option<u16>,
}

impl RegisterMap {
    /// Full JSY-MK-333 layout (three phases plus totals and frequency).
    pub fn jsy_mk333(function: ReadFunction) -> Self {
        let mut fields = Vec::with_capacity(CHANNEL_COUNT);

        for phase in Phase::ALL {
            let i = phase.index();
            fields.push(RegisterField::unsigned(
                Channel::Voltage(phase),
                i,
                Width::U16,
                UNIT_TWO_DEC,
            ));
            fields.push(RegisterField::unsigned(
                Channel::Current(phase),
                i + 3,
                Width::U16,
                UNIT_TWO_DEC,
            ));
            fields.push(
                RegisterField::unsigned(Channel::ActivePower(phase), i + 6, Width::U16, UNIT_NO_DEC)
                    .with_direction_bit(i as u8),
            );
            fields.push(RegisterField::unsigned(
                Channel::ForwardActiveEnergy(phase),
                0x34 + i * 2,
                Width::U32,
                UNIT_TWO_DEC,
            ));
            fields.push(RegisterField::unsigned(
                Channel::BackwardActiveEnergy(phase),
                0x3C + i * 2,
                Width::U32,
                UNIT_TWO_DEC,
            ));
        }

        fields.push(
            RegisterField::unsigned(Channel::TotalActivePower, 0x09, Width::U32, UNIT_NO_DEC)
                .with_direction_bit(3),
        );
        fields.push(RegisterField::unsigned(
            Channel::TotalForwardActiveEnergy,
            0x3A,
            Width::U32,
            UNIT_TWO_DEC,
        ));
        fields.push(RegisterField::unsigned(
            Channel::TotalBackwardActiveEnergy,
            0x42,
            Width::U32,
            UNIT_TWO_DEC,
        ));
        fields.push(RegisterField::unsigned(
            Channel::Frequency,
            0x15,
            Width::U16,
            UNIT_TWO_DEC,
        ));

        Self {
            function,
            start: BLOCK_START,
            fields,
            direction_offset: Some(DIRECTION_OFFSET),
        }
    }

    /// Restrict the map to the enabled channels.
    ///
    /// The direction register is kept only when a selected field uses it.
    pub fn select(&self, channels: ChannelSet) -> Self {
        let fields: Vec<RegisterField> = self
            .fields
            .iter()
            .filter(|f| channels.contains(f.channel))
            .cloned()
            .collect();

        let needs_direction = fields.iter().any(|f| f.direction_bit.is_some());

        Self {
            function: self.function,
            start: self.start,
            fields,
            direction_offset: self.direction_offset.filter(|_| needs_direction),
        }
    }

    pub fn field(&self, channel: Channel) -> Option<&RegisterField> {
        self.fields.iter().find(|f| f.channel == channel)
    }

    pub fn channels(&self) -> ChannelSet {
        self.fields.iter().map(|f| f.channel).collect()
    }

    /// Number of registers from the map start to the end of the last needed
    /// register.
    pub fn span_registers(&self) -> u16 {
        self.needed_ranges()
            .iter()
            .map(|(_, end)| *end)
            .max()
            .unwrap_or(0)
    }

    /// Payload length the decoder needs.
    pub fn span_bytes(&self) -> usize {
        self.span_registers() as usize * 2
    }

    /// Reads needed to cover every field.
    ///
    /// A single block when the needed registers fit in one request, otherwise
    /// one block per run of needed registers, each capped at
    /// [`MAX_READ_REGISTERS`].
    pub fn request_blocks(&self) -> Vec<RegisterBlock> {
        let mut ranges = self.needed_ranges();
        ranges.sort_unstable();

        let mut blocks = Vec::new();
        let mut current: Option<(u16, u16)> = None;

        for (start, end) in ranges {
            current = match current {
                None => Some((start, end)),
                Some((b_start, b_end)) if end.max(b_end) - b_start <= MAX_READ_REGISTERS => {
                    Some((b_start, end.max(b_end)))
                }
                Some((b_start, b_end)) => {
                    push_chunked(&mut blocks, b_start, b_end);
                    Some((start.max(b_end), end.max(b_end)))
                }
            };
        }

        if let Some((b_start, b_end)) = current {
            push_chunked(&mut blocks, b_start, b_end);
        }

        blocks
    }

    fn needed_ranges(&self) -> Vec<(u16, u16)> {
        let mut ranges: Vec<(u16, u16)> = self
            .fields
            .iter()
            .map(|f| (f.start_offset, f.end_offset()))
            .collect();

        if let Some(offset) = self.direction_offset {
            ranges.push((offset, offset + 1));
        }

        ranges
    }
}

fn push_chunked(blocks: &mut Vec<RegisterBlock>, start: u16, end: u16) {
    let mut offset = start;
    while offset < end {
        let count = (end - offset).min(MAX_READ_REGISTERS);
        blocks.push(RegisterBlock { offset, count });
        offset += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_table_order() {
        for (i, channel) in Channel::ALL.iter().enumerate() {
            assert_eq!(channel.index(), i, "{channel}");
        }
    }

    #[test]
    fn test_full_map_matches_meter_block() {
        let map = RegisterMap::jsy_mk333(ReadFunction::Holding);

        assert_eq!(map.fields.len(), CHANNEL_COUNT);
        assert_eq!(map.span_registers(), BLOCK_REGISTERS);
        assert_eq!(
            map.request_blocks(),
            vec![RegisterBlock {
                offset: 0,
                count: BLOCK_REGISTERS
            }]
        );
    }

    #[test]
    fn test_field_offsets() {
        let map = RegisterMap::jsy_mk333(ReadFunction::Holding);
        let offset = |c| map.field(c).unwrap().start_offset;

        assert_eq!(offset(Channel::Voltage(Phase::C)), 2);
        assert_eq!(offset(Channel::Current(Phase::A)), 3);
        assert_eq!(offset(Channel::ActivePower(Phase::B)), 7);
        assert_eq!(offset(Channel::TotalActivePower), 0x09);
        assert_eq!(offset(Channel::Frequency), 0x15);
        assert_eq!(offset(Channel::ForwardActiveEnergy(Phase::C)), 0x38);
        assert_eq!(offset(Channel::TotalForwardActiveEnergy), 0x3A);
        assert_eq!(offset(Channel::BackwardActiveEnergy(Phase::B)), 0x3E);
        assert_eq!(offset(Channel::TotalBackwardActiveEnergy), 0x42);

        let total_power = map.field(Channel::TotalActivePower).unwrap();
        assert_eq!(total_power.width, Width::U32);
        assert_eq!(total_power.direction_bit, Some(3));
    }

    #[test]
    fn test_select_drops_direction_register_when_unused() {
        let map = RegisterMap::jsy_mk333(ReadFunction::Input)
            .select(ChannelSet::empty().with(Channel::Voltage(Phase::A)));

        assert_eq!(map.fields.len(), 1);
        assert_eq!(map.direction_offset, None);
        assert_eq!(map.span_registers(), 1);
        assert_eq!(map.request_blocks(), vec![RegisterBlock { offset: 0, count: 1 }]);
        assert_eq!(map.function.code(), 0x04);
    }

    #[test]
    fn test_select_power_keeps_direction_register() {
        let map = RegisterMap::jsy_mk333(ReadFunction::Holding)
            .select(ChannelSet::empty().with(Channel::ActivePower(Phase::A)));

        assert_eq!(map.direction_offset, Some(DIRECTION_OFFSET));
        assert_eq!(map.span_registers(), DIRECTION_OFFSET + 1);
        assert_eq!(
            map.request_blocks(),
            vec![RegisterBlock {
                offset: 6,
                count: DIRECTION_OFFSET + 1 - 6
            }]
        );
    }

    #[test]
    fn test_wide_map_splits_into_blocks() {
        let make = |channel, start_offset| RegisterField {
            channel,
            start_offset,
            width: Width::U32,
            signedness: Signedness::Unsigned,
            scale_factor: 1.0,
            unit: Unit::Watt,
            direction_bit: None,
        };
        let map = RegisterMap {
            function: ReadFunction::Holding,
            start: 0,
            fields: vec![
                make(Channel::TotalActivePower, 0),
                make(Channel::TotalForwardActiveEnergy, 200),
                make(Channel::TotalBackwardActiveEnergy, 202),
            ],
            direction_offset: None,
        };

        assert_eq!(
            map.request_blocks(),
            vec![
                RegisterBlock { offset: 0, count: 2 },
                RegisterBlock {
                    offset: 200,
                    count: 4
                },
            ]
        );
        assert_eq!(map.span_bytes(), 408);
    }

    #[test]
    fn test_channel_set() {
        let set: ChannelSet = [Channel::Frequency, Channel::Current(Phase::B)]
            .into_iter()
            .collect();

        assert_eq!(set.len(), 2);
        assert!(set.contains(Channel::Frequency));
        assert!(!set.contains(Channel::Current(Phase::A)));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![Channel::Current(Phase::B), Channel::Frequency]
        );
        assert_eq!(ChannelSet::all().len(), CHANNEL_COUNT);
    }

    #[test]
    fn test_energy_channels_are_counters() {
        assert_eq!(
            Channel::TotalForwardActiveEnergy.state_class(),
            StateClass::TotalIncreasing
        );
        assert_eq!(Channel::Voltage(Phase::A).state_class(), StateClass::Measurement);
        assert_eq!(Channel::ActivePower(Phase::C).default_accuracy_decimals(), 0);
        assert_eq!(Channel::Frequency.default_unit(), Unit::Hertz);
    }
}
