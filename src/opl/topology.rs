//! Channel topology of an array of OPL3 chips.
//!
//! Every chip exposes 23 logical channels: 18 melodic two-operator
//! channels followed by the five rhythm-mode voices. Logical channel `c`
//! lives on chip `c / 23` at slot `c % 23`. Depending on the configuration
//! some slots are paired into four-operator voices or reserved for the
//! hardware percussion voices.

/// Logical channels per chip.
pub const CHANNELS_PER_CHIP: usize = 23;

/// Two-operator channels per chip (slots `0..18`).
pub const MELODIC_CHANNELS_PER_CHIP: usize = 18;

/// Four-operator voices an OPL3 chip can form.
pub const FOUR_OPS_PER_CHIP: usize = 6;

/// Operator register offsets `(modulator, carrier)` for each slot.
///
/// Slots 18..23 are the rhythm voices: bass drum uses both operators of
/// channel 6, the other four use a single operator each.
pub const OPERATORS: [(u16, Option<u16>); CHANNELS_PER_CHIP] = [
    (0x000, Some(0x003)),
    (0x001, Some(0x004)),
    (0x002, Some(0x005)),
    (0x008, Some(0x00B)),
    (0x009, Some(0x00C)),
    (0x00A, Some(0x00D)),
    (0x010, Some(0x013)),
    (0x011, Some(0x014)),
    (0x012, Some(0x015)),
    (0x100, Some(0x103)),
    (0x101, Some(0x104)),
    (0x102, Some(0x105)),
    (0x108, Some(0x10B)),
    (0x109, Some(0x10C)),
    (0x10A, Some(0x10D)),
    (0x110, Some(0x113)),
    (0x111, Some(0x114)),
    (0x112, Some(0x115)),
    (0x010, Some(0x013)),
    (0x014, None),
    (0x012, None),
    (0x015, None),
    (0x011, None),
];

/// Channel register offset (added to 0xA0/0xB0/0xC0) for each slot.
///
/// Snare, cymbal and hi-hat share the frequency registers of channels 7
/// and 8 with the tom and have none of their own.
pub const CHANNELS: [Option<u16>; CHANNELS_PER_CHIP] = [
    Some(0x000),
    Some(0x001),
    Some(0x002),
    Some(0x003),
    Some(0x004),
    Some(0x005),
    Some(0x006),
    Some(0x007),
    Some(0x008),
    Some(0x100),
    Some(0x101),
    Some(0x102),
    Some(0x103),
    Some(0x104),
    Some(0x105),
    Some(0x106),
    Some(0x107),
    Some(0x108),
    Some(0x006),
    Some(0x007),
    Some(0x008),
    None,
    None,
];

/// One of the five hardware rhythm voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PercussionRole {
    BassDrum,
    Snare,
    Tom,
    Cymbal,
    HiHat,
}

impl PercussionRole {
    pub const ALL: [PercussionRole; 5] = [
        PercussionRole::BassDrum,
        PercussionRole::Snare,
        PercussionRole::Tom,
        PercussionRole::Cymbal,
        PercussionRole::HiHat,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit of register 0xBD that keys this voice on.
    pub fn enable_bit(self) -> u8 {
        0x10 >> self.index()
    }
}

/// What a logical channel is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelCategory {
    /// Free two-operator channel.
    Plain,
    /// First half of a four-operator voice.
    FourOpMaster,
    /// Second half of a four-operator voice, three slots after its master.
    FourOpSlave,
    /// Hardware rhythm voice.
    Percussion(PercussionRole),
    /// Not directly playable: a rhythm slot while percussion mode is off,
    /// or a melodic slot whose operators are taken by the rhythm voices.
    PercussionSlave,
}

impl ChannelCategory {
    /// Numeric category code: 0 plain, 1 master, 2 slave, 3..=7 rhythm
    /// voices, 8 reserved.
    pub fn code(self) -> u8 {
        match self {
            ChannelCategory::Plain => 0,
            ChannelCategory::FourOpMaster => 1,
            ChannelCategory::FourOpSlave => 2,
            ChannelCategory::Percussion(role) => 3 + role.index() as u8,
            ChannelCategory::PercussionSlave => 8,
        }
    }
}

/// Where a logical channel lives in hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAddress {
    pub chip: usize,
    /// Slot within the chip, `0..23`.
    pub slot: usize,
    pub modulator: u16,
    pub carrier: Option<u16>,
    pub register: Option<u16>,
}

impl ChannelAddress {
    /// Rhythm voice keyed through register 0xBD, if this is a rhythm slot.
    pub fn percussion_role(&self) -> Option<PercussionRole> {
        self.slot
            .checked_sub(MELODIC_CHANNELS_PER_CHIP)
            .and_then(PercussionRole::from_index)
    }
}

/// Category of every logical channel for one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    num_chips: usize,
    categories: Vec<ChannelCategory>,
    four_ops_per_chip: Vec<usize>,
}

impl Topology {
    /// Lays out `num_four_ops` four-operator voices over `num_chips` chips.
    ///
    /// Four-op voices fill each chip before the next: pairs (0,3), (1,4),
    /// (2,5), (9,12), (10,13), (11,14). The caller is responsible for
    /// keeping `num_four_ops` within six per chip.
    pub fn new(num_chips: usize, num_four_ops: usize, percussion_mode: bool) -> Self {
        let mut categories = Vec::with_capacity(num_chips * CHANNELS_PER_CHIP);
        for _ in 0..num_chips {
            categories.extend((0..MELODIC_CHANNELS_PER_CHIP).map(|_| ChannelCategory::Plain));
            categories.extend(
                (MELODIC_CHANNELS_PER_CHIP..CHANNELS_PER_CHIP)
                    .map(|_| ChannelCategory::PercussionSlave),
            );
        }

        if percussion_mode {
            for chip in 0..num_chips {
                let base = chip * CHANNELS_PER_CHIP;
                for role in PercussionRole::ALL {
                    categories[base + MELODIC_CHANNELS_PER_CHIP + role.index()] =
                        ChannelCategory::Percussion(role);
                }
                for slot in 6..9 {
                    categories[base + slot] = ChannelCategory::PercussionSlave;
                }
            }
        }

        let mut next = 0;
        for a in 0..num_four_ops {
            if next + 3 >= categories.len() {
                break;
            }
            categories[next] = ChannelCategory::FourOpMaster;
            categories[next + 3] = ChannelCategory::FourOpSlave;
            next += match a % FOUR_OPS_PER_CHIP {
                2 => 7,
                5 => 12,
                _ => 1,
            };
        }

        let mut remaining = num_four_ops;
        let four_ops_per_chip = (0..num_chips)
            .map(|_| {
                let here = remaining.min(FOUR_OPS_PER_CHIP);
                remaining -= here;
                here
            })
            .collect();

        Self {
            num_chips,
            categories,
            four_ops_per_chip,
        }
    }

    /// Total number of logical channels.
    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn num_chips(&self) -> usize {
        self.num_chips
    }

    pub fn category(&self, channel: usize) -> ChannelCategory {
        self.categories[channel]
    }

    /// Hardware address of a logical channel.
    pub fn address(&self, channel: usize) -> ChannelAddress {
        let slot = channel % CHANNELS_PER_CHIP;
        let (modulator, carrier) = OPERATORS[slot];
        ChannelAddress {
            chip: channel / CHANNELS_PER_CHIP,
            slot,
            modulator,
            carrier,
            register: CHANNELS[slot],
        }
    }

    /// Number of four-op voices enabled on a chip (bits of register 0x104).
    pub fn four_ops_on_chip(&self, chip: usize) -> usize {
        self.four_ops_per_chip[chip]
    }

    /// Category codes of one chip's 23 channels, space separated.
    pub fn describe_chip(&self, chip: usize) -> String {
        let start = chip * CHANNELS_PER_CHIP;
        self.categories[start..start + CHANNELS_PER_CHIP]
            .iter()
            .map(|c| c.code().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_layout() {
        let topology = Topology::new(1, 0, false);
        assert_eq!(topology.len(), 23);
        assert_eq!(
            topology.describe_chip(0),
            "0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 8 8 8 8 8"
        );
    }

    #[test]
    fn test_four_op_stride() {
        let topology = Topology::new(2, 7, false);
        assert_eq!(
            topology.describe_chip(0),
            "1 1 1 2 2 2 0 0 0 1 1 1 2 2 2 0 0 0 8 8 8 8 8"
        );
        assert_eq!(
            topology.describe_chip(1),
            "1 0 0 2 0 0 0 0 0 0 0 0 0 0 0 0 0 0 8 8 8 8 8"
        );
        assert_eq!(topology.four_ops_on_chip(0), 6);
        assert_eq!(topology.four_ops_on_chip(1), 1);
        for c in 0..topology.len() {
            if topology.category(c) == ChannelCategory::FourOpMaster {
                assert_eq!(topology.category(c + 3), ChannelCategory::FourOpSlave);
            }
        }
    }

    #[test]
    fn test_percussion_layout() {
        let topology = Topology::new(1, 0, true);
        assert_eq!(
            topology.describe_chip(0),
            "0 0 0 0 0 0 8 8 8 0 0 0 0 0 0 0 0 0 3 4 5 6 7"
        );
        let hihat = topology.address(22);
        assert_eq!(hihat.percussion_role(), Some(PercussionRole::HiHat));
        assert_eq!(hihat.register, None);
        assert_eq!(PercussionRole::HiHat.enable_bit(), 0x01);
        assert_eq!(PercussionRole::BassDrum.enable_bit(), 0x10);
    }

    #[test]
    fn test_address_of_second_chip() {
        let topology = Topology::new(2, 0, false);
        let address = topology.address(23 + 10);
        assert_eq!(address.chip, 1);
        assert_eq!(address.slot, 10);
        assert_eq!(address.modulator, 0x101);
        assert_eq!(address.carrier, Some(0x104));
        assert_eq!(address.register, Some(0x101));
        assert_eq!(address.percussion_role(), None);
    }
}
