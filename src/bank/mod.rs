//! Instrument and bank metadata.
//!
//! Read-only tables that describe how every MIDI program maps onto FM
//! operator register payloads:
//!
//! - A [`Bank`] maps a program number (0-127 melodic, 128-255 percussion
//!   keyed by `128 + note`) to an instrument index.
//! - An [`InstrumentMeta`] names one or two operator-pair patches plus the
//!   tone override, topology flags and decay timings.
//! - An [`OperatorPatch`] is the raw register payload for one operator pair.
//!
//! The engine never mutates these tables; they are shared behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::opl::topology::PercussionRole;

/// Built-in demonstration bank, used when no bank file is given.
const BUILTIN_BANK_JSON: &str = include_str!("../../banks/demo.json");

/// Number of program slots in a bank: 128 melodic + 128 percussion.
pub const PROGRAM_SLOTS: usize = 256;

/// Percussion role of each program slot in hardware percussion mode.
///
/// 0 = melodic, 3 = bass drum, 4 = snare, 5 = tom, 6 = cymbal, 7 = hi-hat.
/// Only GM percussion keys 35-81 (slots 163-209) carry a role.
static PERCUSSION_MAP: [u8; PROGRAM_SLOTS] = {
    let mut map = [0u8; PROGRAM_SLOTS];
    let keys: [u8; 47] = [
        // 35..=50
        3, 3, 7, 4, 7, 4, 5, 7, 5, 7, 5, 7, 5, 5, 6, 5, //
        // 51..=66
        6, 6, 0, 5, 6, 0, 6, 0, 6, 5, 5, 5, 5, 5, 0, 0, //
        // 67..=81
        0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ];
    let mut i = 0;
    while i < keys.len() {
        map[128 + 35 + i] = keys[i];
        i += 1;
    }
    map
};

/// Returns the hardware percussion role used for a program slot, if any.
pub fn percussion_role(program: usize) -> Option<PercussionRole> {
    match PERCUSSION_MAP[program & 0xFF] {
        0 => None,
        code => PercussionRole::from_index((code - 3) as usize),
    }
}

/// Errors that can occur while loading or validating bank tables.
#[derive(Debug, Error)]
pub enum BankError {
    /// File could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON did not match the bank schema.
    #[error("bank parse error: {0}")]
    Json(#[from] serde_json::Error),
    /// A table that must not be empty is empty.
    #[error("bank set has no {0}")]
    Empty(&'static str),
    /// An instrument names a patch that does not exist.
    #[error("instrument {instrument} references missing patch {patch}")]
    MissingPatch { instrument: usize, patch: u16 },
    /// A bank names an instrument that does not exist.
    #[error("bank '{bank}' references missing instrument {instrument}")]
    MissingInstrument { bank: String, instrument: u16 },
    /// A bank maps a program slot outside 0..256.
    #[error("bank '{bank}' maps out-of-range program {program}")]
    ProgramOutOfRange { bank: String, program: u16 },
}

/// Register payload for one operator pair (one 2-op channel's worth).
///
/// `modulator_e862`/`carrier_e862` pack the bytes for registers
/// 0x20, 0x60, 0x80 and 0xE0, lowest byte first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorPatch {
    pub modulator_e862: u32,
    pub carrier_e862: u32,
    /// Key-scale level / total level byte (register 0x40) of the modulator.
    pub modulator_40: u8,
    /// Key-scale level / total level byte (register 0x40) of the carrier.
    pub carrier_40: u8,
    /// Feedback/connection byte (register 0xC0). Bit 0 set = additive (AM).
    pub feedconn: u8,
    /// Fine tuning in semitones added to the channel bend.
    #[serde(default)]
    pub finetune: i8,
}

impl OperatorPatch {
    /// Whether the pair uses additive synthesis (both operators audible).
    pub fn is_additive(&self) -> bool {
        self.feedconn & 1 != 0
    }
}

/// Metadata for one playable instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMeta {
    /// Patch played on the primary channel.
    pub primary: u16,
    /// Patch played on the secondary channel. Equal to `primary` for
    /// plain two-operator instruments.
    pub secondary: u16,
    /// Tone override: 0 = none, <20 = transpose up, <128 = fixed note,
    /// otherwise `tone - 128` semitones down.
    #[serde(default)]
    pub tone: u8,
    /// Two detuned 2-op voices instead of one true 4-op voice.
    #[serde(default)]
    pub pseudo_four_op: bool,
    /// No audio data; plays silently.
    #[serde(default)]
    pub no_sound: bool,
    /// Milliseconds until a held note becomes negligible.
    pub ms_sound_kon: i64,
    /// Milliseconds until a released note becomes negligible.
    pub ms_sound_koff: i64,
    #[serde(default)]
    pub name: String,
}

impl InstrumentMeta {
    /// Applies the tone override to a MIDI note number.
    pub fn resolve_tone(&self, note: u8) -> i32 {
        let note = note as i32;
        let tone = self.tone as i32;
        match self.tone {
            0 => note,
            1..=19 => note + tone,
            20..=127 => tone,
            _ => note - (tone - 128),
        }
    }

    /// Whether the instrument occupies two physical channels.
    pub fn uses_two_channels(&self) -> bool {
        self.primary != self.secondary
    }
}

/// A selectable program table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bank {
    pub name: String,
    /// Instrument used for program slots with no explicit entry.
    #[serde(default)]
    pub default_instrument: u16,
    /// Sparse program slot -> instrument index table.
    #[serde(default)]
    pub programs: BTreeMap<u16, u16>,
}

impl Bank {
    /// Resolves a program slot to an instrument index.
    pub fn instrument_for(&self, program: usize) -> usize {
        self.programs
            .get(&(program as u16))
            .copied()
            .unwrap_or(self.default_instrument) as usize
    }
}

/// Counts of four-operator instruments in a bank, split melodic/percussion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FourOpCensus {
    pub melodic_four_op: usize,
    pub melodic_total: usize,
    pub percussion_four_op: usize,
    pub percussion_total: usize,
}

/// The complete set of patches, instruments and banks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankSet {
    pub patches: Vec<OperatorPatch>,
    pub instruments: Vec<InstrumentMeta>,
    pub banks: Vec<Bank>,
}

impl BankSet {
    /// Loads and validates the built-in demonstration bank.
    pub fn builtin() -> Result<Self, BankError> {
        Self::from_json_str(BUILTIN_BANK_JSON)
    }

    /// Parses and validates a bank set from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, BankError> {
        let set: BankSet = serde_json::from_str(json)?;
        set.validate()?;
        Ok(set)
    }

    /// Loads and validates a bank set from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, BankError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    /// Checks that every reference between the tables resolves.
    pub fn validate(&self) -> Result<(), BankError> {
        if self.patches.is_empty() {
            return Err(BankError::Empty("patches"));
        }
        if self.instruments.is_empty() {
            return Err(BankError::Empty("instruments"));
        }
        if self.banks.is_empty() {
            return Err(BankError::Empty("banks"));
        }
        for (index, meta) in self.instruments.iter().enumerate() {
            for patch in [meta.primary, meta.secondary] {
                if patch as usize >= self.patches.len() {
                    return Err(BankError::MissingPatch {
                        instrument: index,
                        patch,
                    });
                }
            }
        }
        for bank in &self.banks {
            let referenced = bank
                .programs
                .values()
                .chain(std::iter::once(&bank.default_instrument));
            for &instrument in referenced {
                if instrument as usize >= self.instruments.len() {
                    return Err(BankError::MissingInstrument {
                        bank: bank.name.clone(),
                        instrument,
                    });
                }
            }
            if let Some(&program) = bank.programs.keys().find(|&&p| p as usize >= PROGRAM_SLOTS) {
                return Err(BankError::ProgramOutOfRange {
                    bank: bank.name.clone(),
                    program,
                });
            }
        }
        Ok(())
    }

    /// Number of selectable banks.
    pub fn len(&self) -> usize {
        self.banks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }

    /// Display name of a bank, if it exists.
    pub fn bank_name(&self, bank: usize) -> Option<&str> {
        self.banks.get(bank).map(|b| b.name.as_str())
    }

    /// Resolves (bank, program slot) to an instrument index.
    ///
    /// Unknown banks fall back to bank 0.
    pub fn resolve(&self, bank: usize, program: usize) -> usize {
        self.banks
            .get(bank)
            .unwrap_or(&self.banks[0])
            .instrument_for(program)
    }

    pub fn instrument(&self, index: usize) -> &InstrumentMeta {
        &self.instruments[index]
    }

    pub fn patch(&self, id: u16) -> &OperatorPatch {
        &self.patches[id as usize]
    }

    /// Counts audible two-channel instruments over all 256 program slots.
    pub fn four_op_census(&self, bank: usize) -> FourOpCensus {
        let mut census = FourOpCensus::default();
        for program in 0..PROGRAM_SLOTS {
            let meta = self.instrument(self.resolve(bank, program));
            if meta.no_sound {
                continue;
            }
            let four_op = meta.uses_two_channels() as usize;
            if program < 128 {
                census.melodic_total += 1;
                census.melodic_four_op += four_op;
            } else {
                census.percussion_total += 1;
                census.percussion_four_op += four_op;
            }
        }
        census
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_bank_loads() {
        let set = BankSet::builtin().unwrap();
        assert!(set.len() >= 2);
        assert_eq!(set.bank_name(0), Some("General MIDI demo"));
    }

    #[test]
    fn test_connection_bit() {
        let set = BankSet::builtin().unwrap();
        assert!(!set.patch(0).is_additive());
        assert!(set.patch(9).is_additive());
    }

    #[test]
    fn test_tone_override() {
        let mut meta = InstrumentMeta::default();
        assert_eq!(meta.resolve_tone(60), 60);
        meta.tone = 12;
        assert_eq!(meta.resolve_tone(60), 72);
        meta.tone = 35;
        assert_eq!(meta.resolve_tone(60), 35);
        meta.tone = 140;
        assert_eq!(meta.resolve_tone(60), 48);
    }

    #[test]
    fn test_percussion_map() {
        assert_eq!(percussion_role(0), None);
        assert_eq!(percussion_role(128 + 35), Some(PercussionRole::BassDrum));
        assert_eq!(percussion_role(128 + 38), Some(PercussionRole::Snare));
        assert_eq!(percussion_role(128 + 42), Some(PercussionRole::HiHat));
        assert_eq!(percussion_role(128 + 49), Some(PercussionRole::Cymbal));
        assert_eq!(percussion_role(128 + 41), Some(PercussionRole::Tom));
        assert_eq!(percussion_role(128 + 53), None);
        assert_eq!(percussion_role(128 + 100), None);
    }

    #[test]
    fn test_unknown_bank_falls_back() {
        let set = BankSet::builtin().unwrap();
        assert_eq!(set.resolve(99, 0), set.resolve(0, 0));
    }

    #[test]
    fn test_validate_rejects_dangling_patch() {
        let json = r#"{
            "patches": [{"modulator_e862": 0, "carrier_e862": 0,
                         "modulator_40": 0, "carrier_40": 0, "feedconn": 0}],
            "instruments": [{"primary": 0, "secondary": 3,
                             "ms_sound_kon": 100, "ms_sound_koff": 100}],
            "banks": [{"name": "b"}]
        }"#;
        match BankSet::from_json_str(json) {
            Err(BankError::MissingPatch { instrument: 0, patch: 3 }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_census_counts_two_channel_instruments() {
        let set = BankSet::builtin().unwrap();
        let census = set.four_op_census(1);
        assert_eq!(census.melodic_four_op, census.melodic_total);
        let census = set.four_op_census(0);
        assert!(census.melodic_four_op < census.melodic_total);
    }
}
