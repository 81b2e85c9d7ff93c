//! Engine configuration.
//!
//! [`EngineConfig`] is built once by the CLI (or loaded from JSON) and
//! handed to the synthesizer on every reset. It is never mutated by the
//! engine itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::bank::BankSet;
use crate::opl::topology::FOUR_OPS_PER_CHIP;

/// Native sample rate of the OPL3 chip.
pub const PCM_RATE: u32 = 49716;

/// Maximum number of emulated chips.
pub const MAX_CHIPS: usize = 100;

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("number of chips may only be 1..{max}, got {got}")]
    ChipCount { got: usize, max: usize },
    #[error(
        "number of four-op channels may only be 0..{max} when {chips} chips are used, \
         got {got}"
    )]
    FourOpCount { got: usize, max: usize, chips: usize },
    #[error("bank number may only be 0..{max}, got {got}")]
    UnknownBank { got: usize, max: usize },
    #[error(
        "bank {bank} contains only four-op instruments, so at least one four-op channel \
         is required (suggested: {suggested})"
    )]
    FourOpOnlyBank { bank: usize, suggested: usize },
    #[error("unknown emulator '{0}' (expected dbopl, dboplv2, vintage, ym3812 or ymf262)")]
    UnknownEmulator(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which chip emulator core renders audio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmulatorKind {
    Dbopl,
    #[default]
    Dboplv2,
    Vintage,
    Ym3812,
    Ymf262,
}

impl EmulatorKind {
    /// Human-readable emulator name.
    pub fn name(self) -> &'static str {
        match self {
            EmulatorKind::Dbopl => "Old DOSBOX",
            EmulatorKind::Dboplv2 => "New DOSBOX",
            EmulatorKind::Vintage => "'That vintage tone'",
            EmulatorKind::Ym3812 => "YM3812 from MAME",
            EmulatorKind::Ymf262 => "YMF262 from MAME",
        }
    }

    /// Whether the emulator has a per-channel stereo mixer for smooth panning.
    pub fn supports_full_pan(self) -> bool {
        !matches!(self, EmulatorKind::Dboplv2 | EmulatorKind::Ymf262)
    }
}

impl FromStr for EmulatorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dbopl" => Ok(EmulatorKind::Dbopl),
            "dboplv2" => Ok(EmulatorKind::Dboplv2),
            "vintage" => Ok(EmulatorKind::Vintage),
            "ym3812" => Ok(EmulatorKind::Ym3812),
            "ymf262" => Ok(EmulatorKind::Ymf262),
            _ => Err(ConfigError::UnknownEmulator(s.to_string())),
        }
    }
}

impl fmt::Display for EmulatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable engine configuration passed to every reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Index of the instrument bank to play with.
    pub bank: usize,
    /// Number of emulated chips (1..=100).
    pub num_chips: usize,
    /// Number of four-operator channel pairs across all chips.
    pub num_four_ops: usize,
    /// Reserve five channels per chip for the hardware percussion voices.
    pub percussion_mode: bool,
    /// Deep tremolo depth (register 0xBD bit 7).
    pub high_tremolo: bool,
    /// Deep vibrato depth (register 0xBD bit 6).
    pub high_vibrato: bool,
    /// Scale modulator volume even for FM-connected instruments.
    pub scale_modulators: bool,
    /// Continuous panning through the emulator's stereo mixer.
    pub full_pan: bool,
    /// Let bank-select LSB change the bank at runtime.
    pub allow_bank_switch: bool,
    pub emulator: EmulatorKind,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bank: 0,
            num_chips: 2,
            num_four_ops: 7,
            percussion_mode: false,
            high_tremolo: false,
            high_vibrato: false,
            scale_modulators: false,
            full_pan: true,
            allow_bank_switch: false,
            emulator: EmulatorKind::default(),
            sample_rate: PCM_RATE,
        }
    }
}

impl EngineConfig {
    /// Loads a configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Checks the configuration against the loaded banks.
    ///
    /// # Errors
    ///
    /// Rejects chip counts outside 1..=100, more than six four-op pairs per
    /// chip, an unknown bank, and a bank made (almost) entirely of four-op
    /// instruments when no four-op channels are configured.
    pub fn validate(&self, banks: &BankSet) -> Result<(), ConfigError> {
        if self.num_chips < 1 || self.num_chips > MAX_CHIPS {
            return Err(ConfigError::ChipCount {
                got: self.num_chips,
                max: MAX_CHIPS,
            });
        }
        let max_four_ops = self.num_chips * FOUR_OPS_PER_CHIP;
        if self.num_four_ops > max_four_ops {
            return Err(ConfigError::FourOpCount {
                got: self.num_four_ops,
                max: max_four_ops,
                chips: self.num_chips,
            });
        }
        if self.bank >= banks.len() {
            return Err(ConfigError::UnknownBank {
                got: self.bank,
                max: banks.len().saturating_sub(1),
            });
        }
        let census = banks.four_op_census(self.bank);
        if census.melodic_total > 0
            && census.melodic_four_op >= census.melodic_total * 15 / 16
            && self.num_four_ops == 0
        {
            return Err(ConfigError::FourOpOnlyBank {
                bank: self.bank,
                suggested: self.suggested_four_ops(banks),
            });
        }
        Ok(())
    }

    /// Four-op channel count that suits the selected bank.
    pub fn suggested_four_ops(&self, banks: &BankSet) -> usize {
        let census = banks.four_op_census(self.bank);
        let (four, total) = (census.melodic_four_op, census.melodic_total);
        if four >= total * 7 / 8 {
            self.num_chips * FOUR_OPS_PER_CHIP
        } else if four < total / 8 {
            0
        } else if self.num_chips == 1 {
            1
        } else {
            self.num_chips * 4
        }
    }

    /// Whether smooth panning is actually available with this emulator.
    pub fn effective_full_pan(&self) -> bool {
        self.full_pan && self.emulator.supports_full_pan()
    }
}
