//! Logical-channel primitives over a set of chips.
//!
//! [`OplInterface`] turns "play this frequency on channel 37" into register
//! writes on the right chip. It caches the last pitch register and patch of
//! every channel so that key-off and volume changes can be written without
//! recomputing the whole channel state.

use std::f32::consts::FRAC_PI_2;
use std::sync::Arc;

use crate::bank::{BankSet, OperatorPatch};
use crate::config::{ConfigError, EngineConfig};
use crate::diagnostics::Diagnostics;
use crate::opl::topology::{ChannelCategory, PercussionRole, Topology, MELODIC_CHANNELS_PER_CHIP};
use crate::opl::{ChipFactory, FmChip};

/// Highest frequency `note_on` accepts.
pub const MAX_HERTZ: f64 = 131071.0;

/// Highest level `touch_level` produces.
pub const MAX_LEVEL: u32 = 63;

/// Register 0xBD bits.
const BD_TREMOLO: u8 = 0x80;
const BD_VIBRATO: u8 = 0x40;
const BD_PERCUSSION: u8 = 0x20;

/// Key-on bit of registers 0xB0..0xB8.
const KEY_ON: u16 = 0x2000;

/// Timer and OPL3-enable pulses written after every chip reset.
const INIT_SEQUENCE: [(u16, u8); 7] = [
    (0x004, 96),
    (0x004, 128),
    (0x105, 0),
    (0x105, 1),
    (0x105, 0),
    (0x001, 32),
    (0x105, 1),
];

/// Which operators of a channel `touch` scales, indexed by connection mode.
///
/// Modes: 0 2-op FM, 1 2-op AM, 2..=5 four-op first half (FM-FM, AM-FM,
/// FM-AM, AM-AM), 6..=9 four-op second half in the same order.
const SCALED_OPERATORS: [(bool, bool); 10] = [
    (false, true),
    (true, true),
    (false, false),
    (true, false),
    (false, true),
    (true, false),
    (false, true),
    (false, true),
    (false, true),
    (true, true),
];

/// Encodes a frequency as the 14-bit block/F-number value of registers
/// 0xA0/0xB0, key-on bit included.
///
/// Returns `None` outside `0..=131071` Hz.
pub fn frequency_code(hertz: f64) -> Option<u16> {
    if !(0.0..=MAX_HERTZ).contains(&hertz) {
        return None;
    }
    let mut hertz = hertz;
    let mut code = KEY_ON;
    while hertz >= 1023.5 {
        hertz /= 2.0;
        code += 0x400;
    }
    Some(code + (hertz + 0.5) as u16)
}

/// Converts a combined volume (pressure * volume * expression, up to
/// 127^3) to a 0..=63 output level on a logarithmic curve.
pub fn touch_level(volume: u32) -> u32 {
    if volume > 8725 {
        let level = (volume as f64).ln() * 11.541561 - 103.72845;
        (level as u32).min(MAX_LEVEL)
    } else {
        0
    }
}

/// Applies an output level to a total-level register byte, keeping the
/// key-scale bits and the instrument's own attenuation.
fn scaled_total_level(register: u8, level: u32) -> u8 {
    let x = register as u32;
    ((x | 63) - level + level * (x & 63) / 63) as u8
}

/// The chips plus per-channel cached register state.
pub struct OplInterface {
    chips: Vec<Box<dyn FmChip>>,
    topology: Topology,
    bank: Arc<BankSet>,
    full_pan: bool,
    scale_modulators: bool,
    patch_ids: Vec<Option<u16>>,
    pitch_regs: Vec<u8>,
    percussion_regs: Vec<u8>,
}

impl OplInterface {
    /// Creates an interface with no chips. Call [`OplInterface::reset`]
    /// before use.
    pub fn new(bank: Arc<BankSet>) -> Self {
        Self {
            chips: Vec::new(),
            topology: Topology::new(0, 0, false),
            bank,
            full_pan: false,
            scale_modulators: false,
            patch_ids: Vec::new(),
            pitch_regs: Vec::new(),
            percussion_regs: Vec::new(),
        }
    }

    /// Rebuilds every chip for a new configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] without touching the current chips if the
    /// configuration does not validate against the bank set.
    pub fn reset(
        &mut self,
        config: &EngineConfig,
        factory: &dyn ChipFactory,
        diagnostics: &dyn Diagnostics,
    ) -> Result<(), ConfigError> {
        config.validate(&self.bank)?;

        let full_pan = config.effective_full_pan();
        diagnostics.print_line(&format!(
            "OPL emulation used: {} (fullpan {})",
            config.emulator.name(),
            if full_pan { "on" } else { "off" }
        ));

        self.full_pan = full_pan;
        self.scale_modulators = config.scale_modulators;
        self.topology =
            Topology::new(config.num_chips, config.num_four_ops, config.percussion_mode);
        self.chips = (0..self.topology.num_chips())
            .map(|index| factory.create(index, config.emulator, full_pan))
            .collect();
        self.patch_ids = vec![None; self.topology.len()];
        self.pitch_regs = vec![0; self.topology.len()];

        let bd = if config.high_tremolo { BD_TREMOLO } else { 0 }
            | if config.high_vibrato { BD_VIBRATO } else { 0 }
            | if config.percussion_mode { BD_PERCUSSION } else { 0 };
        self.percussion_regs = vec![bd; self.topology.num_chips()];

        for chip in 0..self.topology.num_chips() {
            self.chips[chip].reset();
            for channel in 0..MELODIC_CHANNELS_PER_CHIP {
                if let Some(register) = self.topology.address(channel).register {
                    self.poke(chip, 0xB0 + register, 0);
                }
            }
            for (reg, value) in INIT_SEQUENCE {
                self.poke(chip, reg, value);
            }
            self.poke(chip, 0xBD, bd);
            let fours = self.topology.four_ops_on_chip(chip);
            self.poke(chip, 0x104, ((1u16 << fours) - 1) as u8);
        }

        diagnostics.print_line("Channels used as:");
        for chip in 0..self.topology.num_chips() {
            diagnostics.print_line(&format!(" {}", self.topology.describe_chip(chip)));
        }

        self.silence();
        Ok(())
    }

    pub fn num_channels(&self) -> usize {
        self.topology.len()
    }

    pub fn category(&self, channel: usize) -> ChannelCategory {
        self.topology.category(channel)
    }

    /// Patch last written to a channel.
    pub fn patch_id(&self, channel: usize) -> Option<u16> {
        self.patch_ids[channel]
    }

    fn poke(&mut self, chip: usize, reg: u16, value: u8) {
        self.chips[chip].write_reg(reg, value);
    }

    fn patch_data(&self, channel: usize) -> OperatorPatch {
        self.patch_ids[channel]
            .map(|id| *self.bank.patch(id))
            .unwrap_or_default()
    }

    /// Keys a channel on at the given frequency.
    ///
    /// Rhythm voices are keyed through register 0xBD; those without their
    /// own frequency registers only get the key bit. Frequencies outside
    /// `0..=131071` Hz are ignored.
    pub fn note_on(&mut self, channel: usize, hertz: f64) {
        let Some(mut code) = frequency_code(hertz) else {
            return;
        };
        let address = self.topology.address(channel);
        if let Some(role) = address.percussion_role() {
            self.percussion_regs[address.chip] |= role.enable_bit();
            let bd = self.percussion_regs[address.chip];
            self.poke(address.chip, 0xBD, bd);
            code &= !KEY_ON;
        }
        if let Some(register) = address.register {
            self.poke(address.chip, 0xA0 + register, (code & 0xFF) as u8);
            let pitch = (code >> 8) as u8;
            self.pitch_regs[channel] = pitch;
            self.poke(address.chip, 0xB0 + register, pitch);
        }
    }

    /// Keys a channel off, keeping its last frequency.
    pub fn note_off(&mut self, channel: usize) {
        let address = self.topology.address(channel);
        if let Some(role) = address.percussion_role() {
            self.percussion_regs[address.chip] &= !role.enable_bit();
            let bd = self.percussion_regs[address.chip];
            self.poke(address.chip, 0xBD, bd);
            return;
        }
        if let Some(register) = address.register {
            let pitch = self.pitch_regs[channel] & 0xDF;
            self.poke(address.chip, 0xB0 + register, pitch);
        }
    }

    /// Sets the loudness of a channel from a combined volume of up to
    /// 127^3.
    pub fn touch(&mut self, channel: usize, volume: u32) {
        self.touch_level(channel, touch_level(volume));
    }

    /// Sets the loudness of a channel from a 0..=63 output level.
    ///
    /// Only the operators that reach the output under the patch's
    /// connection are scaled, unless modulator scaling is forced.
    pub fn touch_level(&mut self, channel: usize, level: u32) {
        let level = level.min(MAX_LEVEL);
        let address = self.topology.address(channel);
        let patch = self.patch_data(channel);

        let mode = match self.topology.category(channel) {
            ChannelCategory::Plain | ChannelCategory::Percussion(PercussionRole::BassDrum) => {
                patch.is_additive() as usize
            }
            ChannelCategory::FourOpMaster => {
                let second = self.patch_data(channel + 3);
                2 + patch.is_additive() as usize + second.is_additive() as usize * 2
            }
            ChannelCategory::FourOpSlave => {
                let first = self.patch_data(channel - 3);
                6 + first.is_additive() as usize + patch.is_additive() as usize * 2
            }
            _ => 1,
        };
        let (scale_modulator, scale_carrier) = if self.scale_modulators {
            (true, true)
        } else {
            SCALED_OPERATORS[mode]
        };

        let modulator = if scale_modulator {
            scaled_total_level(patch.modulator_40, level)
        } else {
            patch.modulator_40
        };
        self.poke(address.chip, 0x40 + address.modulator, modulator);
        if let Some(carrier_offset) = address.carrier {
            let carrier = if scale_carrier {
                scaled_total_level(patch.carrier_40, level)
            } else {
                patch.carrier_40
            };
            self.poke(address.chip, 0x40 + carrier_offset, carrier);
        }
    }

    /// Loads a patch into a channel's operators.
    pub fn patch(&mut self, channel: usize, patch_id: u16) {
        self.patch_ids[channel] = Some(patch_id);
        let address = self.topology.address(channel);
        let patch = *self.bank.patch(patch_id);
        let mut modulator = patch.modulator_e862;
        let mut carrier = patch.carrier_e862;
        for base in [0x20u16, 0x60, 0x80, 0xE0] {
            self.poke(address.chip, base + address.modulator, (modulator & 0xFF) as u8);
            modulator >>= 8;
            if let Some(carrier_offset) = address.carrier {
                self.poke(address.chip, base + carrier_offset, (carrier & 0xFF) as u8);
            }
            carrier >>= 8;
        }
    }

    /// Pans a channel. `value` is a MIDI pan position, 0 hard left, 64
    /// centre, 127 hard right.
    ///
    /// Without smooth panning the position is reduced to left, right or
    /// both output bits of register 0xC0.
    pub fn pan(&mut self, channel: usize, value: u8) {
        let address = self.topology.address(channel);
        let mut bits = 0u8;
        if !self.full_pan {
            if value < 64 + 32 {
                bits |= 0x10;
            }
            if value >= 64 - 32 {
                bits |= 0x20;
            }
        }
        if let Some(register) = address.register {
            let feedconn = self.patch_data(channel).feedconn;
            self.poke(address.chip, 0xC0 + register, feedconn | bits);
        }
        if self.full_pan {
            let level = if value <= 1 {
                0.0
            } else {
                (value - 1) as f32 / 126.0
            };
            self.chips[address.chip].set_panning(
                address.slot,
                (FRAC_PI_2 * level).cos(),
                (FRAC_PI_2 * level).sin(),
            );
        }
    }

    /// Keys off and mutes every channel.
    pub fn silence(&mut self) {
        for channel in 0..self.topology.len() {
            self.note_off(channel);
            self.touch_level(channel, 0);
        }
    }

    /// Renders audio from every chip into an interleaved stereo buffer.
    pub fn update(&mut self, buffer: &mut [f32]) {
        for chip in &mut self.chips {
            chip.update(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::NullDiagnostics;
    use crate::opl::{LoggingChipFactory, RegisterLog};

    fn interface(config: &EngineConfig) -> (OplInterface, RegisterLog) {
        let log = RegisterLog::new();
        let factory = LoggingChipFactory::new(log.clone());
        let mut opl = OplInterface::new(Arc::new(BankSet::builtin().unwrap()));
        opl.reset(config, &factory, &NullDiagnostics).unwrap();
        log.clear();
        (opl, log)
    }

    fn one_chip() -> EngineConfig {
        EngineConfig {
            num_chips: 1,
            num_four_ops: 0,
            emulator: crate::config::EmulatorKind::Dbopl,
            full_pan: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_frequency_code() {
        assert_eq!(frequency_code(440.0), Some(0x21B8));
        assert_eq!(frequency_code(2000.0), Some(0x27E8));
        assert_eq!(frequency_code(-1.0), None);
        assert_eq!(frequency_code(131072.0), None);
    }

    #[test]
    fn test_touch_level_curve() {
        assert_eq!(touch_level(0), 0);
        assert_eq!(touch_level(8725), 0);
        assert_eq!(touch_level(127 * 127 * 127), 63);
        assert!(touch_level(100 * 100 * 100) > touch_level(50 * 100 * 100));
    }

    #[test]
    fn test_scaled_total_level() {
        assert_eq!(scaled_total_level(0x00, 63), 0x00);
        assert_eq!(scaled_total_level(0x00, 0), 0x3F);
        assert_eq!(scaled_total_level(0x4F, 0), 0x7F);
        assert_eq!(scaled_total_level(0x4F, 63), 0x4F);
    }

    #[test]
    fn test_reset_initialises_chip() {
        let log = RegisterLog::new();
        let factory = LoggingChipFactory::new(log.clone());
        let mut opl = OplInterface::new(Arc::new(BankSet::builtin().unwrap()));
        let config = EngineConfig {
            num_chips: 1,
            num_four_ops: 2,
            percussion_mode: true,
            high_vibrato: true,
            ..Default::default()
        };
        opl.reset(&config, &factory, &NullDiagnostics).unwrap();

        let writes = log.writes();
        assert!(writes.contains(&(0, 0x0BD, 0x60)));
        assert!(writes.contains(&(0, 0x104, 0x03)));
        assert!(writes.contains(&(0, 0x105, 1)));
        assert_eq!(opl.num_channels(), 23);
    }

    #[test]
    fn test_reset_rejects_bad_chip_count() {
        let factory = LoggingChipFactory::default();
        let mut opl = OplInterface::new(Arc::new(BankSet::builtin().unwrap()));
        let config = EngineConfig {
            num_chips: 0,
            ..Default::default()
        };
        assert!(opl.reset(&config, &factory, &NullDiagnostics).is_err());
    }

    #[test]
    fn test_note_on_and_off() {
        let (mut opl, log) = interface(&one_chip());
        opl.note_on(10, 440.0);
        opl.note_off(10);
        assert_eq!(
            log.writes(),
            vec![(0, 0x1A1, 0xB8), (0, 0x1B1, 0x21), (0, 0x1B1, 0x01)]
        );
    }

    #[test]
    fn test_percussion_note_uses_bd_register() {
        let config = EngineConfig {
            percussion_mode: true,
            ..one_chip()
        };
        let (mut opl, log) = interface(&config);
        opl.note_on(22, 440.0);
        assert_eq!(log.writes(), vec![(0, 0x0BD, 0x21)]);
        log.clear();
        opl.note_on(18, 440.0);
        assert_eq!(
            log.writes(),
            vec![(0, 0x0BD, 0x31), (0, 0x0A6, 0xB8), (0, 0x0B6, 0x01)]
        );
        log.clear();
        opl.note_off(22);
        assert_eq!(log.writes(), vec![(0, 0x0BD, 0x30)]);
    }

    #[test]
    fn test_patch_writes_operator_bytes() {
        let (mut opl, log) = interface(&one_chip());
        opl.patch(0, 0);
        let writes = log.writes();
        assert_eq!(writes.len(), 8);
        assert_eq!(writes[0], (0, 0x20, 0x01));
        assert_eq!(writes[1], (0, 0x23, 0x01));
        assert_eq!(writes[7], (0, 0xE3, 0x0F));
        assert_eq!(opl.patch_id(0), Some(0));
    }

    #[test]
    fn test_touch_scales_only_carrier_for_fm() {
        let (mut opl, log) = interface(&one_chip());
        opl.patch(0, 0);
        log.clear();
        opl.touch_level(0, 0);
        assert_eq!(log.writes(), vec![(0, 0x40, 0x4F), (0, 0x43, 0x3F)]);
    }

    #[test]
    fn test_touch_scales_both_for_additive() {
        let (mut opl, log) = interface(&one_chip());
        opl.patch(0, 9);
        log.clear();
        opl.touch_level(0, 0);
        assert_eq!(log.writes(), vec![(0, 0x40, 0x3F), (0, 0x43, 0x3F)]);
    }

    #[test]
    fn test_binary_pan_bits() {
        let (mut opl, log) = interface(&one_chip());
        opl.patch(0, 0);
        log.clear();
        opl.pan(0, 0);
        opl.pan(0, 64);
        opl.pan(0, 127);
        assert_eq!(
            log.writes(),
            vec![(0, 0xC0, 0x16), (0, 0xC0, 0x36), (0, 0xC0, 0x26)]
        );
    }

    #[test]
    fn test_ymf262_ignores_full_pan_request() {
        let config = EngineConfig {
            emulator: crate::config::EmulatorKind::Ymf262,
            full_pan: true,
            ..one_chip()
        };
        let (mut opl, log) = interface(&config);
        opl.patch(0, 0);
        log.clear();
        opl.pan(0, 0);
        opl.pan(0, 64);
        opl.pan(0, 127);

        let events = log.snapshot();
        assert!(!events
            .iter()
            .any(|e| matches!(e, crate::opl::ChipEvent::Panning { .. })));
        assert_eq!(
            log.writes(),
            vec![(0, 0xC0, 0x16), (0, 0xC0, 0x36), (0, 0xC0, 0x26)]
        );
    }

    #[test]
    fn test_smooth_pan_uses_mixer() {
        let config = EngineConfig {
            full_pan: true,
            ..one_chip()
        };
        let (mut opl, log) = interface(&config);
        opl.pan(3, 127);
        let events = log.snapshot();
        match events.last() {
            Some(crate::opl::ChipEvent::Panning { slot, left, right, .. }) => {
                assert_eq!(*slot, 3);
                assert!(left.abs() < 1e-6);
                assert!((right - 1.0).abs() < 1e-6);
            }
            other => panic!("expected panning event, got {:?}", other),
        }
    }
}
