//! The MIDI event handler.
//!
//! [`MidiSynth`] owns the chips, the per-MIDI-channel controller state and
//! the per-physical-channel occupancy. Every public entry point runs to
//! completion on the caller's thread; nothing here blocks.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::bank::{percussion_role, BankSet};
use crate::config::{ConfigError, EngineConfig};
use crate::diagnostics::Diagnostics;
use crate::midi::{event_length, SYSEX, SYSEX_ESCAPE};
use crate::opl::{ChannelCategory, ChipFactory, OplInterface};

use super::controller::{ActiveNote, ControllerState, Update};
use super::occupancy::{ChannelOccupancy, Location, UsageRecord};
use super::tuning::{self, PSEUDO_FOUR_OP_DETUNE};

/// Most frames rendered between two ticks.
pub const MAX_SAMPLES_AT_TIME: usize = 512;

/// MIDI channels per port.
pub const CHANNELS_PER_PORT: usize = 16;

/// Converts MIDI events into OPL3 register writes.
pub struct MidiSynth {
    pub(super) config: EngineConfig,
    pub(super) bank: Arc<BankSet>,
    pub(super) opl: OplInterface,
    factory: Box<dyn ChipFactory>,
    pub(super) diagnostics: Box<dyn Diagnostics>,
    pub(super) channels: Vec<ControllerState>,
    pub(super) occupancy: Vec<ChannelOccupancy>,
    pub(super) arpeggio_counter: usize,
    /// Sub-millisecond audio time not yet applied to the decay timers.
    pub(super) age_remainder_ms: f64,
    bank_warnings: BTreeSet<u32>,
    missing_warnings: BTreeSet<usize>,
}

impl MidiSynth {
    /// Builds the chips and resets them.
    ///
    /// # Arguments
    ///
    /// * `config` - Engine configuration
    /// * `bank` - Instrument tables
    /// * `factory` - Creates one chip per configured chip
    /// * `diagnostics` - Receives messages and note illustrations
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid for the
    /// bank set.
    pub fn new(
        config: EngineConfig,
        bank: Arc<BankSet>,
        factory: Box<dyn ChipFactory>,
        diagnostics: Box<dyn Diagnostics>,
    ) -> Result<Self, ConfigError> {
        let mut synth = Self {
            config,
            opl: OplInterface::new(Arc::clone(&bank)),
            bank,
            factory,
            diagnostics,
            channels: Vec::new(),
            occupancy: Vec::new(),
            arpeggio_counter: 0,
            age_remainder_ms: 0.0,
            bank_warnings: BTreeSet::new(),
            missing_warnings: BTreeSet::new(),
        };
        synth.reset()?;
        Ok(synth)
    }

    /// Recreates the chips and forgets every note and controller.
    ///
    /// Leaves a single port of 16 MIDI channels.
    pub fn reset(&mut self) -> Result<(), ConfigError> {
        self.opl
            .reset(&self.config, self.factory.as_ref(), self.diagnostics.as_ref())?;
        self.occupancy = vec![ChannelOccupancy::default(); self.opl.num_channels()];
        self.age_remainder_ms = 0.0;
        self.channels.clear();
        self.set_num_ports(1);
        Ok(())
    }

    /// Switches to a new configuration and resets.
    ///
    /// The current configuration stays in effect if the new one is invalid.
    pub fn reset_with(&mut self, config: EngineConfig) -> Result<(), ConfigError> {
        config.validate(&self.bank)?;
        self.config = config;
        self.reset()
    }

    /// Makes `ports * 16` MIDI channels addressable. Never shrinks.
    pub fn set_num_ports(&mut self, ports: usize) {
        let wanted = ports * CHANNELS_PER_PORT;
        if self.channels.len() >= wanted {
            return;
        }
        let initial_bank = if self.config.allow_bank_switch {
            u8::try_from(self.config.bank).unwrap_or_else(|_| {
                tracing::warn!(
                    bank = self.config.bank,
                    "bank does not fit Bank LSB, new channels start on bank 0"
                );
                0
            })
        } else {
            0
        };
        while self.channels.len() < wanted {
            self.diagnostics
                .illustrate_patch_change(self.channels.len(), None, None);
            self.channels.push(ControllerState::new(initial_bank));
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bank_set(&self) -> &Arc<BankSet> {
        &self.bank
    }

    pub fn opl(&self) -> &OplInterface {
        &self.opl
    }

    /// Number of addressable MIDI channels.
    pub fn num_midi_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_physical_channels(&self) -> usize {
        self.occupancy.len()
    }

    pub fn controller(&self, midi_channel: usize) -> Option<&ControllerState> {
        self.channels.get(midi_channel)
    }

    pub fn active_note(&self, midi_channel: usize, note: u8) -> Option<&ActiveNote> {
        self.channels
            .get(midi_channel)
            .and_then(|channel| channel.active_notes.get(&note))
    }

    pub fn occupancy(&self, channel: usize) -> &ChannelOccupancy {
        &self.occupancy[channel]
    }

    pub fn diagnostics(&self) -> &dyn Diagnostics {
        self.diagnostics.as_ref()
    }

    /// Renders interleaved stereo audio, ticking the engine after every
    /// chunk of at most [`MAX_SAMPLES_AT_TIME`] frames.
    pub fn update(&mut self, buffer: &mut [f32]) {
        let rate = self.config.sample_rate.max(1) as f64;
        for chunk in buffer.chunks_mut(MAX_SAMPLES_AT_TIME * 2) {
            self.opl.update(chunk);
            self.tick((chunk.len() / 2) as f64 / rate);
        }
    }

    /// Applies one MIDI message received on `port`.
    ///
    /// SysEx is reported and ignored. Messages for unknown channels or
    /// shorter than their kind requires are dropped.
    pub fn handle_event(&mut self, port: usize, data: &[u8]) {
        let Some(&status) = data.first() else {
            return;
        };
        if status == SYSEX || status == SYSEX_ESCAPE {
            self.diagnostics
                .print_line(&format!("SysEx {:02X}: {} bytes", status, data.len()));
            return;
        }
        let midi_channel = port * CHANNELS_PER_PORT + (status & 0x0F) as usize;
        if midi_channel >= self.channels.len() || data.len() < 1 + event_length(status) {
            return;
        }
        match status >> 4 {
            0x8 => self.note_off(midi_channel, data[1]),
            0x9 => self.note_on(midi_channel, data[1], data[2]),
            0xA => self.note_touch(midi_channel, data[1], data[2]),
            0xB => self.controller_change(midi_channel, data[1], data[2]),
            0xC => self.patch_change(midi_channel, data[1]),
            0xD => self.channel_aftertouch(midi_channel, data[1]),
            0xE => self.pitch_bend(midi_channel, data[1], data[2]),
            _ => {}
        }
    }

    /// Bank a MIDI channel currently plays from.
    fn current_bank(&mut self, midi_channel: usize) -> usize {
        let channel = &self.channels[midi_channel];
        if self.config.allow_bank_switch {
            let bank = channel.bank_lsb as usize;
            return if bank < self.bank.len() { bank } else { 0 };
        }
        let (msb, lsb) = (channel.bank_msb, channel.bank_lsb);
        if msb != 0 && self.bank_warnings.insert(256 * msb as u32) {
            self.diagnostics
                .print_line(&format!("[{}]Bank {} undefined", midi_channel, msb));
        }
        if lsb != 0 && self.bank_warnings.insert(65536 * lsb as u32) {
            self.diagnostics
                .print_line(&format!("[{}]Bank lsb {} undefined", midi_channel, lsb));
        }
        self.config.bank
    }

    fn note_off(&mut self, midi_channel: usize, note: u8) {
        if self.channels[midi_channel].active_notes.contains_key(&note) {
            self.note_update(midi_channel, note, Update::OFF, None);
        }
    }

    fn note_on(&mut self, midi_channel: usize, note: u8, velocity: u8) {
        // Release first in case the previous note-off went missing.
        self.note_off(midi_channel, note);
        if velocity == 0 {
            return;
        }

        let program = if midi_channel % CHANNELS_PER_PORT == 9 {
            128 + note as usize
        } else {
            self.channels[midi_channel].patch as usize
        };
        let bank_index = self.current_bank(midi_channel);
        let instrument = self.bank.resolve(bank_index, program);
        self.diagnostics
            .illustrate_patch_change(midi_channel, Some(program), Some(instrument));

        let bank = Arc::clone(&self.bank);
        let meta = bank.instrument(instrument);
        let tone = meta.resolve_tone(note);
        let role = percussion_role(program);
        let mut patches = [meta.primary, meta.secondary];
        if self.config.percussion_mode && role.is_some() {
            patches[1] = patches[0];
        }

        if meta.no_sound && self.missing_warnings.insert(program) {
            self.diagnostics.print_line(&format!(
                "[{}]Playing missing instrument {}",
                midi_channel, program
            ));
        }

        let expected = match role {
            Some(role) if self.config.percussion_mode => ChannelCategory::Percussion(role),
            _ => ChannelCategory::Plain,
        };

        let mut chosen: [Option<usize>; 2] = [None, None];
        for slot in 0..2 {
            if slot == 1 && (patches[0] == patches[1] || chosen[0].is_none()) {
                break;
            }
            let Some(channel) =
                self.best_channel(slot, patches, meta.pseudo_four_op, expected, chosen[0])
            else {
                continue;
            };
            self.prepare_channel_for_new_note(channel, patches[slot]);
            chosen[slot] = Some(channel);
        }

        if chosen.iter().all(Option::is_none) {
            tracing::debug!(midi_channel, note, program, "no channel for note");
            return;
        }

        let phys = chosen
            .iter()
            .zip(patches)
            .filter_map(|(channel, patch)| channel.map(|c| (c, patch)))
            .collect();
        self.channels[midi_channel].active_notes.insert(
            note,
            ActiveNote {
                pressure: velocity,
                tone,
                program,
                instrument,
                phys,
            },
        );
        self.note_update(midi_channel, note, Update::ALL | Update::PATCH, None);
    }

    fn note_touch(&mut self, midi_channel: usize, note: u8, pressure: u8) {
        if let Some(active) = self.channels[midi_channel].active_notes.get_mut(&note) {
            active.pressure = pressure;
            self.note_update(midi_channel, note, Update::VOLUME, None);
        }
    }

    fn patch_change(&mut self, midi_channel: usize, program: u8) {
        let bank = self.current_bank(midi_channel);
        self.channels[midi_channel].patch = program;
        let instrument = self.bank.resolve(bank, program as usize);
        self.diagnostics
            .illustrate_patch_change(midi_channel, Some(program as usize), Some(instrument));
    }

    fn channel_aftertouch(&mut self, midi_channel: usize, pressure: u8) {
        for active in self.channels[midi_channel].active_notes.values_mut() {
            active.pressure = pressure;
        }
        self.note_update_all(midi_channel, Update::VOLUME);
    }

    fn pitch_bend(&mut self, midi_channel: usize, lsb: u8, msb: u8) {
        let channel = &mut self.channels[midi_channel];
        channel.bend = tuning::pitch_bend(lsb, msb, channel.bend_sensitivity);
        self.note_update_all(midi_channel, Update::PITCH);
    }

    fn controller_change(&mut self, midi_channel: usize, controller: u8, value: u8) {
        match controller {
            1 => self.channels[midi_channel].vibrato = value,
            0 => self.channels[midi_channel].bank_msb = value,
            32 => {
                if self.config.allow_bank_switch {
                    let line = match self.bank.bank_name(value as usize) {
                        Some(name) => {
                            format!("[{}] Using bank {} '{}'", midi_channel, value, name)
                        }
                        None => format!("[{}] Using undefined bank {}", midi_channel, value),
                    };
                    self.diagnostics.print_line(&line);
                }
                self.channels[midi_channel].bank_lsb = value;
            }
            5 => {
                let channel = &mut self.channels[midi_channel];
                channel.portamento = (channel.portamento & 0x7F) | ((value as u16) << 7);
                self.update_portamento(midi_channel);
            }
            37 => {
                let channel = &mut self.channels[midi_channel];
                channel.portamento = (channel.portamento & 0x3F80) | value as u16;
                self.update_portamento(midi_channel);
            }
            // Portamento on/off.
            65 => {}
            7 => {
                self.channels[midi_channel].volume = value;
                self.note_update_all(midi_channel, Update::VOLUME);
            }
            64 => {
                self.channels[midi_channel].sustain = value;
                if value == 0 {
                    self.kill_sustaining_notes(Some(midi_channel), None);
                }
            }
            11 => {
                self.channels[midi_channel].expression = value;
                self.note_update_all(midi_channel, Update::VOLUME);
            }
            10 => {
                self.channels[midi_channel].panning = value;
                self.note_update_all(midi_channel, Update::PAN);
            }
            120 => {
                self.note_update_all(midi_channel, Update::OFF);
                self.kill_sustaining_notes(Some(midi_channel), None);
            }
            121 => {
                self.channels[midi_channel].reset_controllers();
                self.update_portamento(midi_channel);
                self.note_update_all(midi_channel, Update::ALL);
                self.kill_sustaining_notes(Some(midi_channel), None);
            }
            123 => self.note_update_all(midi_channel, Update::OFF),
            // Effect depths and the Duke3D bender controller.
            91..=95 | 113 => {}
            98 | 99 | 100 | 101 => {
                let channel = &mut self.channels[midi_channel];
                if controller % 2 == 0 {
                    channel.rpn_lsb = value;
                } else {
                    channel.rpn_msb = value;
                }
                channel.nrpn = controller < 100;
            }
            6 => self.set_rpn(midi_channel, value, true),
            38 => self.set_rpn(midi_channel, value, false),
            _ => self.diagnostics.print_line(&format!(
                "Ctrl {} <- {} (ch {})",
                controller, value, midi_channel
            )),
        }
    }

    /// Applies a data-entry value to the latched (N)RPN.
    fn set_rpn(&mut self, midi_channel: usize, value: u8, msb: bool) {
        let channel = &mut self.channels[midi_channel];
        let address = (channel.rpn_msb as u16) << 8 | channel.rpn_lsb as u16;
        match (channel.nrpn, msb, address) {
            (false, true, 0x0000) => channel.bend_sensitivity = tuning::bend_sensitivity(value),
            (true, true, 0x0108) => channel.vibrato_speed = tuning::vibrato_speed(value),
            (true, true, 0x0109) => channel.vibrato_depth = tuning::vibrato_depth(value),
            (true, true, 0x010A) => channel.vibrato_delay = tuning::vibrato_delay(value),
            (nrpn, msb, address) => self.diagnostics.print_line(&format!(
                "{} {:04X} <- {} ({}SB) (ch {})",
                if nrpn { "NRPN" } else { "RPN" },
                address,
                value,
                if msb { 'M' } else { 'L' },
                midi_channel
            )),
        }
    }

    fn update_portamento(&mut self, midi_channel: usize) {
        let portamento = self.channels[midi_channel].portamento;
        if portamento != 0 {
            self.diagnostics.print_line(&format!(
                "Portamento {}: {} (unimplemented)",
                midi_channel, portamento
            ));
        }
    }

    /// Runs [`MidiSynth::note_update`] on every active note of a channel.
    pub(super) fn note_update_all(&mut self, midi_channel: usize, mask: Update) {
        let notes: Vec<u8> = self.channels[midi_channel]
            .active_notes
            .keys()
            .copied()
            .collect();
        for note in notes {
            self.note_update(midi_channel, note, mask, None);
        }
    }

    /// Pushes an active note's state to its physical channels.
    ///
    /// With `only` set, just that physical channel is touched. A note that
    /// loses its last physical channel is forgotten.
    pub(super) fn note_update(
        &mut self,
        midi_channel: usize,
        note: u8,
        mask: Update,
        only: Option<usize>,
    ) {
        let Some(active) = self.channels[midi_channel].active_notes.get(&note) else {
            return;
        };
        let (tone, pressure, program) = (active.tone, active.pressure, active.program);
        let targets: Vec<(usize, u16)> = active
            .phys
            .iter()
            .filter(|(&channel, _)| only.map_or(true, |c| c == channel))
            .map(|(&channel, &patch)| (channel, patch))
            .collect();

        let bank = Arc::clone(&self.bank);
        let meta = bank.instrument(active.instrument);
        let location = Location::new(midi_channel, note);
        let controller = &self.channels[midi_channel];
        let sustain_held = controller.sustain_held();
        let panning = controller.panning;
        let volume = controller.combined_volume(pressure);
        let bend = controller.bend;
        let vibrato = if controller.vibrato != 0 {
            Some((
                controller.vibrato_delay,
                controller.vibrato as f64
                    * controller.vibrato_depth
                    * controller.vibrato_phase.sin(),
            ))
        } else {
            None
        };

        if mask.contains(Update::PATCH) {
            for &(channel, patch) in &targets {
                self.opl.patch(channel, patch);
                self.occupancy[channel].users.insert(
                    location,
                    UsageRecord {
                        sustained: false,
                        patch,
                        kon_time_until_neglible: meta.ms_sound_kon,
                        vib_delay: 0,
                    },
                );
            }
        }

        let mut released = Vec::new();
        for &(channel, patch) in &targets {
            if mask.contains(Update::OFF) {
                if sustain_held {
                    if let Some(record) = self.occupancy[channel].users.get_mut(&location) {
                        record.sustained = true;
                    }
                    self.diagnostics
                        .illustrate_note(channel, tone, program, -1, 0.0);
                } else {
                    let occupancy = &mut self.occupancy[channel];
                    occupancy.users.remove(&location);
                    self.diagnostics
                        .illustrate_note(channel, tone, program, 0, 0.0);
                    if occupancy.is_empty() {
                        self.opl.note_off(channel);
                        occupancy.koff_time_until_neglible = meta.ms_sound_koff;
                    }
                }
                released.push(channel);
                continue;
            }
            if mask.contains(Update::PAN) {
                self.opl.pan(channel, panning);
            }
            if mask.contains(Update::VOLUME) {
                self.opl.touch(channel, volume);
            }
            if mask.contains(Update::PITCH) {
                let record = self.occupancy[channel].users.get(&location).copied();
                if record.map_or(false, |r| r.sustained) {
                    continue;
                }
                let vib_delay = record.map_or(0, |r| r.vib_delay);
                let mut note_bend = bend + bank.patch(patch).finetune as f64;
                let phase = if meta.pseudo_four_op && patch == meta.secondary {
                    PSEUDO_FOUR_OP_DETUNE
                } else {
                    0.0
                };
                if let Some((delay, offset)) = vibrato {
                    if vib_delay >= delay {
                        note_bend += offset;
                    }
                }
                self.opl
                    .note_on(channel, tuning::tone_to_hertz(tone as f64, note_bend, phase));
                self.diagnostics
                    .illustrate_note(channel, tone, program, pressure as i32, bend);
            }
        }

        let notes = &mut self.channels[midi_channel].active_notes;
        let orphaned = match notes.get_mut(&note) {
            Some(active) => {
                for channel in released {
                    active.phys.remove(&channel);
                }
                active.phys.is_empty()
            }
            None => false,
        };
        if orphaned {
            notes.remove(&note);
        }
    }
}
