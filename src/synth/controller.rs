//! Per-MIDI-channel performance state.

use std::collections::BTreeMap;
use std::ops::BitOr;

use super::tuning::{DEFAULT_BEND_SENSITIVITY, DEFAULT_VIBRATO_DEPTH, DEFAULT_VIBRATO_SPEED};

/// Default pan position after reset.
pub const DEFAULT_PANNING: u8 = 0x30;

/// Default channel volume and expression.
pub const DEFAULT_VOLUME: u8 = 100;

/// A sounding MIDI note and the physical channels rendering it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveNote {
    /// Velocity or latest aftertouch pressure.
    pub pressure: u8,
    /// Note number after the instrument's tone override.
    pub tone: i32,
    /// Program slot the note was started with (128+ for percussion).
    pub program: usize,
    /// Instrument index the program resolved to.
    pub instrument: usize,
    /// Physical channel -> patch id playing on it.
    pub phys: BTreeMap<usize, u16>,
}

/// Controller values of one MIDI channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    pub portamento: u16,
    pub bank_lsb: u8,
    pub bank_msb: u8,
    pub patch: u8,
    pub volume: u8,
    pub expression: u8,
    pub panning: u8,
    /// Modulation wheel position.
    pub vibrato: u8,
    pub sustain: u8,
    /// Current bend in semitones.
    pub bend: f64,
    pub bend_sensitivity: f64,
    /// Vibrato phase in radians.
    pub vibrato_phase: f64,
    pub vibrato_speed: f64,
    pub vibrato_depth: f64,
    /// Milliseconds a note must have sounded before vibrato applies.
    pub vibrato_delay: i64,
    pub rpn_lsb: u8,
    pub rpn_msb: u8,
    /// Whether the latched parameter number is an NRPN.
    pub nrpn: bool,
    pub active_notes: BTreeMap<u8, ActiveNote>,
}

impl ControllerState {
    /// Creates a channel in its power-on state. `bank_lsb` is the initial
    /// bank select value.
    pub fn new(bank_lsb: u8) -> Self {
        Self {
            portamento: 0,
            bank_lsb,
            bank_msb: 0,
            patch: 0,
            volume: DEFAULT_VOLUME,
            expression: DEFAULT_VOLUME,
            panning: DEFAULT_PANNING,
            vibrato: 0,
            sustain: 0,
            bend: 0.0,
            bend_sensitivity: DEFAULT_BEND_SENSITIVITY,
            vibrato_phase: 0.0,
            vibrato_speed: DEFAULT_VIBRATO_SPEED,
            vibrato_depth: DEFAULT_VIBRATO_DEPTH,
            vibrato_delay: 0,
            rpn_lsb: 0,
            rpn_msb: 0,
            nrpn: false,
            active_notes: BTreeMap::new(),
        }
    }

    /// Applies "reset all controllers" (CC 121). Bank, program, parameter
    /// latches and active notes are kept.
    pub fn reset_controllers(&mut self) {
        self.bend = 0.0;
        self.volume = DEFAULT_VOLUME;
        self.expression = DEFAULT_VOLUME;
        self.sustain = 0;
        self.vibrato = 0;
        self.vibrato_speed = DEFAULT_VIBRATO_SPEED;
        self.vibrato_depth = DEFAULT_VIBRATO_DEPTH;
        self.vibrato_delay = 0;
        self.panning = DEFAULT_PANNING;
        self.portamento = 0;
    }

    /// Combined volume of a note on this channel, up to 127^3.
    pub fn combined_volume(&self, pressure: u8) -> u32 {
        pressure as u32 * self.volume as u32 * self.expression as u32
    }

    pub fn sustain_held(&self) -> bool {
        self.sustain != 0
    }
}

/// Which properties a note update rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Update(u8);

impl Update {
    pub const PATCH: Update = Update(0x01);
    pub const PAN: Update = Update(0x02);
    pub const VOLUME: Update = Update(0x04);
    pub const PITCH: Update = Update(0x08);
    /// Pan, volume and pitch.
    pub const ALL: Update = Update(0x0E);
    pub const OFF: Update = Update(0x20);

    pub fn contains(self, other: Update) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Update {
    type Output = Update;

    fn bitor(self, rhs: Update) -> Update {
        Update(self.0 | rhs.0)
    }
}
