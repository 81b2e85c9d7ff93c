//! Pitch and vibrato formulas.

use std::f64::consts::PI;

/// Frequency of tone 0 in Hz.
pub const BASE_HERTZ: f64 = 172.00093;

/// Natural-log frequency step per semitone.
pub const SEMITONE_STEP: f64 = 0.057762265;

/// Extra detune applied to the second voice of a pseudo four-op instrument.
pub const PSEUDO_FOUR_OP_DETUNE: f64 = 0.125;

/// Default vibrato phase speed in radians per second (5 Hz).
pub const DEFAULT_VIBRATO_SPEED: f64 = 2.0 * PI * 5.0;

/// Default vibrato depth in semitones per unit of the modulation wheel.
pub const DEFAULT_VIBRATO_DEPTH: f64 = 0.5 / 127.0;

/// Default pitch-bend sensitivity in semitones per bend unit (±2 semitones).
pub const DEFAULT_BEND_SENSITIVITY: f64 = 2.0 / 8192.0;

/// Converts a tone (MIDI note number scale) plus fractional offsets to Hz.
pub fn tone_to_hertz(tone: f64, bend: f64, phase: f64) -> f64 {
    BASE_HERTZ * (SEMITONE_STEP * (tone + bend + phase)).exp()
}

/// Vibrato speed in radians per second for an NRPN data value.
pub fn vibrato_speed(value: u8) -> f64 {
    let hertz = if value == 64 {
        1.0
    } else if value < 100 {
        1.0 / (1.6e-2 * value.max(1) as f64)
    } else {
        1.0 / (0.051153846 * value as f64 - 3.4965385)
    };
    hertz * DEFAULT_VIBRATO_SPEED
}

/// Vibrato depth in semitones for an NRPN data value (64 = none).
pub fn vibrato_depth(value: u8) -> f64 {
    (value as f64 - 64.0) * 0.15 * 0.01
}

/// Vibrato onset delay in milliseconds for an NRPN data value.
pub fn vibrato_delay(value: u8) -> i64 {
    if value == 0 {
        0
    } else {
        (0.2092 * (0.0795 * value as f64).exp()) as i64
    }
}

/// Pitch-bend sensitivity for an RPN 0 data value.
pub fn bend_sensitivity(value: u8) -> f64 {
    value as f64 / 8192.0
}

/// Pitch bend in semitones from the two data bytes of a bend event.
pub fn pitch_bend(lsb: u8, msb: u8, sensitivity: f64) -> f64 {
    (lsb as i32 + msb as i32 * 128 - 8192) as f64 * sensitivity
}
