//! Diagnostics sink injected into the engine.
//!
//! The engine reports human-readable messages and per-note visual cues
//! through a [`Diagnostics`] implementation instead of writing to a global
//! UI. Headless users pass [`NullDiagnostics`].

/// Receiver for engine messages and playback illustrations.
pub trait Diagnostics: Send {
    /// A line of user-facing text.
    fn print_line(&self, line: &str);

    /// A note changed on a physical channel.
    ///
    /// `pressure` is the velocity, `0` for a released note and `-1` for a
    /// note held by the sustain pedal.
    fn illustrate_note(
        &self,
        _channel: usize,
        _tone: i32,
        _program: usize,
        _pressure: i32,
        _bend: f64,
    ) {
    }

    /// Output amplitude of the left and right channels.
    fn illustrate_volumes(&self, _left: f64, _right: f64) {}

    /// A MIDI channel switched to `program`, played by bank instrument
    /// `instrument`. Both are `None` for a channel that was just created.
    fn illustrate_patch_change(
        &self,
        _midi_channel: usize,
        _program: Option<usize>,
        _instrument: Option<usize>,
    ) {
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDiagnostics;

impl Diagnostics for NullDiagnostics {
    fn print_line(&self, _line: &str) {}
}

/// Forwards messages to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn print_line(&self, line: &str) {
        tracing::info!("{}", line);
    }

    fn illustrate_note(&self, channel: usize, tone: i32, program: usize, pressure: i32, bend: f64) {
        tracing::trace!(channel, tone, program, pressure, bend, "note");
    }

    fn illustrate_volumes(&self, left: f64, right: f64) {
        tracing::trace!(left, right, "volume");
    }

    fn illustrate_patch_change(
        &self,
        midi_channel: usize,
        program: Option<usize>,
        instrument: Option<usize>,
    ) {
        tracing::trace!(midi_channel, ?program, ?instrument, "patch change");
    }
}
