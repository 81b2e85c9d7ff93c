//! oplmidi - MIDI to OPL3 FM voice allocation engine.
//!
//! This library turns MIDI channel messages into register writes for one or
//! more emulated OPL3 chips, sharing the chips' limited channels between
//! the notes being played.

pub mod audio;
pub mod bank;
pub mod config;
pub mod diagnostics;
pub mod midi;
pub mod opl;
pub mod synth;

// Re-export commonly used types
pub use audio::{export_register_log, SynthLoop};
pub use bank::{BankError, BankSet};
pub use config::{ConfigError, EmulatorKind, EngineConfig};
pub use diagnostics::{Diagnostics, NullDiagnostics, TracingDiagnostics};
pub use midi::{import_events, EventQueue, TimedEvent};
pub use opl::{ChipFactory, FmChip, LoggingChipFactory, RegisterLog};
pub use synth::MidiSynth;
