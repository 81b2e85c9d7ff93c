//! Rendering on top of the MIDI engine.
//!
//! This module provides:
//! - [`SynthLoop`], which applies queued events at their exact sample
//! - Register-log export of a whole performance

pub mod export;
pub mod synth_loop;

pub use export::{export_register_log, write_register_log};
pub use synth_loop::SynthLoop;
