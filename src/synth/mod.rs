//! MIDI performance state and voice allocation.
//!
//! [`MidiSynth`] is split over several files:
//! - `engine`: event dispatch, controllers and note updates
//! - `allocator`: channel scoring, eviction and evacuation
//! - `timing`: decay timers, vibrato and arpeggio

mod allocator;
pub mod controller;
pub mod engine;
pub mod occupancy;
pub mod timing;
pub mod tuning;

pub use controller::{ActiveNote, ControllerState, Update};
pub use engine::{MidiSynth, CHANNELS_PER_PORT, MAX_SAMPLES_AT_TIME};
pub use occupancy::{ChannelOccupancy, Location, UsageRecord};
