//! MIDI byte framing, the sample-clock event queue and Standard MIDI File
//! import.
//!
//! Everything downstream of this module works on raw MIDI bytes: a status
//! byte followed by up to two data bytes, tagged with the port it arrived
//! on. Ports multiply the sixteen MIDI channels, so port 1 channel 0 is
//! logical channel 16.

mod midi_import;
mod queue;

pub use midi_import::{import_events, parse_events, MidiImportError, TimedEvent};
pub use queue::{samples_diff, samples_larger_than, EventQueue, QueuedEvent, MAX_EVENT_BYTES};

/// Status byte of a System Exclusive message.
pub const SYSEX: u8 = 0xF0;

/// Status byte of a SysEx continuation or escape packet.
pub const SYSEX_ESCAPE: u8 = 0xF7;

/// Number of data bytes that follow `status`.
///
/// # Arguments
///
/// * `status` - The first byte of a MIDI message
///
/// # Returns
///
/// 2 for note, aftertouch, controller and pitch-bend messages, 1 for program
/// change and channel aftertouch, 2 for song position, 1 for song select and
/// 0 for everything else.
pub fn event_length(status: u8) -> usize {
    match status >> 4 {
        0x8 | 0x9 | 0xA | 0xB | 0xE => 2,
        0xC | 0xD => 1,
        _ => match status {
            0xF2 => 2,
            0xF3 => 1,
            _ => 0,
        },
    }
}
