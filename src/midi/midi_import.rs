//! Standard MIDI File (SMF) import.
//!
//! Flattens a .mid file into a single time-ordered list of raw channel
//! messages that can be fed to the event queue. Supports SMF Format 0
//! (single track) and Format 1 (parallel tracks) with metrical timing.
//!
//! # Behavior
//!
//! - Tempo changes from any track apply to all tracks (the usual Format 1
//!   convention puts them in the first track)
//! - A `MidiPort` meta event routes the rest of its track to that port
//! - Channel messages are re-encoded without running status
//! - SysEx, escapes and other meta events are skipped

use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use std::fs;
use std::path::Path;

/// Microseconds per quarter note until the first tempo event.
const DEFAULT_TEMPO_USEC: u32 = 500_000;

/// Errors that can occur during MIDI import.
#[derive(Debug, thiserror::Error)]
pub enum MidiImportError {
    /// File could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// MIDI parsing failed
    #[error("MIDI parse error: {0}")]
    Parse(String),
    /// Unsupported MIDI format or timing
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// A channel message at an absolute time.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedEvent {
    /// Seconds from the start of the file.
    pub time: f64,
    /// Output port selected by the track's `MidiPort` meta event.
    pub port: u8,
    /// Status byte followed by its data bytes.
    pub data: Vec<u8>,
}

/// What happens at one tick of one track.
enum Item {
    Tempo(u32),
    Message { port: u8, data: Vec<u8> },
}

/// Imports a MIDI file as a flat list of timed events.
///
/// # Arguments
///
/// * `path` - Path to the .mid or .midi file
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed, or uses a format
/// that cannot be flattened
pub fn import_events<P: AsRef<Path>>(path: P) -> Result<Vec<TimedEvent>, MidiImportError> {
    let data = fs::read(path.as_ref())?;
    parse_events(&data)
}

/// Parses SMF bytes into a flat list of timed events, sorted by time.
///
/// Events at the same time keep track order, then file order.
///
/// # Errors
///
/// Returns error on malformed data, SMPTE timecode timing or Format 2
/// (sequential) files
pub fn parse_events(data: &[u8]) -> Result<Vec<TimedEvent>, MidiImportError> {
    let smf = Smf::parse(data).map_err(|e| MidiImportError::Parse(e.to_string()))?;

    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(tpb) => u32::from(tpb.as_int()),
        Timing::Timecode(_, _) => {
            return Err(MidiImportError::UnsupportedFormat(
                "SMPTE timecode timing not supported".to_string(),
            ))
        }
    };
    if ticks_per_beat == 0 {
        return Err(MidiImportError::Parse("zero ticks per beat".to_string()));
    }

    match smf.header.format {
        Format::SingleTrack | Format::Parallel => {}
        Format::Sequential => {
            return Err(MidiImportError::UnsupportedFormat(
                "Format 2 (sequential) MIDI files not supported".to_string(),
            ))
        }
    }

    // (tick, track, index within track, item)
    let mut items: Vec<(u64, usize, usize, Item)> = Vec::new();
    for (track_idx, track) in smf.tracks.iter().enumerate() {
        let mut tick: u64 = 0;
        let mut port: u8 = 0;
        for (event_idx, event) in track.iter().enumerate() {
            tick += u64::from(event.delta.as_int());
            let item = match event.kind {
                TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => Item::Tempo(tempo.as_int()),
                TrackEventKind::Meta(MetaMessage::MidiPort(p)) => {
                    port = p.as_int();
                    continue;
                }
                TrackEventKind::Midi { channel, message } => Item::Message {
                    port,
                    data: encode_message(channel.as_int(), message),
                },
                _ => continue,
            };
            items.push((tick, track_idx, event_idx, item));
        }
    }
    items.sort_by_key(|&(tick, track_idx, event_idx, _)| (tick, track_idx, event_idx));

    let mut events = Vec::new();
    let mut usec_per_beat = DEFAULT_TEMPO_USEC;
    let mut last_tick: u64 = 0;
    let mut seconds = 0.0;
    for (tick, _, _, item) in items {
        seconds += ticks_to_seconds(tick - last_tick, usec_per_beat, ticks_per_beat);
        last_tick = tick;
        match item {
            Item::Tempo(tempo) if tempo > 0 => usec_per_beat = tempo,
            Item::Tempo(_) => {}
            Item::Message { port, data } => events.push(TimedEvent {
                time: seconds,
                port,
                data,
            }),
        }
    }

    tracing::debug!(
        tracks = smf.tracks.len(),
        events = events.len(),
        "imported MIDI file"
    );
    Ok(events)
}

/// Converts a tick span to seconds at a fixed tempo.
fn ticks_to_seconds(ticks: u64, usec_per_beat: u32, ticks_per_beat: u32) -> f64 {
    ticks as f64 * f64::from(usec_per_beat) / 1_000_000.0 / f64::from(ticks_per_beat)
}

/// Encodes a channel message with an explicit status byte.
fn encode_message(channel: u8, message: MidiMessage) -> Vec<u8> {
    let channel = channel & 0x0F;
    match message {
        MidiMessage::NoteOff { key, vel } => vec![0x80 | channel, key.as_int(), vel.as_int()],
        MidiMessage::NoteOn { key, vel } => vec![0x90 | channel, key.as_int(), vel.as_int()],
        MidiMessage::Aftertouch { key, vel } => vec![0xA0 | channel, key.as_int(), vel.as_int()],
        MidiMessage::Controller { controller, value } => {
            vec![0xB0 | channel, controller.as_int(), value.as_int()]
        }
        MidiMessage::ProgramChange { program } => vec![0xC0 | channel, program.as_int()],
        MidiMessage::ChannelAftertouch { vel } => vec![0xD0 | channel, vel.as_int()],
        MidiMessage::PitchBend { bend } => {
            let raw = bend.0.as_int();
            vec![0xE0 | channel, (raw & 0x7F) as u8, (raw >> 7) as u8]
        }
    }
}
