//! Register-log export.
//!
//! Plays a list of timed MIDI events through the engine with logging chips
//! and writes every chip reset, register write and panning change as one
//! text line, stamped with the sample at which it happened.

use crate::bank::BankSet;
use crate::config::EngineConfig;
use crate::diagnostics::TracingDiagnostics;
use crate::midi::{EventQueue, TimedEvent};
use crate::opl::{ChipEvent, LoggingChipFactory, RegisterLog};
use crate::synth::MidiSynth;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use super::SynthLoop;

/// Frames rendered between two log flushes.
const RENDER_BUFFER_SIZE: usize = 4096;

/// Seconds rendered after the last event so releases reach the log.
const TAIL_SECONDS: f64 = 2.0;

/// Exports the chip activity of a performance to a text file.
///
/// # Arguments
///
/// * `events` - Time-ordered MIDI events, e.g. from
///   [`import_events`](crate::midi::import_events)
/// * `config` - Engine configuration
/// * `bank` - Instrument tables
/// * `output_path` - Path for the output log
/// * `progress_callback` - Optional callback for progress updates (0.0 to 1.0)
///
/// # Returns
///
/// Number of chip events written
///
/// # Errors
///
/// Returns error if:
/// - The configuration is invalid for the bank set
/// - Output file cannot be created or written
pub fn export_register_log<P, F>(
    events: &[TimedEvent],
    config: EngineConfig,
    bank: Arc<BankSet>,
    output_path: P,
    progress_callback: Option<F>,
) -> Result<usize>
where
    P: AsRef<Path>,
    F: FnMut(f32),
{
    let file = File::create(output_path.as_ref()).with_context(|| {
        format!(
            "Failed to create register log: {}",
            output_path.as_ref().display()
        )
    })?;
    let mut writer = BufWriter::new(file);
    let written = write_register_log(events, config, bank, &mut writer, progress_callback)?;
    writer.flush().context("Failed to flush register log")?;
    Ok(written)
}

/// Renders `events` and writes the chip log to `out`.
///
/// See [`export_register_log`].
pub fn write_register_log<W, F>(
    events: &[TimedEvent],
    config: EngineConfig,
    bank: Arc<BankSet>,
    out: &mut W,
    mut progress_callback: Option<F>,
) -> Result<usize>
where
    W: Write,
    F: FnMut(f32),
{
    let sample_rate = f64::from(config.sample_rate.max(1));
    let log = RegisterLog::new();
    let synth = MidiSynth::new(
        config,
        bank,
        Box::new(LoggingChipFactory::new(log.clone())),
        Box::new(TracingDiagnostics),
    )
    .context("Failed to configure the synthesizer")?;
    let mut synth_loop = SynthLoop::new(synth, Arc::new(EventQueue::new()));

    let duration_seconds = events.last().map_or(0.0, |e| e.time) + TAIL_SECONDS;
    let total_samples = (duration_seconds * sample_rate) as u64;

    let mut buffer = vec![0.0f32; RENDER_BUFFER_SIZE * 2];
    let mut current_sample: u64 = 0;
    let mut event_idx = 0;
    let mut written = 0;

    written += write_events(out, log.take())?;

    while current_sample < total_samples {
        let frames = (total_samples - current_sample).min(RENDER_BUFFER_SIZE as u64) as usize;
        let window_end = current_sample + frames as u64;

        // Only queue what falls inside this window so the 32-bit clock
        // never sees timestamps more than one window ahead.
        while event_idx < events.len() {
            let event = &events[event_idx];
            let at = (event.time.max(0.0) * sample_rate) as u64;
            if at >= window_end {
                break;
            }
            if !synth_loop.queue().push(at as u32, event.port, &event.data) {
                tracing::debug!(bytes = event.data.len(), "skipped unqueueable event");
            }
            event_idx += 1;
        }

        let rendered = synth_loop.request_samples(&mut buffer[..frames * 2]);
        current_sample += rendered as u64;
        written += write_events(out, log.take())?;

        if let Some(ref mut callback) = progress_callback {
            callback(current_sample as f32 / total_samples as f32);
        }
        if rendered < frames {
            break;
        }
    }

    tracing::info!(events = events.len(), chip_events = written, "register log written");
    Ok(written)
}

fn write_events<W: Write>(out: &mut W, events: Vec<ChipEvent>) -> Result<usize> {
    for event in &events {
        writeln!(out, "{}", event).context("Failed to write register log")?;
    }
    Ok(events.len())
}
