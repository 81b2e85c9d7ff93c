//! Pull-based renderer that applies queued MIDI events at their exact
//! sample.
//!
//! The audio side calls [`SynthLoop::request_samples`] with an output
//! buffer. Rendering is split so that no chunk crosses the timestamp of the
//! next queued event, which is then applied before the following chunk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::midi::{samples_diff, samples_larger_than, EventQueue};
use crate::synth::{MidiSynth, MAX_SAMPLES_AT_TIME};

/// Amplitude reports per second.
const VOLUME_UPDATE_FREQ: u32 = 24;

/// Decibels per natural-log unit of amplitude.
const DB_PER_NEPER: f64 = 4.328085123;

/// Full scale of the amplitude meter, `3 * log2(65536)`.
const MAX_DB: f64 = 48.0;

/// Scale from float samples to the meter's integer range.
const METER_SCALE: f64 = 10240.0;

/// Rate-limits amplitude reports to about [`VOLUME_UPDATE_FREQ`] a second.
#[derive(Debug)]
struct VolumeMeter {
    countdown: u32,
}

impl VolumeMeter {
    /// Returns the left and right amplitude of `samples` when a report is
    /// due.
    fn measure(&mut self, samples: &[f32], sample_rate: u32) -> Option<(f64, f64)> {
        let frames = samples.len() / 2;
        if frames == 0 {
            return None;
        }
        if self.countdown > 0 {
            self.countdown -= 1;
            return None;
        }
        self.countdown = (sample_rate / frames as u32) / VOLUME_UPDATE_FREQ;
        Some((amplitude(samples, 0), amplitude(samples, 1)))
    }
}

/// Loudness of one interleaved channel on a 0..=1 logarithmic scale, with
/// the DC offset removed.
fn amplitude(samples: &[f32], channel: usize) -> f64 {
    let values: Vec<f64> = samples
        .iter()
        .skip(channel)
        .step_by(2)
        .map(|&s| f64::from(s))
        .collect();
    if values.is_empty() {
        return 0.0;
    }
    let count = values.len() as f64;
    let average = values.iter().sum::<f64>() / count;
    let deviation = values.iter().map(|v| (v - average).abs()).sum::<f64>() / count;
    let level = deviation * METER_SCALE;
    (level.max(1.0).ln() * DB_PER_NEPER) / MAX_DB
}

/// Drives a [`MidiSynth`] from an [`EventQueue`].
pub struct SynthLoop {
    synth: MidiSynth,
    queue: Arc<EventQueue>,
    cur_samples: u32,
    quit: Arc<AtomicBool>,
    meter: VolumeMeter,
}

impl SynthLoop {
    pub fn new(synth: MidiSynth, queue: Arc<EventQueue>) -> Self {
        Self {
            synth,
            queue,
            cur_samples: 0,
            quit: Arc::new(AtomicBool::new(false)),
            meter: VolumeMeter { countdown: 0 },
        }
    }

    /// Flag that stops rendering at the next chunk boundary once set.
    pub fn quit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.quit)
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Sample clock position of the next frame to render.
    pub fn cur_samples(&self) -> u32 {
        self.cur_samples
    }

    pub fn synth(&self) -> &MidiSynth {
        &self.synth
    }

    /// Queues an event `offset` samples after the current position.
    ///
    /// # Returns
    ///
    /// `false` if the queue rejected the message.
    pub fn push_event(&self, offset: u32, port: u8, data: &[u8]) -> bool {
        self.queue
            .push(self.cur_samples.wrapping_add(offset), port, data)
    }

    /// Fills `buffer` with interleaved stereo frames.
    ///
    /// # Arguments
    ///
    /// * `buffer` - Output, two floats per frame; cleared before rendering
    ///
    /// # Returns
    ///
    /// Number of frames rendered. Fewer than requested only when the quit
    /// flag was raised; the rest of the buffer stays silent.
    pub fn request_samples(&mut self, buffer: &mut [f32]) -> usize {
        buffer.fill(0.0);
        let count = buffer.len() / 2;
        let mut offset = 0;

        while offset < count {
            if self.quit.load(Ordering::Relaxed) {
                break;
            }
            let mut frames = (count - offset).min(MAX_SAMPLES_AT_TIME);
            if let Some(next) = self.queue.peek_timestamp() {
                frames = frames.min(samples_diff(next, self.cur_samples) as usize);
            }
            self.synth
                .update(&mut buffer[offset * 2..(offset + frames) * 2]);

            // Apply everything that is due now or already overdue.
            while let Some(next) = self.queue.peek_timestamp() {
                if samples_larger_than(self.cur_samples, next) {
                    tracing::warn!(
                        "processing event in the past {}<{}",
                        next,
                        self.cur_samples
                    );
                }
                if samples_diff(next, self.cur_samples) > 0 {
                    break;
                }
                if let Some(event) = self.queue.pop() {
                    self.synth.handle_event(event.port as usize, event.bytes());
                }
            }

            offset += frames;
            self.cur_samples = self.cur_samples.wrapping_add(frames as u32);
        }

        let sample_rate = self.synth.config().sample_rate;
        if let Some((left, right)) = self.meter.measure(&buffer[..offset * 2], sample_rate) {
            self.synth.diagnostics().illustrate_volumes(left, right);
        }
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::BankSet;
    use crate::config::EngineConfig;
    use crate::diagnostics::Diagnostics;
    use crate::opl::{ChipEvent, RegisterFileFactory};
    use crate::synth::engine::tests::{plain_config, synth_with};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct VolumeRecorder(Arc<Mutex<Vec<(f64, f64)>>>);

    impl Diagnostics for VolumeRecorder {
        fn print_line(&self, _line: &str) {}

        fn illustrate_volumes(&self, left: f64, right: f64) {
            if let Ok(mut volumes) = self.0.lock() {
                volumes.push((left, right));
            }
        }
    }

    fn is_key_on(event: &ChipEvent) -> Option<u64> {
        match *event {
            ChipEvent::Write {
                sample, reg, value, ..
            } if (0xB0..=0xB8).contains(&reg) && value & 0x20 != 0 => Some(sample),
            _ => None,
        }
    }

    #[test]
    fn test_event_applied_at_its_sample() {
        let (synth, log) = synth_with(plain_config());
        let mut synth_loop = SynthLoop::new(synth, Arc::new(EventQueue::new()));
        assert!(synth_loop.push_event(700, 0, &[0x90, 60, 100]));

        let mut buffer = vec![0.0f32; 1024 * 2];
        assert_eq!(synth_loop.request_samples(&mut buffer), 1024);
        assert_eq!(synth_loop.cur_samples(), 1024);
        assert!(synth_loop.queue().is_empty());

        let key_ons: Vec<u64> = log.snapshot().iter().filter_map(is_key_on).collect();
        assert_eq!(key_ons, vec![700]);
        assert!(synth_loop.synth().active_note(0, 60).is_some());
    }

    #[test]
    fn test_events_beyond_buffer_stay_queued() {
        let (synth, _log) = synth_with(plain_config());
        let mut synth_loop = SynthLoop::new(synth, Arc::new(EventQueue::new()));
        synth_loop.push_event(3000, 0, &[0x90, 60, 100]);

        let mut buffer = vec![0.0f32; 2000 * 2];
        assert_eq!(synth_loop.request_samples(&mut buffer), 2000);
        assert_eq!(synth_loop.queue().len(), 1);
        assert!(synth_loop.synth().active_note(0, 60).is_none());

        synth_loop.request_samples(&mut buffer);
        assert!(synth_loop.synth().active_note(0, 60).is_some());
    }

    #[test]
    fn test_overdue_event_applied_immediately() {
        let (synth, _log) = synth_with(plain_config());
        let mut synth_loop = SynthLoop::new(synth, Arc::new(EventQueue::new()));
        let mut buffer = vec![0.0f32; 100 * 2];
        synth_loop.request_samples(&mut buffer);

        synth_loop.queue().push(50, 0, &[0x90, 64, 100]);
        synth_loop.request_samples(&mut buffer[..20]);
        assert!(synth_loop.synth().active_note(0, 64).is_some());
        assert_eq!(synth_loop.cur_samples(), 110);
    }

    #[test]
    fn test_quit_flag_stops_rendering() {
        let (synth, _log) = synth_with(plain_config());
        let mut synth_loop = SynthLoop::new(synth, Arc::new(EventQueue::new()));
        synth_loop.quit_flag().store(true, Ordering::Relaxed);

        let mut buffer = vec![1.0f32; 64];
        assert_eq!(synth_loop.request_samples(&mut buffer), 0);
        assert_eq!(synth_loop.cur_samples(), 0);
        assert!(buffer.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_volume_reports_are_rate_limited() {
        let recorder = VolumeRecorder::default();
        let synth = MidiSynth::new(
            EngineConfig::default(),
            Arc::new(BankSet::builtin().unwrap()),
            Box::new(RegisterFileFactory),
            Box::new(recorder.clone()),
        )
        .unwrap();
        let mut synth_loop = SynthLoop::new(synth, Arc::new(EventQueue::new()));

        let mut buffer = vec![0.0f32; 512 * 2];
        for _ in 0..6 {
            synth_loop.request_samples(&mut buffer);
        }
        // 49716 / 512 / 24 leaves four silent calls between reports.
        let volumes = recorder.0.lock().unwrap().clone();
        assert_eq!(volumes, vec![(0.0, 0.0), (0.0, 0.0)]);
    }

    #[test]
    fn test_amplitude() {
        let silent = vec![0.25f32; 64];
        assert_eq!(amplitude(&silent, 0), 0.0);

        let square: Vec<f32> = (0..64)
            .flat_map(|i| [if i % 2 == 0 { 0.5 } else { -0.5 }, 0.0])
            .collect();
        let left = amplitude(&square, 0);
        assert!(left > 0.7 && left < 0.8, "{}", left);
        assert_eq!(amplitude(&square, 1), 0.0);
    }
}
