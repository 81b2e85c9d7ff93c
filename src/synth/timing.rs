//! Periodic work: decay timers, vibrato and arpeggio.

use super::controller::Update;
use super::engine::MidiSynth;

/// Ticks each user of a shared channel keeps the channel before the next
/// one takes over. More users rotate faster.
pub fn arpeggio_rate(users: usize) -> usize {
    match users {
        0..=2 => 3,
        3 => 2,
        _ => 1,
    }
}

/// Index of the user voiced on tick `counter` of a channel with `users`
/// users.
pub fn arpeggio_slot(counter: usize, users: usize) -> usize {
    (counter / arpeggio_rate(users)) % users
}

impl MidiSynth {
    /// Advances the engine by `seconds` of audio time.
    ///
    /// Decay timers count whole milliseconds; the fraction left over is
    /// carried into the next tick.
    pub fn tick(&mut self, seconds: f64) {
        let elapsed = seconds * 1000.0 + self.age_remainder_ms;
        let ms = elapsed.floor();
        self.age_remainder_ms = elapsed - ms;
        let ms = ms as i64;
        for occupancy in &mut self.occupancy {
            occupancy.add_age(ms);
        }
        self.update_vibrato(seconds);
        self.update_arpeggio();
    }

    fn update_vibrato(&mut self, seconds: f64) {
        for midi_channel in 0..self.channels.len() {
            let channel = &self.channels[midi_channel];
            if channel.vibrato != 0 && !channel.active_notes.is_empty() {
                self.note_update_all(midi_channel, Update::PITCH);
                let channel = &mut self.channels[midi_channel];
                channel.vibrato_phase += seconds * channel.vibrato_speed;
            } else {
                self.channels[midi_channel].vibrato_phase = 0.0;
            }
        }
    }

    /// Gives one user of every shared channel the hardware for this tick.
    ///
    /// A selected user that has fully decayed is released and the channel
    /// is checked again.
    fn update_arpeggio(&mut self) {
        self.arpeggio_counter = self.arpeggio_counter.wrapping_add(1);
        for channel in 0..self.occupancy.len() {
            loop {
                let users = self.occupancy[channel].users.len();
                if users <= 1 {
                    break;
                }
                let slot = arpeggio_slot(self.arpeggio_counter, users);
                let Some((location, record)) = self.occupancy[channel]
                    .users
                    .iter()
                    .nth(slot)
                    .map(|(&location, &record)| (location, record))
                else {
                    break;
                };
                if record.sustained {
                    break;
                }
                if record.kon_time_until_neglible <= 0 {
                    self.note_update(
                        location.midi_channel,
                        location.note,
                        Update::OFF,
                        Some(channel),
                    );
                    let orphaned = self.occupancy[channel]
                        .users
                        .get(&location)
                        .map_or(false, |r| !r.sustained);
                    if orphaned {
                        // No active note owned the record, so the release did nothing.
                        self.occupancy[channel].users.remove(&location);
                    }
                    continue;
                }
                self.note_update(
                    location.midi_channel,
                    location.note,
                    Update::PITCH | Update::VOLUME | Update::PAN,
                    Some(channel),
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::engine::tests::{hosts, plain_config, synth_with};
    use std::collections::BTreeSet;

    #[test]
    fn test_arpeggio_rate() {
        assert_eq!(arpeggio_rate(2), 3);
        assert_eq!(arpeggio_rate(3), 2);
        assert_eq!(arpeggio_rate(4), 1);
        assert_eq!(arpeggio_rate(9), 1);
    }

    #[test]
    fn test_arpeggio_slot_visits_every_user() {
        for users in 2..8 {
            for start in 0..20 {
                let span = users * arpeggio_rate(users);
                let seen: BTreeSet<usize> = (start..start + span)
                    .map(|counter| arpeggio_slot(counter, users))
                    .collect();
                assert_eq!(seen.len(), users);
            }
        }
    }

    /// Fills all plain channels with organ notes plus one extra that has to
    /// share channel 0.
    fn shared_channel_synth() -> (MidiSynth, crate::opl::RegisterLog) {
        let (mut synth, log) = synth_with(plain_config());
        synth.handle_event(0, &[0xC1, 16]);
        for note in 40..59 {
            synth.handle_event(0, &[0x91, note, 100]);
        }
        assert_eq!(hosts(&synth, 1, 58), vec![0]);
        log.clear();
        (synth, log)
    }

    #[test]
    fn test_arpeggio_voices_every_shared_note() {
        let (mut synth, log) = shared_channel_synth();
        for _ in 0..6 {
            synth.tick(0.001);
        }
        let frequencies: BTreeSet<u8> = log
            .writes()
            .iter()
            .filter(|&&(_, reg, _)| reg == 0xA0)
            .map(|&(_, _, value)| value)
            .collect();
        assert_eq!(frequencies.len(), 2);
        // Unshared channels are left alone.
        assert!(log.writes().iter().all(|&(_, reg, _)| reg & 0x0F == 0 || reg & 0xF0 == 0x40));
    }

    #[test]
    fn test_decayed_shared_note_is_released() {
        let (mut synth, _log) = shared_channel_synth();
        synth.tick(50.0);
        assert_eq!(synth.occupancy(0).users.len(), 1);
        assert!(synth.active_note(1, 40).is_none());
        assert!(synth.active_note(1, 58).is_some());
        // Unshared channels keep their decayed notes.
        assert_eq!(synth.occupancy(1).users.len(), 1);
    }

    #[test]
    fn test_vibrato_advances_phase_and_rebends() {
        let (mut synth, log) = synth_with(plain_config());
        synth.handle_event(0, &[0x90, 60, 100]);
        synth.handle_event(0, &[0xB0, 1, 127]);
        log.clear();
        synth.tick(0.05);
        let phase = synth.controller(0).unwrap().vibrato_phase;
        assert!(phase > 0.0);
        assert!(log.writes().iter().any(|&(_, reg, _)| reg == 0xA0));

        synth.handle_event(0, &[0xB0, 1, 0]);
        synth.tick(0.05);
        assert_eq!(synth.controller(0).unwrap().vibrato_phase, 0.0);
    }

    #[test]
    fn test_tick_ages_channels() {
        let (mut synth, _log) = synth_with(plain_config());
        synth.handle_event(0, &[0x90, 60, 100]);
        synth.tick(0.5);
        let record = synth.occupancy(0).users.values().next().copied().unwrap();
        assert_eq!(record.kon_time_until_neglible, 1560 - 500);
        assert_eq!(record.vib_delay, 500);
        assert_eq!(synth.occupancy(1).koff_time_until_neglible, -500);
    }

    #[test]
    fn test_tick_carries_sub_millisecond_time() {
        let (mut synth, _log) = synth_with(plain_config());
        synth.handle_event(0, &[0x90, 60, 100]);
        for _ in 0..9 {
            synth.tick(0.0005);
        }
        let record = synth.occupancy(0).users.values().next().copied().unwrap();
        assert_eq!(record.kon_time_until_neglible, 1560 - 4);
        assert_eq!(record.vib_delay, 4);
        assert!(synth.age_remainder_ms > 0.4 && synth.age_remainder_ms < 0.6);

        synth.reset().unwrap();
        assert_eq!(synth.age_remainder_ms, 0.0);
    }
}
