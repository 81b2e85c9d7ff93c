//! Physical channel selection, eviction and time-sharing.

use super::controller::Update;
use super::engine::MidiSynth;
use super::occupancy::Location;
use crate::opl::ChannelCategory;

/// Fixed cost of every existing user of a channel.
const USER_PENALTY: i64 = 4000;

/// Bonus for a user already playing the same patch.
const SAME_PATCH_BONUS: i64 = 300;

/// Bonus for a user playing a percussion program.
const PERCUSSION_BONUS: i64 = 50;

/// Bonus per place an existing user could be evacuated to.
const EVACUATION_BONUS: i64 = 4;

/// Program shown for notes whose active record is already gone.
const UNKNOWN_PROGRAM: usize = b'?' as usize;

impl MidiSynth {
    /// How suitable physical channel `channel` is for a new note playing
    /// `patch`. Higher is better.
    ///
    /// Idle channels score by how long ago they were released. Every user
    /// costs a flat penalty plus its remaining audible time (halved when
    /// sustained), offset by bonuses for same-patch users, percussion users
    /// and users that have somewhere else to go.
    pub(super) fn goodness(&self, channel: usize, patch: u16) -> i64 {
        let occupancy = &self.occupancy[channel];
        let category = self.opl.category(channel);
        let mut score = -occupancy.koff_time_until_neglible;

        for (location, record) in &occupancy.users {
            score -= USER_PENALTY;
            score -= if record.sustained {
                record.kon_time_until_neglible / 2
            } else {
                record.kon_time_until_neglible
            };

            if let Some(active) = self.channels[location.midi_channel]
                .active_notes
                .get(&location.note)
            {
                if record.patch == patch {
                    score += SAME_PATCH_BONUS;
                }
                score += PERCUSSION_BONUS * (active.program / 128) as i64;
            }

            let stations = (0..self.occupancy.len())
                .filter(|&other| other != channel && self.opl.category(other) == category)
                .flat_map(|other| self.occupancy[other].users.values())
                .filter(|m| !m.sustained && m.vib_delay < 200 && m.patch == record.patch)
                .count() as i64;
            score += stations * EVACUATION_BONUS;
        }
        score
    }

    /// Picks the best physical channel for one half of a note.
    ///
    /// Single-patch and pseudo four-op instruments take channels of the
    /// `expected` category. True four-op instruments take a four-op master
    /// for `slot` 0 and exactly that master's slave for `slot` 1. The
    /// lowest channel index wins ties.
    pub(super) fn best_channel(
        &self,
        slot: usize,
        patches: [u16; 2],
        pseudo_four_op: bool,
        expected: ChannelCategory,
        primary: Option<usize>,
    ) -> Option<usize> {
        let mut best: Option<(usize, i64)> = None;
        for channel in 0..self.occupancy.len() {
            if slot == 1 && primary == Some(channel) {
                continue;
            }
            let category = self.opl.category(channel);
            let eligible = if patches[0] == patches[1] || pseudo_four_op {
                category == expected
            } else if slot == 0 {
                category == ChannelCategory::FourOpMaster
            } else {
                primary.map(|p| p + 3) == Some(channel)
            };
            if !eligible {
                continue;
            }
            let score = self.goodness(channel, patches[slot]);
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((channel, score));
            }
        }
        best.map(|(channel, _)| channel)
    }

    /// Clears a physical channel for a new note playing `patch`.
    ///
    /// Users of the same patch that are fresh or still loud stay and share
    /// the channel. Other held notes are evacuated or killed, and sustained
    /// notes are always dropped. An emptied channel is keyed off so the new
    /// note retriggers cleanly.
    pub(super) fn prepare_channel_for_new_note(&mut self, channel: usize, patch: u16) {
        if self.occupancy[channel].is_empty() {
            return;
        }
        let held: Vec<Location> = self.occupancy[channel]
            .users
            .iter()
            .filter(|(_, record)| !record.sustained)
            .filter(|(_, record)| !(record.is_arpeggio_candidate() && record.patch == patch))
            .map(|(&location, _)| location)
            .collect();
        for location in held {
            self.kill_or_evacuate(channel, location);
        }

        self.kill_sustaining_notes(None, Some(channel));

        if self.occupancy[channel].is_empty() {
            self.opl.note_off(channel);
        }
    }

    /// Moves a user off `from`, onto another channel of the same category
    /// already sounding its patch, or silences it if there is none.
    pub(super) fn kill_or_evacuate(&mut self, from: usize, location: Location) {
        let Some(record) = self.occupancy[from].users.get(&location).copied() else {
            return;
        };

        let Some(active) = self.channels[location.midi_channel]
            .active_notes
            .get(&location.note)
        else {
            // No note owns this record any more; nothing to evacuate.
            let occupancy = &mut self.occupancy[from];
            occupancy.users.remove(&location);
            if occupancy.is_empty() {
                self.opl.note_off(from);
            }
            return;
        };
        let (tone, program, pressure) = (active.tone, active.program, active.pressure);

        let category = self.opl.category(from);
        let target = (0..self.occupancy.len()).find(|&c| {
            c != from
                && self.opl.category(c) == category
                && self.occupancy[c]
                    .users
                    .values()
                    .any(|m| m.can_host_evacuee() && m.patch == record.patch)
        });

        match target {
            Some(to) => {
                self.diagnostics.illustrate_note(from, tone, program, 0, 0.0);
                self.diagnostics
                    .illustrate_note(to, tone, program, pressure as i32, 0.0);
                if let Some(active) = self.channels[location.midi_channel]
                    .active_notes
                    .get_mut(&location.note)
                {
                    active.phys.remove(&from);
                    active.phys.insert(to, record.patch);
                }
                self.occupancy[to].users.entry(location).or_insert(record);
                self.occupancy[from].users.remove(&location);
                tracing::debug!(from, to, note = location.note, "evacuated note");
            }
            None => self.note_update(location.midi_channel, location.note, Update::OFF, Some(from)),
        }
    }

    /// Drops sustained users, optionally only those of one MIDI channel
    /// and only on one physical channel. Channels left empty are keyed off.
    pub(super) fn kill_sustaining_notes(
        &mut self,
        midi_channel: Option<usize>,
        only: Option<usize>,
    ) {
        let range = match only {
            Some(channel) => channel..channel + 1,
            None => 0..self.occupancy.len(),
        };
        for channel in range {
            if self.occupancy[channel].is_empty() {
                continue;
            }
            let doomed: Vec<Location> = self.occupancy[channel]
                .users
                .iter()
                .filter(|(location, record)| {
                    record.sustained && midi_channel.map_or(true, |m| location.midi_channel == m)
                })
                .map(|(&location, _)| location)
                .collect();
            for location in doomed {
                self.diagnostics.illustrate_note(
                    channel,
                    location.note as i32,
                    UNKNOWN_PROGRAM,
                    0,
                    0.0,
                );
                self.occupancy[channel].users.remove(&location);
            }
            if self.occupancy[channel].is_empty() {
                self.opl.note_off(channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EVACUATION_BONUS;
    use crate::opl::ChannelCategory;
    use crate::synth::engine::tests::{hosts, plain_config, synth_with};
    use crate::synth::occupancy::{Location, UsageRecord};

    fn user(patch: u16, kon_time_until_neglible: i64, vib_delay: i64) -> UsageRecord {
        UsageRecord {
            patch,
            kon_time_until_neglible,
            vib_delay,
            ..Default::default()
        }
    }

    #[test]
    fn test_goodness_counts_evacuation_stations() {
        let (mut synth, _log) = synth_with(plain_config());
        // Two candidates that differ only in their user's patch.
        synth.occupancy[0].users.insert(Location::new(0, 60), user(5, 1000, 500));
        synth.occupancy[1].users.insert(Location::new(0, 61), user(0, 1000, 500));
        for channel in 3..18 {
            synth.occupancy[channel]
                .users
                .insert(Location::new(1, channel as u8), user(7, 100_000, 500));
        }
        assert_eq!(synth.goodness(1, 9), synth.goodness(0, 9));

        // Fresh, released-pedal users of patch 0 elsewhere are stations.
        synth.occupancy[2].users.insert(Location::new(0, 62), user(0, 50_000, 10));
        assert_eq!(synth.goodness(1, 9) - synth.goodness(0, 9), EVACUATION_BONUS);
        synth.occupancy[2].users.insert(Location::new(0, 63), user(0, 50_000, 199));
        assert_eq!(synth.goodness(1, 9) - synth.goodness(0, 9), 2 * EVACUATION_BONUS);
        assert_eq!(
            synth.best_channel(0, [9, 9], false, ChannelCategory::Plain, None),
            Some(1)
        );
    }

    #[test]
    fn test_goodness_ignores_held_or_stale_stations() {
        let (mut synth, _log) = synth_with(plain_config());
        synth.occupancy[0].users.insert(Location::new(0, 60), user(5, 1000, 500));
        synth.occupancy[1].users.insert(Location::new(0, 61), user(0, 1000, 500));
        let baseline = synth.goodness(1, 9);

        let sustained = UsageRecord {
            sustained: true,
            ..user(0, 50_000, 10)
        };
        synth.occupancy[2].users.insert(Location::new(0, 62), sustained);
        synth.occupancy[3].users.insert(Location::new(0, 63), user(0, 50_000, 200));
        assert_eq!(synth.goodness(1, 9), baseline);
        assert_eq!(synth.goodness(1, 9), synth.goodness(0, 9));
    }

    /// Organ notes on MIDI channel 1, one per plain channel of a chip.
    fn fill_with_organ(synth: &mut crate::synth::MidiSynth, notes: std::ops::Range<u8>) {
        synth.handle_event(0, &[0xC1, 16]);
        for note in notes {
            synth.handle_event(0, &[0x91, note, 100]);
        }
    }

    #[test]
    fn test_idle_channels_prefer_longest_released() {
        let (mut synth, _log) = synth_with(plain_config());
        synth.handle_event(0, &[0x90, 60, 100]);
        synth.handle_event(0, &[0x80, 60, 0]);
        // Channel 0 is still ringing out, so the next note goes elsewhere.
        synth.handle_event(0, &[0x90, 62, 100]);
        assert_eq!(hosts(&synth, 0, 62), vec![1]);
    }

    #[test]
    fn test_sustained_occupant_is_evicted_from_lowest_channel() {
        let (mut synth, log) = synth_with(plain_config());
        synth.handle_event(0, &[0xB1, 64, 127]);
        fill_with_organ(&mut synth, 40..58);
        for note in 40..58 {
            synth.handle_event(0, &[0x81, note, 0]);
        }
        for channel in 0..18 {
            let users = &synth.occupancy(channel).users;
            assert_eq!(users.len(), 1);
            assert!(users.values().all(|r| r.sustained));
        }
        log.clear();

        synth.handle_event(0, &[0x90, 60, 100]);
        assert_eq!(hosts(&synth, 0, 60), vec![0]);
        assert!(!synth.occupancy(0).users.contains_key(&Location::new(1, 40)));
        let writes = log.writes();
        let key_off = writes
            .iter()
            .position(|&(_, reg, value)| reg == 0xB0 && value & 0x20 == 0)
            .expect("channel 0 keyed off");
        let key_on = writes
            .iter()
            .position(|&(_, reg, value)| reg == 0xB0 && value & 0x20 != 0)
            .expect("channel 0 keyed on");
        assert!(key_off < key_on);

        // A second piano note time-shares with the first.
        synth.handle_event(0, &[0x90, 64, 100]);
        assert_eq!(hosts(&synth, 0, 64), vec![0]);
        assert_eq!(synth.occupancy(0).users.len(), 2);
        for channel in 1..18 {
            assert_eq!(synth.occupancy(channel).users.len(), 1);
        }
    }

    #[test]
    fn test_evacuation_leaves_exactly_one_record() {
        let (mut synth, _log) = synth_with(plain_config());
        fill_with_organ(&mut synth, 40..59);
        assert_eq!(synth.occupancy(0).users.len(), 2);

        synth.handle_event(0, &[0x90, 60, 100]);
        assert_eq!(hosts(&synth, 0, 60), vec![1]);

        let evacuee = Location::new(1, 41);
        assert_eq!(hosts(&synth, 1, 41), vec![0]);
        assert_eq!(synth.occupancy(1).users.len(), 1);
        assert!(!synth.occupancy(1).users.contains_key(&evacuee));
        let active = synth.active_note(1, 41).unwrap();
        assert_eq!(active.phys.keys().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_kill_without_evacuation_target() {
        let (mut synth, log) = synth_with(plain_config());
        for note in 40..58 {
            synth.handle_event(0, &[0x91, note, 100]);
        }
        // Let every piano note go stale so none can host an evacuee.
        synth.tick(0.3);
        log.clear();

        synth.handle_event(0, &[0xC0, 16]);
        synth.handle_event(0, &[0x90, 60, 100]);
        assert_eq!(hosts(&synth, 0, 60), vec![0]);
        assert!(synth.active_note(1, 40).is_none());
        assert!(hosts(&synth, 1, 40).is_empty());
        for note in 41..58 {
            assert_eq!(hosts(&synth, 1, note).len(), 1);
        }
        assert!(log
            .writes()
            .iter()
            .any(|&(_, reg, value)| reg == 0xB0 && value & 0x20 == 0));
    }

    #[test]
    fn test_time_shared_notes_need_same_patch() {
        let (mut synth, _log) = synth_with(plain_config());
        fill_with_organ(&mut synth, 40..59);
        let shared: Vec<usize> = (0..18)
            .filter(|&c| synth.occupancy(c).users.len() > 1)
            .collect();
        assert_eq!(shared, vec![0]);
        let patches: Vec<u16> = synth.occupancy(0).users.values().map(|r| r.patch).collect();
        assert_eq!(patches, vec![9, 9]);
    }
}
