//! Bookkeeping of which notes sound on each physical channel.

use std::collections::BTreeMap;

/// Lower bound of every decay counter.
pub const DECAY_FLOOR: i64 = -0x1FFF_FFFF;

/// Identity of a note: MIDI channel and key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub midi_channel: usize,
    pub note: u8,
}

impl Location {
    pub fn new(midi_channel: usize, note: u8) -> Self {
        Self { midi_channel, note }
    }
}

/// A note's claim on one physical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageRecord {
    /// Released while the sustain pedal was held.
    pub sustained: bool,
    /// Patch the note plays on this channel.
    pub patch: u16,
    /// Milliseconds until the held note becomes inaudible; negative once
    /// it has.
    pub kon_time_until_neglible: i64,
    /// Milliseconds since the note was (re)patched onto this channel.
    pub vib_delay: i64,
}

impl UsageRecord {
    /// Recently started or still loud, so worth time-sharing with.
    pub fn is_arpeggio_candidate(&self) -> bool {
        self.vib_delay < 70 || self.kon_time_until_neglible > 20000
    }

    /// Still sounding enough to host an evacuated note.
    pub fn can_host_evacuee(&self) -> bool {
        !self.sustained && !(self.vib_delay >= 200 && self.kon_time_until_neglible < 10000)
    }
}

/// Users of one physical channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelOccupancy {
    pub users: BTreeMap<Location, UsageRecord>,
    /// Milliseconds until the released sound fades out. Only meaningful
    /// while `users` is empty.
    pub koff_time_until_neglible: i64,
}

impl ChannelOccupancy {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Advances every timer by `ms` milliseconds.
    pub fn add_age(&mut self, ms: i64) {
        if self.users.is_empty() {
            self.koff_time_until_neglible = (self.koff_time_until_neglible - ms).max(DECAY_FLOOR);
        } else {
            self.koff_time_until_neglible = 0;
            for record in self.users.values_mut() {
                record.kon_time_until_neglible =
                    (record.kon_time_until_neglible - ms).max(DECAY_FLOOR);
                record.vib_delay += ms;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_age_empty_channel() {
        let mut channel = ChannelOccupancy {
            koff_time_until_neglible: 100,
            ..Default::default()
        };
        channel.add_age(30);
        assert_eq!(channel.koff_time_until_neglible, 70);
        channel.add_age(i64::from(i32::MAX));
        assert_eq!(channel.koff_time_until_neglible, DECAY_FLOOR);
    }

    #[test]
    fn test_add_age_with_users() {
        let mut channel = ChannelOccupancy {
            koff_time_until_neglible: 100,
            ..Default::default()
        };
        channel.users.insert(
            Location::new(0, 60),
            UsageRecord {
                kon_time_until_neglible: 1000,
                ..Default::default()
            },
        );
        channel.add_age(250);
        assert_eq!(channel.koff_time_until_neglible, 0);
        let record = channel.users[&Location::new(0, 60)];
        assert_eq!(record.kon_time_until_neglible, 750);
        assert_eq!(record.vib_delay, 250);
    }

    #[test]
    fn test_record_windows() {
        let fresh = UsageRecord {
            vib_delay: 10,
            ..Default::default()
        };
        assert!(fresh.is_arpeggio_candidate());
        assert!(fresh.can_host_evacuee());

        let stale = UsageRecord {
            vib_delay: 500,
            kon_time_until_neglible: 5000,
            ..Default::default()
        };
        assert!(!stale.is_arpeggio_candidate());
        assert!(!stale.can_host_evacuee());

        let held = UsageRecord {
            sustained: true,
            ..fresh
        };
        assert!(!held.can_host_evacuee());
    }

    fn record(vib_delay: i64, kon_time_until_neglible: i64) -> UsageRecord {
        UsageRecord {
            vib_delay,
            kon_time_until_neglible,
            ..Default::default()
        }
    }

    #[test]
    fn test_arpeggio_candidate_boundaries() {
        assert!(record(69, 0).is_arpeggio_candidate());
        assert!(!record(70, 0).is_arpeggio_candidate());
        assert!(!record(500, 20000).is_arpeggio_candidate());
        assert!(record(500, 20001).is_arpeggio_candidate());
    }

    #[test]
    fn test_evacuee_host_boundaries() {
        assert!(record(199, 9999).can_host_evacuee());
        assert!(!record(200, 9999).can_host_evacuee());
        assert!(record(200, 10000).can_host_evacuee());

        let held = UsageRecord {
            sustained: true,
            ..record(199, 10000)
        };
        assert!(!held.can_host_evacuee());
    }
}
