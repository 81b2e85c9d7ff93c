//! Timestamped MIDI events waiting for the renderer.
//!
//! Producers push events stamped with the sample at which they should take
//! effect; the audio side peeks at the earliest timestamp to decide how far
//! it may render, then pops everything that is due. Timestamps live on a
//! 32-bit wrapping sample clock, so comparisons go through
//! [`samples_larger_than`] and [`samples_diff`] rather than `<`.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Longest message the queue carries. SysEx is not queued.
pub const MAX_EVENT_BYTES: usize = 3;

/// Half of the clock range. Differences above this are treated as negative.
const HALF_RANGE: u32 = 0x8000_0000;

/// Samples from `from` until `to`, or 0 when `to` is already in the past.
pub fn samples_diff(to: u32, from: u32) -> u32 {
    let diff = to.wrapping_sub(from);
    if diff > HALF_RANGE {
        0
    } else {
        diff
    }
}

/// Whether `to` comes strictly after `from` on the wrapping clock.
pub fn samples_larger_than(to: u32, from: u32) -> bool {
    from.wrapping_sub(to) > HALF_RANGE
}

/// One queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedEvent {
    /// Sample at which the event is processed.
    pub timestamp: u32,
    /// Output port; the logical channel is `port * 16 + (status & 0x0F)`.
    pub port: u8,
    data: [u8; MAX_EVENT_BYTES],
    len: u8,
}

impl QueuedEvent {
    /// The message bytes, status first.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Thread-safe, timestamp-ordered queue of MIDI events.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<QueuedEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `data` for processing at `timestamp`.
    ///
    /// Events with equal timestamps keep their push order.
    ///
    /// # Returns
    ///
    /// `false` when the message is empty or longer than
    /// [`MAX_EVENT_BYTES`] and was dropped.
    pub fn push(&self, timestamp: u32, port: u8, data: &[u8]) -> bool {
        if data.is_empty() || data.len() > MAX_EVENT_BYTES {
            return false;
        }
        let mut event = QueuedEvent {
            timestamp,
            port,
            data: [0; MAX_EVENT_BYTES],
            len: data.len() as u8,
        };
        event.data[..data.len()].copy_from_slice(data);

        if let Ok(mut events) = self.events.lock() {
            let position = events
                .iter()
                .rposition(|queued| !samples_larger_than(queued.timestamp, timestamp))
                .map_or(0, |index| index + 1);
            events.insert(position, event);
            true
        } else {
            false
        }
    }

    /// Timestamp of the earliest queued event.
    pub fn peek_timestamp(&self) -> Option<u32> {
        self.events
            .lock()
            .ok()
            .and_then(|events| events.front().map(|event| event.timestamp))
    }

    /// Removes and returns the earliest queued event.
    pub fn pop(&self) -> Option<QueuedEvent> {
        self.events.lock().ok().and_then(|mut events| events.pop_front())
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued event.
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}
