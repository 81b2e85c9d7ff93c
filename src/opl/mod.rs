//! OPL3 hardware layer.
//!
//! The engine talks to chips only through the [`FmChip`] trait; the
//! waveform emulator itself is an external collaborator. This module
//! provides two chips that do not synthesize audio:
//!
//! - [`RegisterFile`] mirrors register writes and renders silence
//! - [`LoggingChip`] additionally records every write with its sample time
//!
//! The [`topology`] and [`interface`] submodules build the logical channel
//! model on top of a set of chips.

pub mod interface;
pub mod topology;

pub use interface::OplInterface;
pub use topology::{ChannelCategory, PercussionRole, Topology};

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::config::EmulatorKind;

/// Size of the OPL3 register space (two banks of 256).
pub const REGISTER_SPACE: usize = 0x200;

/// A single OPL2/OPL3 compatible chip.
pub trait FmChip: Send {
    /// Returns the chip to its power-on state.
    fn reset(&mut self);

    /// Writes one register. Addresses 0x100.. select the second bank.
    fn write_reg(&mut self, reg: u16, value: u8);

    /// Renders `buffer.len() / 2` interleaved stereo frames, adding them to
    /// the buffer contents.
    fn update(&mut self, buffer: &mut [f32]);

    /// Sets continuous left/right gains for a channel slot.
    fn set_panning(&mut self, slot: usize, left: f32, right: f32);
}

/// Creates the chips for a reset.
pub trait ChipFactory: Send {
    fn create(&self, index: usize, kind: EmulatorKind, full_pan: bool) -> Box<dyn FmChip>;
}

/// Register mirror that produces no audio.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    registers: [u8; REGISTER_SPACE],
    panning: Vec<(f32, f32)>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            registers: [0; REGISTER_SPACE],
            panning: vec![(1.0, 1.0); topology::CHANNELS_PER_CHIP],
        }
    }
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value written to a register.
    pub fn register(&self, reg: u16) -> u8 {
        self.registers[reg as usize % REGISTER_SPACE]
    }

    /// Current smooth-pan gains of a slot.
    pub fn panning(&self, slot: usize) -> Option<(f32, f32)> {
        self.panning.get(slot).copied()
    }
}

impl FmChip for RegisterFile {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn write_reg(&mut self, reg: u16, value: u8) {
        self.registers[reg as usize % REGISTER_SPACE] = value;
    }

    fn update(&mut self, _buffer: &mut [f32]) {}

    fn set_panning(&mut self, slot: usize, left: f32, right: f32) {
        if let Some(gains) = self.panning.get_mut(slot) {
            *gains = (left, right);
        }
    }
}

/// Builds [`RegisterFile`] chips regardless of emulator kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegisterFileFactory;

impl ChipFactory for RegisterFileFactory {
    fn create(&self, _index: usize, _kind: EmulatorKind, _full_pan: bool) -> Box<dyn FmChip> {
        Box::new(RegisterFile::new())
    }
}

/// Something a chip was asked to do, stamped with the chip's sample clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChipEvent {
    Reset {
        sample: u64,
        chip: usize,
    },
    Write {
        sample: u64,
        chip: usize,
        reg: u16,
        value: u8,
    },
    Panning {
        sample: u64,
        chip: usize,
        slot: usize,
        left: f32,
        right: f32,
    },
}

impl fmt::Display for ChipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ChipEvent::Reset { sample, chip } => write!(f, "{:>10} chip{} reset", sample, chip),
            ChipEvent::Write {
                sample,
                chip,
                reg,
                value,
            } => write!(f, "{:>10} chip{} {:03X} {:02X}", sample, chip, reg, value),
            ChipEvent::Panning {
                sample,
                chip,
                slot,
                left,
                right,
            } => write!(
                f,
                "{:>10} chip{} pan {} {:.4} {:.4}",
                sample, chip, slot, left, right
            ),
        }
    }
}

/// Shared, append-only log of chip events.
#[derive(Debug, Clone, Default)]
pub struct RegisterLog(Arc<Mutex<Vec<ChipEvent>>>);

impl RegisterLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: ChipEvent) {
        if let Ok(mut events) = self.0.lock() {
            events.push(event);
        }
    }

    /// Copy of everything logged so far.
    pub fn snapshot(&self) -> Vec<ChipEvent> {
        self.0.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Removes and returns everything logged so far.
    pub fn take(&self) -> Vec<ChipEvent> {
        self.0
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }

    /// Register writes only, as `(chip, reg, value)`.
    pub fn writes(&self) -> Vec<(usize, u16, u8)> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                ChipEvent::Write {
                    chip, reg, value, ..
                } => Some((chip, reg, value)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.0.lock() {
            events.clear();
        }
    }
}

/// Register mirror that records everything it is told.
#[derive(Debug)]
pub struct LoggingChip {
    index: usize,
    registers: RegisterFile,
    log: RegisterLog,
    sample: u64,
}

impl LoggingChip {
    pub fn new(index: usize, log: RegisterLog) -> Self {
        Self {
            index,
            registers: RegisterFile::new(),
            log,
            sample: 0,
        }
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }
}

impl FmChip for LoggingChip {
    fn reset(&mut self) {
        self.registers.reset();
        self.log.push(ChipEvent::Reset {
            sample: self.sample,
            chip: self.index,
        });
    }

    fn write_reg(&mut self, reg: u16, value: u8) {
        self.registers.write_reg(reg, value);
        self.log.push(ChipEvent::Write {
            sample: self.sample,
            chip: self.index,
            reg,
            value,
        });
    }

    fn update(&mut self, buffer: &mut [f32]) {
        self.sample += (buffer.len() / 2) as u64;
    }

    fn set_panning(&mut self, slot: usize, left: f32, right: f32) {
        self.registers.set_panning(slot, left, right);
        self.log.push(ChipEvent::Panning {
            sample: self.sample,
            chip: self.index,
            slot,
            left,
            right,
        });
    }
}

/// Builds [`LoggingChip`]s that share one log.
#[derive(Debug, Clone, Default)]
pub struct LoggingChipFactory {
    log: RegisterLog,
}

impl LoggingChipFactory {
    pub fn new(log: RegisterLog) -> Self {
        Self { log }
    }
}

impl ChipFactory for LoggingChipFactory {
    fn create(&self, index: usize, _kind: EmulatorKind, _full_pan: bool) -> Box<dyn FmChip> {
        Box::new(LoggingChip::new(index, self.log.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_file_mirrors_writes() {
        let mut chip = RegisterFile::new();
        chip.write_reg(0x1B0, 0x31);
        assert_eq!(chip.register(0x1B0), 0x31);
        chip.reset();
        assert_eq!(chip.register(0x1B0), 0);
    }

    #[test]
    fn test_logging_chip_stamps_sample_time() {
        let log = RegisterLog::new();
        let mut chip = LoggingChip::new(3, log.clone());
        chip.write_reg(0x20, 1);
        let mut buffer = vec![0.0f32; 64];
        chip.update(&mut buffer);
        chip.set_panning(2, 0.5, 0.25);

        let events = log.take();
        assert_eq!(
            events[0],
            ChipEvent::Write {
                sample: 0,
                chip: 3,
                reg: 0x20,
                value: 1
            }
        );
        assert!(matches!(events[1], ChipEvent::Panning { sample: 32, slot: 2, .. }));
        assert!(log.snapshot().is_empty());
        assert_eq!(chip.registers().panning(2), Some((0.5, 0.25)));
    }

    #[test]
    fn test_event_display() {
        let event = ChipEvent::Write {
            sample: 7,
            chip: 1,
            reg: 0xB3,
            value: 0x2A,
        };
        assert_eq!(event.to_string(), "         7 chip1 0B3 2A");
    }
}
