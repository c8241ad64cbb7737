//! Audio channel state machines
//!
//! Four independent channels, each a small state machine driven by DMA
//! words or CPU writes to its data register. States follow the documented
//! hardware progression: an idle channel enters the DMA startup chain
//! (fetch, first sample) and then alternates between the high-byte and
//! low-byte output states, reloading length and pointer at the end of the
//! buffer and raising the channel interrupt when a new block begins.
//!
//! Sample mixing and host-side resampling are outside the core; the
//! channel exposes its current output level for the port layer.

use crate::scheduler::{dma_cycles, Cycle};
use log::trace;

/// Channel states (the documented 3-bit encoding)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AudioState {
    /// Inactive
    #[default]
    Idle = 0b000,
    /// DMA granted, length counters loading
    Dma1 = 0b001,
    /// First word requested
    Dma2 = 0b101,
    /// Outputting the high byte
    OutHi = 0b010,
    /// Outputting the low byte
    OutLo = 0b011,
}

/// What a state transition asks the owner to do
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioActions {
    /// Raise the channel's buffer-request interrupt
    pub irq: bool,
    /// Fetch the next word over DMA into the data latch
    pub fetch: bool,
    /// Reload the working pointer from the location latch
    pub reload_ptr: bool,
    /// Schedule the next period event this many cycles ahead
    pub next_event: Option<Cycle>,
}

/// One audio channel
#[derive(Debug, Clone)]
pub struct AudioChannel {
    /// Channel number (0..3)
    pub nr: usize,

    /// Length register (words)
    pub audlen: u16,
    /// Period register (DMA cycles per sample byte)
    pub audper: u16,
    /// Volume register (0..64)
    pub audvol: u16,
    /// Data register (last written or fetched word)
    pub auddat: u16,

    /// Working length counter
    len_counter: u16,
    /// Word currently being played
    buffer: u16,
    /// Current output sample (signed byte scaled by volume)
    pub sample: i16,

    pub state: AudioState,
}

impl AudioChannel {
    pub fn new(nr: usize) -> Self {
        Self {
            nr,
            audlen: 0,
            audper: 0,
            audvol: 0,
            auddat: 0,
            len_counter: 0,
            buffer: 0,
            sample: 0,
            state: AudioState::Idle,
        }
    }

    pub fn reset(&mut self) {
        let nr = self.nr;
        *self = Self::new(nr);
    }

    //
    // Registers
    //

    pub fn poke_audlen(&mut self, value: u16) {
        self.audlen = value;
    }

    pub fn poke_audper(&mut self, value: u16) {
        self.audper = value;
    }

    pub fn poke_audvol(&mut self, value: u16) {
        // Volumes above 64 saturate
        self.audvol = (value & 0x7F).min(64);
    }

    /// A data write. Over DMA this is the fetched word; from the CPU it
    /// starts or feeds interrupt-driven playback.
    pub fn poke_auddat(&mut self, value: u16, dma_on: bool) -> AudioActions {
        let mut actions = AudioActions::default();
        self.auddat = value;

        match self.state {
            AudioState::Idle if !dma_on => {
                // Interrupt-driven playback: output immediately
                self.buffer = value;
                self.len_counter = self.audlen;
                self.state = AudioState::OutHi;
                self.output_high();
                actions.irq = true;
                actions.next_event = Some(self.period_cycles());
            }
            AudioState::Dma1 => {
                // First word arrived
                self.buffer = value;
                self.state = AudioState::Dma2;
                actions.irq = true;
                actions.fetch = true;
            }
            AudioState::Dma2 | AudioState::OutHi | AudioState::OutLo => {
                // Refill for the next word boundary
            }
            _ => {}
        }
        actions
    }

    /// The channel's DMA enable bit changed
    pub fn set_dma_enabled(&mut self, on: bool) -> AudioActions {
        let mut actions = AudioActions::default();

        if on && self.state == AudioState::Idle {
            // Startup: load the counters and request the first word
            self.len_counter = self.audlen;
            self.state = AudioState::Dma1;
            actions.reload_ptr = true;
            actions.fetch = true;
        } else if !on {
            self.state = AudioState::Idle;
            self.sample = 0;
        }
        actions
    }

    /// Period expired: move to the next output byte
    pub fn service_event(&mut self, dma_on: bool) -> AudioActions {
        let mut actions = AudioActions::default();

        match self.state {
            AudioState::Dma2 => {
                // The startup word becomes audible
                self.state = AudioState::OutHi;
                self.output_high();
                actions.next_event = Some(self.period_cycles());
            }
            AudioState::OutHi => {
                self.state = AudioState::OutLo;
                self.output_low();
                actions.next_event = Some(self.period_cycles());
            }
            AudioState::OutLo => {
                if dma_on {
                    // Take the word fetched during the last period
                    self.buffer = self.auddat;
                    actions.fetch = true;

                    if self.len_counter > 1 {
                        self.len_counter -= 1;
                    } else {
                        // Block finished: restart and tell the CPU
                        self.len_counter = self.audlen;
                        actions.reload_ptr = true;
                        actions.irq = true;
                    }
                    self.state = AudioState::OutHi;
                    self.output_high();
                    actions.next_event = Some(self.period_cycles());
                } else {
                    // Interrupt-driven mode: ask for more data and replay
                    // the latch
                    self.buffer = self.auddat;
                    actions.irq = true;
                    self.state = AudioState::OutHi;
                    self.output_high();
                    actions.next_event = Some(self.period_cycles());
                }
            }
            _ => {
                trace!("aud{}: stray period event in {:?}", self.nr, self.state);
            }
        }
        actions
    }

    fn period_cycles(&self) -> Cycle {
        // Periods below the hardware minimum behave like the minimum
        dma_cycles(self.audper.max(2) as i64)
    }

    fn output_high(&mut self) {
        self.sample = ((self.buffer >> 8) as i8) as i16 * self.audvol as i16;
    }

    fn output_low(&mut self) {
        self.sample = ((self.buffer & 0xFF) as i8) as i16 * self.audvol as i16;
    }

    //
    // Snapshot access
    //

    pub const SNAPSHOT_SIZE: usize = 15;

    pub fn save_state(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.audlen.to_le_bytes());
        buf.extend_from_slice(&self.audper.to_le_bytes());
        buf.extend_from_slice(&self.audvol.to_le_bytes());
        buf.extend_from_slice(&self.auddat.to_le_bytes());
        buf.extend_from_slice(&self.len_counter.to_le_bytes());
        buf.extend_from_slice(&self.buffer.to_le_bytes());
        buf.extend_from_slice(&self.sample.to_le_bytes());
        buf.push(self.state as u8);
    }

    pub fn load_state(&mut self, buf: &[u8]) -> Result<usize, crate::error::CoreError> {
        use crate::error::CoreError;
        if buf.len() < Self::SNAPSHOT_SIZE {
            return Err(CoreError::SnapshotCorrupted);
        }
        self.audlen = u16::from_le_bytes([buf[0], buf[1]]);
        self.audper = u16::from_le_bytes([buf[2], buf[3]]);
        self.audvol = u16::from_le_bytes([buf[4], buf[5]]);
        self.auddat = u16::from_le_bytes([buf[6], buf[7]]);
        self.len_counter = u16::from_le_bytes([buf[8], buf[9]]);
        self.buffer = u16::from_le_bytes([buf[10], buf[11]]);
        self.sample = i16::from_le_bytes([buf[12], buf[13]]);
        self.state = match buf[14] {
            0b000 => AudioState::Idle,
            0b001 => AudioState::Dma1,
            0b101 => AudioState::Dma2,
            0b010 => AudioState::OutHi,
            0b011 => AudioState::OutLo,
            _ => return Err(CoreError::SnapshotCorrupted),
        };
        Ok(Self::SNAPSHOT_SIZE)
    }
}
