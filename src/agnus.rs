//! Master clock, bus arbitration and the DMA engine seam
//!
//! The custom-chip bus runs at the DMA rate: one access slot per DMA cycle,
//! 227 slots per rasterline, 312 lines per frame (PAL). This module owns
//! the master clock, the event scheduler, the DMA control register, and the
//! memory pointers of the DMA-driven channels (disk, audio). The bitplane,
//! sprite, copper and blitter engines are external collaborators; they
//! participate through their event slots and the bus-allocation query.
//!
//! Writes to chipset registers that take effect a fixed number of cycles
//! later are recorded in a change queue and applied by the `Reg` slot,
//! never by an inline wait.

use crate::scheduler::{cia_cycles, dma_cycles, Cycle, EventId, Scheduler, Slot};
use bitflags::bitflags;
use log::trace;

/// DMA cycles per rasterline (PAL)
pub const HPOS_CNT: i64 = 227;

/// Rasterlines per frame (PAL)
pub const VPOS_CNT: i64 = 312;

/// DMA cycles per frame
pub const CYCLES_PER_FRAME: i64 = HPOS_CNT * VPOS_CNT;

/// Horizontal positions of the three disk DMA slots
pub const DSK_SLOTS: [i64; 3] = [0x07, 0x09, 0x0B];

/// Horizontal positions of the four audio DMA slots
pub const AUD_SLOTS: [i64; 4] = [0x0D, 0x0F, 0x11, 0x13];

bitflags! {
    /// DMA control register (DMACON)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DmaFlags: u16 {
        const AUD0EN  = 1 << 0;
        const AUD1EN  = 1 << 1;
        const AUD2EN  = 1 << 2;
        const AUD3EN  = 1 << 3;
        const DSKEN   = 1 << 4;
        const SPREN   = 1 << 5;
        const BLTEN   = 1 << 6;
        const COPEN   = 1 << 7;
        const BPLEN   = 1 << 8;
        const DMAEN   = 1 << 9;
        const BLTPRI  = 1 << 10;
        const BZERO   = 1 << 13;
        const BBUSY   = 1 << 14;
    }
}

/// Registers whose writes are pipelined through the change queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipReg {
    Intreq,
    Intena,
    Dmacon,
    Adkcon,
    Serdat,
}

/// A recorded register change, waiting in the `Reg` slot
#[derive(Debug, Clone, Copy)]
pub struct RegChange {
    pub cycle: Cycle,
    pub reg: ChipReg,
    pub value: u16,
}

/// Master clock and DMA bookkeeping
#[derive(Debug)]
pub struct Agnus {
    /// The master clock, in master cycles
    pub clock: Cycle,

    /// The event timeline
    pub scheduler: Scheduler,

    /// Frame counter
    pub frame: i64,

    /// DMA control register
    pub dmacon: DmaFlags,

    /// Disk DMA pointer
    pub dskpt: u32,

    /// Audio DMA location latches and working pointers
    pub audlc: [u32; 4],
    pub audpt: [u32; 4],

    /// Chip bus address mask (OCS: 19 bits, ECS/AGA: up to 21)
    pub ptr_mask: u32,

    /// Pending pipelined register writes, ordered by trigger cycle
    changes: Vec<RegChange>,
}

impl Agnus {
    pub fn new() -> Self {
        Self {
            clock: 0,
            scheduler: Scheduler::new(),
            frame: 0,
            dmacon: DmaFlags::empty(),
            dskpt: 0,
            audlc: [0; 4],
            audpt: [0; 4],
            ptr_mask: 0x07FFFF,
            changes: Vec::new(),
        }
    }

    /// Soft reset: events and DMA state restart, the clock keeps running
    pub fn reset(&mut self) {
        self.scheduler.reset();
        self.dmacon = DmaFlags::empty();
        self.dskpt = 0;
        self.audlc = [0; 4];
        self.audpt = [0; 4];
        self.changes.clear();
    }

    //
    // Beam position (derived from the clock; lines never lengthen)
    //

    pub fn hpos(&self) -> i64 {
        (self.clock / dma_cycles(1)) % HPOS_CNT
    }

    pub fn vpos(&self) -> i64 {
        (self.clock / dma_cycles(1) / HPOS_CNT) % VPOS_CNT
    }

    /// Master cycle at which the next rasterline starts
    pub fn next_line_start(&self) -> Cycle {
        let line = self.clock / dma_cycles(HPOS_CNT) + 1;
        line * dma_cycles(HPOS_CNT)
    }

    /// Master cycle at which the next frame starts
    pub fn next_frame_start(&self) -> Cycle {
        let frame = self.clock / dma_cycles(CYCLES_PER_FRAME) + 1;
        frame * dma_cycles(CYCLES_PER_FRAME)
    }

    //
    // Scheduling conveniences (relative to the current clock)
    //

    pub fn schedule_rel(&mut self, slot: Slot, delta: Cycle, id: EventId) {
        self.scheduler.schedule_abs(slot, self.clock + delta, id);
    }

    pub fn schedule_rel_data(&mut self, slot: Slot, delta: Cycle, id: EventId, data: i64) {
        self.scheduler
            .schedule_abs_data(slot, self.clock + delta, id, data);
    }

    pub fn schedule_imm(&mut self, slot: Slot, id: EventId) {
        self.scheduler.schedule_abs(slot, self.clock, id);
    }

    //
    // DMA gates
    //

    pub fn dma_enabled(&self) -> bool {
        self.dmacon.contains(DmaFlags::DMAEN)
    }

    pub fn dskdma(&self) -> bool {
        self.dma_enabled() && self.dmacon.contains(DmaFlags::DSKEN)
    }

    pub fn auddma(&self, channel: usize) -> bool {
        let bit = DmaFlags::from_bits_truncate(1 << channel);
        self.dma_enabled() && self.dmacon.contains(bit)
    }

    /// Whether a higher-priority DMA consumer claims the current bus slot.
    /// The CPU may only use unclaimed slots of the chip bus.
    pub fn bus_allocated(&self, disk_active: bool, audio_active: [bool; 4]) -> bool {
        let h = self.hpos();
        if DSK_SLOTS.contains(&h) {
            return self.dskdma() && disk_active;
        }
        for (n, pos) in AUD_SLOTS.iter().enumerate() {
            if h == *pos {
                return self.auddma(n) && audio_active[n];
            }
        }
        false
    }

    //
    // Register file
    //

    pub fn peek_dmaconr(&self) -> u16 {
        self.dmacon.bits()
    }

    /// Apply a DMACON write (set/clear convention)
    pub fn set_dmacon(&mut self, value: u16) {
        let bits = value & 0x7FFF;
        if value & 0x8000 != 0 {
            self.dmacon |= DmaFlags::from_bits_truncate(bits);
        } else {
            self.dmacon &= !DmaFlags::from_bits_truncate(bits);
        }
        trace!("DMACON = {:04X}", self.dmacon.bits());
    }

    pub fn poke_dskpth(&mut self, value: u16) {
        self.dskpt = (self.dskpt & 0x0000FFFF) | ((value as u32) << 16);
        self.dskpt &= self.ptr_mask & !1;
    }

    pub fn poke_dskptl(&mut self, value: u16) {
        self.dskpt = (self.dskpt & 0xFFFF0000) | (value as u32 & 0xFFFE);
    }

    pub fn poke_audlch(&mut self, channel: usize, value: u16) {
        self.audlc[channel] =
            (self.audlc[channel] & 0x0000FFFF) | ((value as u32) << 16);
        self.audlc[channel] &= self.ptr_mask & !1;
    }

    pub fn poke_audlcl(&mut self, channel: usize, value: u16) {
        self.audlc[channel] = (self.audlc[channel] & 0xFFFF0000) | (value as u32 & 0xFFFE);
    }

    /// Reload the working pointer of an audio channel from its latch
    pub fn reload_audpt(&mut self, channel: usize) {
        self.audpt[channel] = self.audlc[channel];
    }

    /// Advance the disk pointer by one word
    pub fn advance_dskpt(&mut self) {
        self.dskpt = (self.dskpt + 2) & self.ptr_mask;
    }

    /// Advance an audio pointer by one word
    pub fn advance_audpt(&mut self, channel: usize) {
        self.audpt[channel] = (self.audpt[channel] + 2) & self.ptr_mask;
    }

    //
    // Pipelined register changes
    //

    /// Record a register write that takes effect `delay` cycles from now
    pub fn record_register_change(&mut self, delay: Cycle, reg: ChipReg, value: u16) {
        let cycle = self.clock + delay;
        self.changes.push(RegChange { cycle, reg, value });
        self.changes.sort_by_key(|c| c.cycle);

        if cycle < self.scheduler.trigger[Slot::Reg as usize] {
            self.scheduler.schedule_abs(Slot::Reg, cycle, EventId::RegChange);
        }
    }

    /// Remove and return all changes due at the current clock
    pub fn due_register_changes(&mut self) -> Vec<RegChange> {
        let clock = self.clock;
        let due: Vec<RegChange> = self
            .changes
            .iter()
            .copied()
            .filter(|c| c.cycle <= clock)
            .collect();
        self.changes.retain(|c| c.cycle > clock);
        due
    }

    /// Re-arm the `Reg` slot for the next pending change, if any
    pub fn reschedule_reg_slot(&mut self) {
        match self.changes.first() {
            Some(change) => {
                self.scheduler
                    .schedule_abs(Slot::Reg, change.cycle, EventId::RegChange)
            }
            None => self.scheduler.cancel(Slot::Reg),
        }
    }

    /// Cycle at which the next E-clock phase begins. Accesses to the timer
    /// chips are optionally aligned to this boundary.
    pub fn next_eclock_boundary(&self) -> Cycle {
        let period = cia_cycles(1);
        ((self.clock / period) + 1) * period
    }

    /// True if there are pending register changes (snapshot helper)
    pub fn pending_changes(&self) -> &[RegChange] {
        &self.changes
    }

    pub fn restore_changes(&mut self, changes: Vec<RegChange>) {
        self.changes = changes;
    }
}

impl Default for Agnus {
    fn default() -> Self {
        Self::new()
    }
}
