//! Disk controller
//!
//! Streams encoded bytes between the selected drive and chip memory.
//! Incoming bits pass through a 16-bit shift register into a six-byte FIFO;
//! DMA moves words between the FIFO and memory. A match between the shift
//! register and the sync word register aligns word boundaries and starts a
//! transfer that was armed in waiting mode.
//!
//! DMA states and transitions:
//!
//! ```text
//! Off   --DMAEN armed twice, WRITE=0, WORDSYNC=0--> Read
//! Off   --DMAEN armed twice, WRITE=0, WORDSYNC=1--> Wait
//! Off   --DMAEN armed twice, WRITE=1-------------> Write
//! Wait  --shift register matches sync word-------> Read
//! Read  --length counter reaches 0---------------> Off   (block interrupt)
//! Write --length counter reaches 0---------------> Off   (FIFO drained first)
//! any   --DMAEN written 0------------------------> Off
//! ```
//!
//! Speed factors above one transfer several words per DMA slot by running
//! the byte clock inline. Speed -1 is turbo mode: the whole transfer
//! happens synchronously when the length register arms.

use crate::agnus::Agnus;
use crate::drive::Drive;
use crate::memory::Memory;
use crate::msgq::{Msg, MsgQueue};
use crate::scheduler::{dma_cycles, usec, Cycle};
use log::{debug, trace};

/// Bit positions the auto-sync watchdog waits for before forcing a match
const AUTO_SYNC_LIMIT: i64 = 20000;

/// DMA cycles between two bytes arriving from the drive
pub const BYTE_CLOCK_DMA_CYCLES: i64 = 56;

/// Delay of the block interrupt after a turbo transfer
pub const TURBO_IRQ_DELAY: Cycle = dma_cycles(512);

/// Controller DMA state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DriveDmaState {
    #[default]
    Off,
    /// Armed, waiting for a sync match
    Wait,
    Read,
    Write,
    /// Write finished, FIFO still draining
    Flush,
}

/// Interrupt requests and line pulses collected during an operation
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskIrqs {
    /// Raise the block-complete interrupt now
    pub dskblk: bool,
    /// Raise the block-complete interrupt after this delay
    pub dskblk_rel: Option<Cycle>,
    /// Raise the sync-match interrupt
    pub dsksyn: bool,
    /// The index mark passed the selected drive's head
    pub index: bool,
}

/// Disk controller state
#[derive(Debug, Clone)]
pub struct DiskController {
    /// Words transferred per DMA slot; -1 = turbo
    pub speed: i32,
    /// Force a sync interrupt when the watchdog expires
    pub auto_dsksync: bool,
    /// Ignore guest writes to the sync word register
    pub lock_dsksync: bool,

    /// Selected drive, if any
    selected: Option<usize>,
    state: DriveDmaState,

    /// Cycle of the latest sync match
    sync_cycle: Cycle,
    /// Bit positions seen since the last match
    sync_counter: i64,

    /// Incoming byte latch: bit 15 = valid, bits 7..0 = data
    incoming: u16,

    /// Deserializer: bits enter MSB first
    data_reg: u16,
    data_reg_count: u8,

    /// Byte FIFO, oldest byte in the highest occupied position
    fifo: u64,
    fifo_count: u8,

    /// Length/control register: bit 15 = DMAEN, bit 14 = WRITE, 13..0 = length
    dsklen: u16,
    /// Sync word
    dsksync: u16,

    /// Copy of the control-port bits (drive select lines)
    prb: u8,
}

impl DiskController {
    pub fn new() -> Self {
        Self {
            speed: 1,
            auto_dsksync: false,
            lock_dsksync: false,
            selected: None,
            state: DriveDmaState::Off,
            sync_cycle: 0,
            sync_counter: 0,
            incoming: 0,
            data_reg: 0,
            data_reg_count: 0,
            fifo: 0,
            fifo_count: 0,
            dsklen: 0,
            dsksync: 0x4489,
            prb: 0xFF,
        }
    }

    pub fn reset(&mut self) {
        let speed = self.speed;
        let auto_dsksync = self.auto_dsksync;
        let lock_dsksync = self.lock_dsksync;
        *self = Self::new();
        self.speed = speed;
        self.auto_dsksync = auto_dsksync;
        self.lock_dsksync = lock_dsksync;
    }

    pub fn turbo_mode(&self) -> bool {
        self.speed == -1
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    pub fn state(&self) -> DriveDmaState {
        self.state
    }

    pub fn dsklen(&self) -> u16 {
        self.dsklen
    }

    pub fn dsksync(&self) -> u16 {
        self.dsksync
    }

    fn set_state(&mut self, new_state: DriveDmaState, msgq: &MsgQueue) {
        if self.state == new_state {
            return;
        }
        trace!("disk state {:?} -> {:?}", self.state, new_state);

        let old_state = self.state;
        self.state = new_state;

        match new_state {
            DriveDmaState::Off => {
                self.dsklen = 0;
            }
            DriveDmaState::Write => {
                if let Some(nr) = self.selected {
                    msgq.put(Msg::DriveWrite { drive: nr });
                }
            }
            _ => {
                if old_state == DriveDmaState::Write {
                    if let Some(nr) = self.selected {
                        msgq.put(Msg::DriveRead { drive: nr });
                    }
                }
            }
        }
    }

    //
    // FIFO
    //

    fn fifo_is_empty(&self) -> bool {
        self.fifo_count == 0
    }

    fn fifo_has_word(&self) -> bool {
        self.fifo_count >= 2
    }

    fn fifo_can_store_word(&self) -> bool {
        self.fifo_count <= 4
    }

    fn clear_fifo(&mut self) {
        self.fifo = 0;
        self.fifo_count = 0;
    }

    fn read_fifo(&mut self) -> u8 {
        debug_assert!(self.fifo_count >= 1);
        self.fifo_count -= 1;
        (self.fifo >> (8 * self.fifo_count)) as u8
    }

    fn read_fifo16(&mut self) -> u16 {
        debug_assert!(self.fifo_count >= 2);
        self.fifo_count -= 2;
        (self.fifo >> (8 * self.fifo_count)) as u16
    }

    fn write_fifo(&mut self, byte: u8) {
        // The oldest word falls out when the FIFO overflows
        if self.fifo_count == 6 {
            self.fifo_count -= 2;
        }
        self.fifo = (self.fifo & 0x00FF_FFFF_FFFF_FFFF) << 8 | byte as u64;
        self.fifo_count += 1;
    }

    /// FIFO fill state (inspection)
    pub fn fifo_count(&self) -> u8 {
        self.fifo_count
    }

    //
    // Registers
    //

    /// DSKDAT is a strobe register without CPU read access
    pub fn peek_dskdatr(&self) -> u16 {
        0
    }

    /// Write the length/control register.
    ///
    /// Bit 15 arms DMA when set in two consecutive writes; bit 14 selects
    /// the write direction; `wordsync` is the WORDSYNC bit of ADKCON.
    #[allow(clippy::too_many_arguments)]
    pub fn poke_dsklen(
        &mut self,
        value: u16,
        wordsync: bool,
        clock: Cycle,
        agnus: &mut Agnus,
        mem: &mut Memory,
        drives: &mut [Drive; 4],
        irqs: &mut DiskIrqs,
        msgq: &MsgQueue,
    ) {
        trace!("DSKLEN = {:04X}", value);

        let old_value = self.dsklen;
        self.dsklen = value;

        // DMAEN written zero switches everything off
        if value & 0x8000 == 0 {
            self.set_state(DriveDmaState::Off, msgq);
            self.clear_fifo();
        }

        // DMAEN set twice in a row arms the transfer
        if old_value & value & 0x8000 != 0 {
            // Nothing to do without a byte count
            if self.dsklen & 0x3FFF == 0 {
                irqs.dskblk = true;
                return;
            }

            if old_value & value & 0x4000 != 0 {
                self.set_state(DriveDmaState::Write, msgq);
                self.clear_fifo();
            } else if wordsync {
                // Reading waits for a sync match
                self.set_state(DriveDmaState::Wait, msgq);
                self.clear_fifo();
            } else {
                self.set_state(DriveDmaState::Read, msgq);
                self.clear_fifo();
            }
        }

        // Turbo drives transfer everything right now
        if self.turbo_mode() {
            self.perform_turbo_dma(clock, agnus, mem, drives, irqs);
        }
    }

    /// DSKDAT writes are absorbed
    pub fn poke_dskdat(&mut self, _value: u16) {}

    /// Read the incoming-byte register
    ///
    /// 15 DSKBYT (valid), 14 DMAON, 13 DISKWRITE, 12 WORDEQUAL, 7..0 data
    pub fn peek_dskbytr(&mut self, clock: Cycle, dma_line_on: bool) -> u16 {
        let result = self.compute_dskbytr(clock, dma_line_on);

        // The valid bit reads once
        self.incoming &= 0x7FFF;
        result
    }

    pub fn compute_dskbytr(&self, clock: Cycle, dma_line_on: bool) -> u16 {
        let mut result = self.incoming;

        if dma_line_on && self.state != DriveDmaState::Off {
            result |= 1 << 14;
        }
        if self.dsklen & 0x4000 != 0 {
            result |= 1 << 13;
        }
        if clock - self.sync_cycle <= usec(2) {
            result |= 1 << 12;
        }
        result
    }

    /// Write the sync word register
    pub fn poke_dsksync(&mut self, value: u16) {
        if value != 0x4489 {
            debug!("unusual sync word {:04X}", value);
            if self.lock_dsksync {
                return;
            }
        }
        self.dsksync = value;
    }

    //
    // Drive selection
    //

    /// React to new control-port bits: propagate to every connected drive
    /// and recompute the selected unit
    pub fn prb_did_change(
        &mut self,
        clock: Cycle,
        old: u8,
        new: u8,
        drives: &mut [Drive; 4],
        msgq: &MsgQueue,
    ) {
        self.prb = new;

        let old_selected = self.selected;
        self.selected = None;

        for (i, drive) in drives.iter_mut().enumerate() {
            if drive.connected {
                drive.prb_did_change(clock, old, new, msgq);
                if drive.is_selected() {
                    // The highest-numbered selected drive wins
                    self.selected = Some(i);
                }
            }
        }

        if old_selected != self.selected {
            msgq.put(Msg::DriveSelect(
                self.selected.map_or(-1, |nr| nr as i8),
            ));
        }
    }

    //
    // Byte clocking
    //

    /// Service a rotation event: clock one byte between the selected drive
    /// and the shift register, then reschedule
    pub fn service_disk_event(
        &mut self,
        clock: Cycle,
        drives: &mut [Drive; 4],
        irqs: &mut DiskIrqs,
        msgq: &MsgQueue,
    ) {
        self.transfer_byte(clock, drives, irqs, msgq);
    }

    /// Cycle delay until the next rotation event
    pub fn next_event_delay(&self) -> Cycle {
        dma_cycles(BYTE_CLOCK_DMA_CYCLES)
    }

    fn transfer_byte(
        &mut self,
        clock: Cycle,
        drives: &mut [Drive; 4],
        irqs: &mut DiskIrqs,
        msgq: &MsgQueue,
    ) {
        match self.state {
            DriveDmaState::Off | DriveDmaState::Wait | DriveDmaState::Read => {
                self.read_byte(clock, drives, irqs, msgq)
            }
            DriveDmaState::Write | DriveDmaState::Flush => {
                self.write_byte(clock, drives, irqs, msgq)
            }
        }
    }

    fn read_byte(
        &mut self,
        clock: Cycle,
        drives: &mut [Drive; 4],
        irqs: &mut DiskIrqs,
        msgq: &MsgQueue,
    ) {
        // Fetch a byte from the selected drive
        let byte = match self.selected {
            Some(nr) => {
                let (byte, index) = drives[nr].read_byte_and_rotate(clock);
                irqs.index |= index;
                byte
            }
            None => 0,
        };

        // Latch it with the valid bit for DSKBYTR
        self.incoming = byte as u16 | 0x8000;

        // Deserialize, MSB first
        for i in (0..8).rev() {
            self.read_bit(byte & (1 << i) != 0, clock, irqs, msgq);
        }
    }

    fn read_bit(&mut self, bit: bool, clock: Cycle, irqs: &mut DiskIrqs, msgq: &MsgQueue) {
        self.data_reg = (self.data_reg << 1) | bit as u16;

        self.data_reg_count += 1;
        if self.data_reg_count == 8 {
            self.write_fifo(self.data_reg as u8);
            self.data_reg_count = 0;
        }

        // Sync match, or the watchdog forcing one
        self.sync_counter += 1;
        if self.data_reg == self.dsksync
            || (self.auto_dsksync && self.sync_counter > AUTO_SYNC_LIMIT)
        {
            self.sync_cycle = clock;
            irqs.dsksyn = true;

            if self.state == DriveDmaState::Wait {
                self.data_reg_count = 0;
                self.clear_fifo();
                self.set_state(DriveDmaState::Read, msgq);
            }
            self.sync_counter = 0;
        }
    }

    fn write_byte(
        &mut self,
        _clock: Cycle,
        drives: &mut [Drive; 4],
        irqs: &mut DiskIrqs,
        msgq: &MsgQueue,
    ) {
        if self.fifo_is_empty() {
            // Drained: leave the flush state
            if self.state == DriveDmaState::Flush {
                self.set_state(DriveDmaState::Off, msgq);
            }
        } else {
            let outgoing = self.read_fifo();
            if let Some(nr) = self.selected {
                irqs.index |= drives[nr].write_byte_and_rotate(outgoing);
            }
        }
    }

    //
    // DMA
    //

    /// Perform one disk DMA slot in standard mode
    pub fn perform_dma(
        &mut self,
        clock: Cycle,
        agnus: &mut Agnus,
        mem: &mut Memory,
        drives: &mut [Drive; 4],
        irqs: &mut DiskIrqs,
        msgq: &MsgQueue,
    ) {
        // Only proceed with bytes left and DMA switched on
        if self.dsklen & 0x3FFF == 0 {
            return;
        }
        if self.state != DriveDmaState::Read && self.state != DriveDmaState::Write {
            return;
        }

        let count = if self.selected.is_some() {
            self.speed.max(1) as u32
        } else {
            1
        };

        match self.state {
            DriveDmaState::Read => self.perform_dma_read(clock, agnus, mem, drives, irqs, msgq, count),
            DriveDmaState::Write => self.perform_dma_write(clock, agnus, mem, drives, irqs, msgq, count),
            _ => unreachable!(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn perform_dma_read(
        &mut self,
        clock: Cycle,
        agnus: &mut Agnus,
        mem: &mut Memory,
        drives: &mut [Drive; 4],
        irqs: &mut DiskIrqs,
        msgq: &MsgQueue,
        mut remaining: u32,
    ) {
        // Wait until the FIFO delivers a full word
        if !self.fifo_has_word() {
            return;
        }

        loop {
            let word = self.read_fifo16();
            Self::disk_dma_write(agnus, mem, word);

            self.dsklen = self.dsklen.wrapping_sub(1);
            if self.dsklen & 0x3FFF == 0 {
                irqs.dskblk = true;
                self.set_state(DriveDmaState::Off, msgq);
                return;
            }

            remaining -= 1;
            if remaining == 0 {
                return;
            }

            // Keep the FIFO fed while the loop runs inline
            self.transfer_byte(clock, drives, irqs, msgq);
            self.transfer_byte(clock, drives, irqs, msgq);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn perform_dma_write(
        &mut self,
        clock: Cycle,
        agnus: &mut Agnus,
        mem: &mut Memory,
        drives: &mut [Drive; 4],
        irqs: &mut DiskIrqs,
        msgq: &MsgQueue,
        mut remaining: u32,
    ) {
        // Wait until the FIFO can absorb a full word
        if !self.fifo_can_store_word() {
            return;
        }

        loop {
            let word = Self::disk_dma_read(agnus, mem);
            self.write_fifo((word >> 8) as u8);
            self.write_fifo(word as u8);

            self.dsklen = self.dsklen.wrapping_sub(1);
            if self.dsklen & 0x3FFF == 0 {
                irqs.dskblk = true;

                // Flush the FIFO right away; the remaining bytes belong to
                // this transfer
                while !self.fifo_is_empty() {
                    let byte = self.read_fifo();
                    if let Some(nr) = self.selected {
                        irqs.index |= drives[nr].write_byte_and_rotate(byte);
                    }
                }
                self.set_state(DriveDmaState::Off, msgq);
                return;
            }

            remaining -= 1;
            if remaining == 0 {
                return;
            }

            self.transfer_byte(clock, drives, irqs, msgq);
            self.transfer_byte(clock, drives, irqs, msgq);
        }
    }

    /// Move a word from the FIFO into memory through the DMA accessor
    fn disk_dma_write(agnus: &mut Agnus, mem: &mut Memory, word: u16) {
        let addr = agnus.dskpt;
        match mem.agnus_src(addr) {
            crate::memory::MemSrc::Chip => mem.chip_write16(addr, word),
            crate::memory::MemSrc::SlowMirror => mem.slow_mirror_write16(addr, word),
            _ => {}
        }
        mem.data_bus = word;
        agnus.advance_dskpt();
    }

    /// Fetch a word from memory through the DMA accessor
    fn disk_dma_read(agnus: &mut Agnus, mem: &mut Memory) -> u16 {
        let addr = agnus.dskpt;
        let word = match mem.agnus_src(addr) {
            crate::memory::MemSrc::Chip => mem.chip_read16(addr),
            crate::memory::MemSrc::SlowMirror => mem.slow_mirror_read16(addr),
            _ => mem.unmapped16(),
        };
        mem.data_bus = word;
        agnus.advance_dskpt();
        word
    }

    //
    // Turbo DMA
    //

    /// Complete the whole armed transfer synchronously
    pub fn perform_turbo_dma(
        &mut self,
        clock: Cycle,
        agnus: &mut Agnus,
        mem: &mut Memory,
        drives: &mut [Drive; 4],
        irqs: &mut DiskIrqs,
    ) {
        if self.dsklen & 0x3FFF == 0 {
            return;
        }

        let Some(nr) = self.selected else { return };

        match self.state {
            DriveDmaState::Wait | DriveDmaState::Read => {
                if self.state == DriveDmaState::Wait {
                    drives[nr].find_sync_mark(clock);
                }
                self.perform_turbo_read(clock, agnus, mem, &mut drives[nr]);
                irqs.dsksyn = true;
            }
            DriveDmaState::Write => {
                self.perform_turbo_write(agnus, mem, &mut drives[nr]);
            }
            _ => return,
        }

        // The block interrupt trails the transfer
        irqs.dskblk_rel = Some(TURBO_IRQ_DELAY);

        self.state = DriveDmaState::Off;
        self.dsklen = 0;
    }

    fn perform_turbo_read(
        &mut self,
        clock: Cycle,
        agnus: &mut Agnus,
        mem: &mut Memory,
        drive: &mut Drive,
    ) {
        for _ in 0..(self.dsklen & 0x3FFF) {
            let (word, _) = drive.read_word_and_rotate(clock);
            Self::disk_dma_write(agnus, mem, word);
        }
    }

    fn perform_turbo_write(&mut self, agnus: &mut Agnus, mem: &mut Memory, drive: &mut Drive) {
        for _ in 0..(self.dsklen & 0x3FFF) {
            let word = Self::disk_dma_read(agnus, mem);
            drive.write_word_and_rotate(word);
        }
    }

    //
    // Snapshot access
    //

    pub const SNAPSHOT_SIZE: usize = 1 + 1 + 8 + 8 + 2 + 2 + 1 + 8 + 1 + 2 + 2 + 1;

    pub fn save_state(&self, buf: &mut Vec<u8>) {
        buf.push(self.selected.map_or(0xFF, |nr| nr as u8));
        buf.push(self.state as u8);
        buf.extend_from_slice(&self.sync_cycle.to_le_bytes());
        buf.extend_from_slice(&self.sync_counter.to_le_bytes());
        buf.extend_from_slice(&self.incoming.to_le_bytes());
        buf.extend_from_slice(&self.data_reg.to_le_bytes());
        buf.push(self.data_reg_count);
        buf.extend_from_slice(&self.fifo.to_le_bytes());
        buf.push(self.fifo_count);
        buf.extend_from_slice(&self.dsklen.to_le_bytes());
        buf.extend_from_slice(&self.dsksync.to_le_bytes());
        buf.push(self.prb);
    }

    pub fn load_state(&mut self, buf: &[u8]) -> Result<usize, crate::error::CoreError> {
        use crate::error::CoreError;
        if buf.len() < Self::SNAPSHOT_SIZE {
            return Err(CoreError::SnapshotCorrupted);
        }
        let mut pos = 0;
        self.selected = match buf[pos] {
            0xFF => None,
            nr if nr < 4 => Some(nr as usize),
            _ => return Err(CoreError::SnapshotCorrupted),
        };
        pos += 1;
        self.state = match buf[pos] {
            0 => DriveDmaState::Off,
            1 => DriveDmaState::Wait,
            2 => DriveDmaState::Read,
            3 => DriveDmaState::Write,
            4 => DriveDmaState::Flush,
            _ => return Err(CoreError::SnapshotCorrupted),
        };
        pos += 1;
        self.sync_cycle = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        self.sync_counter = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        self.incoming = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
        pos += 2;
        self.data_reg = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
        pos += 2;
        self.data_reg_count = buf[pos];
        pos += 1;
        self.fifo = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        self.fifo_count = buf[pos];
        pos += 1;
        self.dsklen = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
        pos += 2;
        self.dsksync = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
        pos += 2;
        self.prb = buf[pos];
        pos += 1;
        Ok(pos)
    }
}

impl Default for DiskController {
    fn default() -> Self {
        Self::new()
    }
}
