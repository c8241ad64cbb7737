//! Floppy drive mechanics
//!
//! Per-drive head position, motor spin-up and spin-down, step timing,
//! identification shift register, disk-change signaling and the disk
//! polling heuristic. The drive is controlled through the PRB bits of
//! timer chip B:
//!
//! ```text
//! -----------------------------------------------------------------
//! | /MTR  | /SEL3 | /SEL2 | /SEL1 | /SEL0 | /SIDE |  DIR  | STEP  |
//! -----------------------------------------------------------------
//! ```
//!
//! and reports its status on the PA bits of timer chip A (/RDY, /TK0,
//! /WPRO, /CHNG). Disk insertion and ejection are scheduled events with a
//! configurable delay; the bus owns the corresponding event slots.

use crate::config::DriveMechanics;
use crate::error::CoreError;
use crate::memory::Rng;
use crate::msgq::{Msg, MsgQueue};
use crate::scheduler::{msec, usec, Cycle};
use log::{debug, trace};

/// Number of cylinders the head can reach
pub const CYLINDER_COUNT: u8 = 84;

/// Default byte length of a double-density track
pub const TRACK_LEN_DD: usize = 12668;

/// Disk diameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diameter {
    Inch35,
    Inch525,
}

/// Recording density
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Density {
    Sd,
    Dd,
    Hd,
}

/// Drive flavor, deciding which disks fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriveType {
    #[default]
    Dd35,
    Hd35,
    Dd525,
}

/// An encoded disk: raw track bytes, indexed by cylinder and head
#[derive(Debug, Clone)]
pub struct FloppyDisk {
    pub diameter: Diameter,
    pub density: Density,
    tracks: Vec<Vec<u8>>,
    pub write_protected: bool,
    pub modified: bool,
}

impl FloppyDisk {
    /// A blank double-sided disk
    pub fn blank(diameter: Diameter, density: Density) -> Self {
        let len = match density {
            Density::Hd => 2 * TRACK_LEN_DD,
            _ => TRACK_LEN_DD,
        };
        Self {
            diameter,
            density,
            tracks: vec![vec![0; len]; CYLINDER_COUNT as usize * 2],
            write_protected: false,
            modified: false,
        }
    }

    fn index(cylinder: u8, head: u8) -> usize {
        cylinder as usize * 2 + head as usize
    }

    pub fn track_len(&self, cylinder: u8, head: u8) -> usize {
        self.tracks[Self::index(cylinder, head)].len()
    }

    pub fn read_byte(&self, cylinder: u8, head: u8, offset: usize) -> u8 {
        let track = &self.tracks[Self::index(cylinder, head)];
        track[offset % track.len()]
    }

    pub fn write_byte(&mut self, cylinder: u8, head: u8, offset: usize, value: u8) {
        let track = &mut self.tracks[Self::index(cylinder, head)];
        let len = track.len();
        track[offset % len] = value;
        self.modified = true;
    }

    /// Replace a whole track (test and image-import helper)
    pub fn fill_track(&mut self, cylinder: u8, head: u8, data: &[u8]) {
        let track = &mut self.tracks[Self::index(cylinder, head)];
        let len = track.len().min(data.len());
        track[..len].copy_from_slice(&data[..len]);
    }
}

/// Current head position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveHead {
    pub cylinder: u8,
    pub head: u8,
    pub offset: usize,
}

/// Head polling sequences of the boot ROMs this core knows about.
/// 1.2/1.3 alternate between cylinders 0 and 1; 2.0 cycles 0-1-2-3.
const POLL_SIGNATURES: [u64; 4] = [
    0x010001000100,
    0x000100010001,
    0x020302030203,
    0x030203020302,
];

/// One floppy drive
#[derive(Debug, Clone)]
pub struct Drive {
    /// Drive number (0..3)
    pub nr: usize,
    pub connected: bool,
    pub drive_type: DriveType,
    pub mechanics: DriveMechanics,

    pub head: DriveHead,

    /// Motor state and the cycle/speed captured at the last switch
    motor: bool,
    switch_cycle: Cycle,
    switch_speed: f64,

    /// Identification shift register position and current output bit
    id_count: u8,
    id_bit: bool,

    /// Step timing
    latest_step: Cycle,
    latest_step_up: Cycle,
    latest_step_down: Cycle,
    latest_step_completed: Cycle,

    /// Disk-change latch (false = change pending, matching /CHNG low)
    dskchange: bool,

    /// Copy of the control port bits
    prb: u8,

    /// The last eight visited cylinders, newest in the low byte
    cylinder_history: u64,

    /// Additional polling signatures installed by the host
    extra_poll_signatures: Vec<u64>,

    pub disk: Option<FloppyDisk>,
    /// Disk waiting for the scheduled insertion event
    pub disk_to_insert: Option<FloppyDisk>,

    /// Noise source for reads during a step
    rng: Rng,
}

impl Drive {
    pub fn new(nr: usize) -> Self {
        Self {
            nr,
            connected: nr == 0,
            drive_type: DriveType::Dd35,
            mechanics: DriveMechanics::A1010,
            head: DriveHead::default(),
            motor: false,
            switch_cycle: 0,
            switch_speed: 0.0,
            id_count: 0,
            id_bit: false,
            latest_step: 0,
            latest_step_up: 0,
            latest_step_down: 0,
            latest_step_completed: 0,
            dskchange: false,
            prb: 0xFF,
            cylinder_history: 0,
            extra_poll_signatures: Vec::new(),
            disk: None,
            disk_to_insert: None,
            rng: Rng::new(),
        }
    }

    /// Soft reset: mechanics settle, media stays in the drive
    pub fn reset(&mut self) {
        self.motor = false;
        self.switch_cycle = 0;
        self.switch_speed = 0.0;
        self.id_count = 0;
        self.id_bit = false;
        self.latest_step = 0;
        self.latest_step_up = 0;
        self.latest_step_down = 0;
        self.latest_step_completed = 0;
        self.prb = 0xFF;
        self.cylinder_history = 0;
        self.head.offset = 0;
    }

    //
    // Media
    //

    pub fn has_disk(&self) -> bool {
        self.disk.is_some()
    }

    pub fn has_protected_disk(&self) -> bool {
        self.disk.as_ref().map_or(false, |d| d.write_protected)
    }

    pub fn has_unprotected_disk(&self) -> bool {
        self.disk.as_ref().map_or(false, |d| !d.write_protected)
    }

    pub fn set_protection_flag(&mut self, value: bool, msgq: &MsgQueue) {
        if let Some(disk) = self.disk.as_mut() {
            if disk.write_protected != value {
                disk.write_protected = value;
                msgq.put(Msg::DiskProtected { drive: self.nr, protected: value });
            }
        }
    }

    /// Check whether a disk fits this drive
    pub fn is_insertable(&self, disk: &FloppyDisk) -> Result<(), CoreError> {
        let ok = match self.drive_type {
            DriveType::Dd35 => disk.diameter == Diameter::Inch35 && disk.density == Density::Dd,
            DriveType::Hd35 => disk.diameter == Diameter::Inch35,
            DriveType::Dd525 => disk.diameter == Diameter::Inch525 && disk.density == Density::Dd,
        };
        if ok {
            Ok(())
        } else {
            Err(CoreError::DiskIncompatible)
        }
    }

    /// Service a scheduled disk-change event
    pub fn service_disk_change(&mut self, insert: bool, msgq: &MsgQueue) {
        // An insertion implies ejecting whatever is in the drive
        if self.disk.take().is_some() {
            // Pull /CHNG low until a disk is inserted and a step arrives
            self.dskchange = false;
            msgq.put(Msg::DiskEject { drive: self.nr });
        }

        if insert {
            if let Some(disk) = self.disk_to_insert.take() {
                self.disk = Some(disk);
                self.head.offset = 0;
                msgq.put(Msg::DiskInsert { drive: self.nr });
            }
        }
    }

    //
    // Identification
    //

    /// The 32-bit identification pattern shifted out in id mode
    pub fn drive_id(&self) -> u32 {
        if self.nr == 0 {
            // The internal drive identifies itself as zero
            return 0;
        }
        match self.drive_type {
            DriveType::Dd35 => 0xFFFF_FFFF,
            DriveType::Hd35 => {
                match &self.disk {
                    Some(d) if d.density == Density::Hd => 0xAAAA_AAAA,
                    _ => 0xFFFF_FFFF,
                }
            }
            DriveType::Dd525 => 0x5555_5555,
        }
    }

    /// The shift register is read out while the motor is not at full speed
    fn id_mode(&self, clock: Cycle) -> bool {
        self.motor_stopped(clock) || self.motor_speeding_up(clock)
    }

    //
    // Motor
    //

    fn start_delay(&self) -> Cycle {
        match self.mechanics {
            DriveMechanics::None => 0,
            DriveMechanics::A1010 => msec(380),
        }
    }

    fn stop_delay(&self) -> Cycle {
        match self.mechanics {
            DriveMechanics::None => 0,
            DriveMechanics::A1010 => msec(80),
        }
    }

    fn step_pulse_delay(&self) -> Cycle {
        match self.mechanics {
            DriveMechanics::None => 0,
            DriveMechanics::A1010 => usec(40),
        }
    }

    fn rev_step_pulse_delay(&self) -> Cycle {
        match self.mechanics {
            DriveMechanics::None => 0,
            DriveMechanics::A1010 => usec(40),
        }
    }

    fn track_to_track_delay(&self) -> Cycle {
        match self.mechanics {
            DriveMechanics::None => 0,
            DriveMechanics::A1010 => msec(3),
        }
    }

    fn head_settle_time(&self) -> Cycle {
        match self.mechanics {
            DriveMechanics::None => 0,
            DriveMechanics::A1010 => msec(9),
        }
    }

    /// Current motor speed in percent, a piecewise-linear ramp between the
    /// captured switch speed and 0 or 100
    pub fn motor_speed(&self, clock: Cycle) -> f64 {
        let elapsed = (clock - self.switch_cycle) as f64;
        if self.motor {
            let delay = self.start_delay();
            if delay == 0 {
                return 100.0;
            }
            (self.switch_speed + 100.0 * elapsed / delay as f64).min(100.0)
        } else {
            let delay = self.stop_delay();
            if delay == 0 {
                return 0.0;
            }
            (self.switch_speed - 100.0 * elapsed / delay as f64).max(0.0)
        }
    }

    pub fn set_motor(&mut self, clock: Cycle, value: bool, msgq: &MsgQueue) {
        if self.motor == value {
            return;
        }

        self.switch_speed = self.motor_speed(clock);
        self.switch_cycle = clock;
        self.motor = value;

        // Restart the identification sequence when the motor goes off
        self.id_count = 0;

        msgq.put(Msg::DriveLed { drive: self.nr, on: value });
        msgq.put(Msg::DriveMotor { drive: self.nr, on: value });

        debug!("df{}: motor {}", self.nr, if value { "on" } else { "off" });
    }

    pub fn motor(&self) -> bool {
        self.motor
    }

    pub fn motor_speeding_up(&self, clock: Cycle) -> bool {
        self.motor && self.motor_speed(clock) < 100.0
    }

    pub fn motor_at_full_speed(&self, clock: Cycle) -> bool {
        self.motor_speed(clock) == 100.0
    }

    pub fn motor_slowing_down(&self, clock: Cycle) -> bool {
        !self.motor && self.motor_speed(clock) > 0.0
    }

    pub fn motor_stopped(&self, clock: Cycle) -> bool {
        self.motor_speed(clock) == 0.0
    }

    //
    // Status
    //

    pub fn is_selected(&self) -> bool {
        self.prb & (0b1000 << self.nr) == 0
    }

    /// Contribution of this drive to the PA register of timer chip A.
    /// Inactive bits stay high; the caller ANDs all drives together.
    pub fn drive_status_flags(&self, clock: Cycle) -> u8 {
        let mut result = 0xFF;

        if self.connected && self.is_selected() {
            // PA5: /DSKRDY
            if self.id_mode(clock) {
                if self.id_bit {
                    result &= 0b1101_1111;
                }
            } else if self.has_disk()
                && (self.motor_at_full_speed(clock) || self.motor_slowing_down(clock))
            {
                result &= 0b1101_1111;
            }

            // PA4: /DSKTRACK0
            if self.head.cylinder == 0 {
                result &= 0b1110_1111;
            }

            // PA3: /DSKPROT
            if !self.has_unprotected_disk() {
                result &= 0b1111_0111;
            }

            // PA2: /DSKCHANGE. Stays low after an eject until a disk is
            // inserted and a step pulse arrives.
            if !self.dskchange {
                result &= 0b1111_1011;
            }
        }

        result
    }

    //
    // Head movement
    //

    fn ready_to_step_up(&self, clock: Cycle) -> bool {
        clock - self.latest_step >= self.step_pulse_delay()
            && clock - self.latest_step_down >= self.rev_step_pulse_delay()
    }

    fn ready_to_step_down(&self, clock: Cycle) -> bool {
        clock - self.latest_step >= self.step_pulse_delay()
            && clock - self.latest_step_up >= self.rev_step_pulse_delay()
    }

    /// Move the head one cylinder. `outwards` = towards cylinder 0.
    pub fn step(&mut self, clock: Cycle, outwards: bool, msgq: &MsgQueue) {
        // A step pulse with a disk inserted re-arms the change latch
        if self.has_disk() {
            self.dskchange = true;
        }

        if outwards {
            if !self.ready_to_step_down(clock) {
                trace!("df{}: ignoring head step", self.nr);
                return;
            }
            if self.head.cylinder > 0 {
                self.head.cylinder -= 1;
                self.record_cylinder(self.head.cylinder);
                self.latest_step_completed =
                    clock + self.track_to_track_delay() + self.head_settle_time();
                self.latest_step = clock;
                self.latest_step_down = clock;
            }
        } else {
            if !self.ready_to_step_up(clock) {
                trace!("df{}: ignoring head step", self.nr);
                return;
            }
            if self.head.cylinder < CYLINDER_COUNT - 1 {
                self.head.cylinder += 1;
                self.record_cylinder(self.head.cylinder);
                self.latest_step_completed =
                    clock + self.track_to_track_delay() + self.head_settle_time();
                self.latest_step = clock;
                self.latest_step_up = clock;
            }
        }

        if self.polls_for_disk() {
            msgq.put(Msg::DrivePoll { drive: self.nr, cylinder: self.head.cylinder });
        } else {
            msgq.put(Msg::DriveStep { drive: self.nr, cylinder: self.head.cylinder });
        }
    }

    pub fn select_side(&mut self, head: u8) {
        self.head.head = head & 1;
    }

    fn record_cylinder(&mut self, cylinder: u8) {
        self.cylinder_history = (self.cylinder_history << 8) | cylinder as u64;
    }

    /// Install additional polling signatures (newer boot ROMs)
    pub fn set_poll_signatures(&mut self, signatures: &[u64]) {
        self.extra_poll_signatures = signatures.to_vec();
    }

    /// Detect the boot ROM's empty-drive polling loop from the recorded
    /// head movements
    pub fn polls_for_disk(&self) -> bool {
        // Polling only happens while no disk is inserted
        if self.has_disk() {
            return false;
        }

        let mask = 0xFFFF_FFFF;
        POLL_SIGNATURES
            .iter()
            .chain(self.extra_poll_signatures.iter())
            .any(|sig| self.cylinder_history & mask == sig & mask)
    }

    //
    // Data path
    //

    /// The byte under the head: 0xFF without a disk, noise while the head
    /// settles after a step
    pub fn read_head_byte(&mut self, clock: Cycle) -> u8 {
        match &self.disk {
            None => 0xFF,
            Some(_) if clock < self.latest_step_completed => self.rng.next() & 0x55,
            Some(disk) => disk.read_byte(self.head.cylinder, self.head.head, self.head.offset),
        }
    }

    /// Read a byte and advance the head. Returns (byte, index pulse).
    pub fn read_byte_and_rotate(&mut self, clock: Cycle) -> (u8, bool) {
        let byte = self.read_head_byte(clock);
        let index = if self.motor { self.rotate() } else { false };
        (byte, index)
    }

    /// Read a word, high byte first. Returns (word, index pulse).
    pub fn read_word_and_rotate(&mut self, clock: Cycle) -> (u16, bool) {
        let (hi, idx1) = self.read_byte_and_rotate(clock);
        let (lo, idx2) = self.read_byte_and_rotate(clock);
        (((hi as u16) << 8) | lo as u16, idx1 || idx2)
    }

    pub fn write_head_byte(&mut self, value: u8) {
        if let Some(disk) = self.disk.as_mut() {
            disk.write_byte(self.head.cylinder, self.head.head, self.head.offset, value);
        }
    }

    /// Write a byte and advance the head. Returns true on the index pulse.
    pub fn write_byte_and_rotate(&mut self, value: u8) -> bool {
        self.write_head_byte(value);
        if self.motor {
            self.rotate()
        } else {
            false
        }
    }

    pub fn write_word_and_rotate(&mut self, value: u16) -> bool {
        let idx1 = self.write_byte_and_rotate((value >> 8) as u8);
        let idx2 = self.write_byte_and_rotate(value as u8);
        idx1 || idx2
    }

    /// Advance the head one byte. Returns true when the index mark passes
    /// under the head (track wrap).
    fn rotate(&mut self) -> bool {
        let len = self
            .disk
            .as_ref()
            .map_or(TRACK_LEN_DD, |d| d.track_len(self.head.cylinder, self.head.head));

        self.head.offset += 1;
        if self.head.offset >= len {
            self.head.offset = 0;
            return true;
        }
        false
    }

    /// Move the head to the next sync-mark byte pair (turbo mode)
    pub fn find_sync_mark(&mut self, clock: Cycle) {
        let len = self
            .disk
            .as_ref()
            .map_or(0, |d| d.track_len(self.head.cylinder, self.head.head));

        for _ in 0..len {
            if self.read_byte_and_rotate(clock).0 != 0x44 {
                continue;
            }
            if self.read_byte_and_rotate(clock).0 != 0x89 {
                continue;
            }
            break;
        }
    }

    //
    // Control port
    //

    /// React to a change of the PRB register of timer chip B
    pub fn prb_did_change(&mut self, clock: Cycle, old: u8, new: u8, msgq: &MsgQueue) {
        let sel_mask = 0b1000 << self.nr;

        let old_mtr = old & 0x80 != 0;
        let old_sel = old & sel_mask != 0;
        let old_step = old & 0x01 != 0;

        let new_mtr = new & 0x80 != 0;
        let new_sel = new & sel_mask != 0;
        let new_step = new & 0x01 != 0;
        let new_dir = new & 0x02 != 0;

        self.prb = new;

        // The motor latches on a falling select edge
        if old_sel && !new_sel {
            // Advance the identification shift register
            self.id_count = (self.id_count + 1) % 32;
            self.id_bit = self.drive_id() & (1 << (31 - self.id_count)) != 0;

            if !old_mtr || !new_mtr {
                self.set_motor(clock, true, msgq);
            } else {
                self.set_motor(clock, false, msgq);
            }
        }

        // A rising step edge moves the head if the drive was selected
        if !old_step && new_step && !old_sel {
            self.step(clock, new_dir, msgq);
        }

        // Side select (inverted)
        self.select_side(if new & 0b100 != 0 { 0 } else { 1 });
    }

    //
    // Snapshot access
    //

    pub fn save_state(&self, buf: &mut Vec<u8>) {
        buf.push(self.connected as u8);
        buf.push(self.head.cylinder);
        buf.push(self.head.head);
        buf.extend_from_slice(&(self.head.offset as u32).to_le_bytes());
        buf.push(self.motor as u8);
        buf.extend_from_slice(&self.switch_cycle.to_le_bytes());
        buf.extend_from_slice(&self.switch_speed.to_le_bytes());
        buf.push(self.id_count);
        buf.push(self.id_bit as u8);
        buf.extend_from_slice(&self.latest_step.to_le_bytes());
        buf.extend_from_slice(&self.latest_step_up.to_le_bytes());
        buf.extend_from_slice(&self.latest_step_down.to_le_bytes());
        buf.extend_from_slice(&self.latest_step_completed.to_le_bytes());
        buf.push(self.dskchange as u8);
        buf.push(self.prb);
        buf.extend_from_slice(&self.cylinder_history.to_le_bytes());

        // Media
        match &self.disk {
            None => buf.push(0),
            Some(disk) => {
                buf.push(1);
                buf.push(match disk.diameter {
                    Diameter::Inch35 => 0,
                    Diameter::Inch525 => 1,
                });
                buf.push(match disk.density {
                    Density::Sd => 0,
                    Density::Dd => 1,
                    Density::Hd => 2,
                });
                buf.push(disk.write_protected as u8);
                buf.push(disk.modified as u8);
                for cylinder in 0..CYLINDER_COUNT {
                    for head in 0..2 {
                        let len = disk.track_len(cylinder, head) as u32;
                        buf.extend_from_slice(&len.to_le_bytes());
                        for offset in 0..len as usize {
                            buf.push(disk.read_byte(cylinder, head, offset));
                        }
                    }
                }
            }
        }
    }

    pub fn load_state(&mut self, buf: &[u8]) -> Result<usize, CoreError> {
        const FIXED: usize = 1 + 1 + 1 + 4 + 1 + 8 + 8 + 1 + 1 + 4 * 8 + 1 + 1 + 8 + 1;
        if buf.len() < FIXED {
            return Err(CoreError::SnapshotCorrupted);
        }
        let mut pos = 0;
        self.connected = buf[pos] != 0;
        pos += 1;
        self.head.cylinder = buf[pos];
        pos += 1;
        self.head.head = buf[pos];
        pos += 1;
        self.head.offset = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        self.motor = buf[pos] != 0;
        pos += 1;
        self.switch_cycle = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        self.switch_speed = f64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        self.id_count = buf[pos];
        pos += 1;
        self.id_bit = buf[pos] != 0;
        pos += 1;
        self.latest_step = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        self.latest_step_up = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        self.latest_step_down = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        self.latest_step_completed =
            i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        self.dskchange = buf[pos] != 0;
        pos += 1;
        self.prb = buf[pos];
        pos += 1;
        self.cylinder_history = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;

        let has_disk = buf[pos] != 0;
        pos += 1;
        if !has_disk {
            self.disk = None;
            return Ok(pos);
        }

        if buf.len() < pos + 4 {
            return Err(CoreError::SnapshotCorrupted);
        }
        let diameter = match buf[pos] {
            0 => Diameter::Inch35,
            1 => Diameter::Inch525,
            _ => return Err(CoreError::SnapshotCorrupted),
        };
        let density = match buf[pos + 1] {
            0 => Density::Sd,
            1 => Density::Dd,
            2 => Density::Hd,
            _ => return Err(CoreError::SnapshotCorrupted),
        };
        let write_protected = buf[pos + 2] != 0;
        let modified = buf[pos + 3] != 0;
        pos += 4;

        let mut disk = FloppyDisk::blank(diameter, density);
        disk.write_protected = write_protected;
        for cylinder in 0..CYLINDER_COUNT {
            for head in 0..2 {
                if buf.len() < pos + 4 {
                    return Err(CoreError::SnapshotCorrupted);
                }
                let len =
                    u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
                pos += 4;
                if buf.len() < pos + len {
                    return Err(CoreError::SnapshotCorrupted);
                }
                disk.fill_track(cylinder, head, &buf[pos..pos + len]);
                pos += len;
            }
        }
        disk.modified = modified;
        self.disk = Some(disk);
        Ok(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive() -> Drive {
        let mut drive = Drive::new(0);
        drive.mechanics = DriveMechanics::None;
        drive
    }

    fn select_mask(nr: usize) -> u8 {
        !(0b1000 << nr) as u8
    }

    #[test]
    fn test_step_bounds() {
        let msgq = MsgQueue::new();
        let mut drive = drive();

        // Stepping past cylinder 0 is a no-op
        drive.step(0, true, &msgq);
        assert_eq!(drive.head.cylinder, 0);

        // Step all the way in and past the last cylinder
        for _ in 0..100 {
            drive.step(0, false, &msgq);
        }
        assert_eq!(drive.head.cylinder, CYLINDER_COUNT - 1);
    }

    #[test]
    fn test_step_pulse_delay() {
        let msgq = MsgQueue::new();
        let mut drive = Drive::new(0);
        drive.mechanics = DriveMechanics::A1010;

        drive.step(msec(100), false, &msgq);
        assert_eq!(drive.head.cylinder, 1);

        // A second pulse right away is ignored
        drive.step(msec(100) + 1, false, &msgq);
        assert_eq!(drive.head.cylinder, 1);

        // After the pulse delay it is honored
        drive.step(msec(100) + usec(50), false, &msgq);
        assert_eq!(drive.head.cylinder, 2);
    }

    #[test]
    fn test_motor_ramp() {
        let msgq = MsgQueue::new();
        let mut drive = Drive::new(0);
        drive.mechanics = DriveMechanics::A1010;

        drive.set_motor(0, true, &msgq);
        assert!(drive.motor_speeding_up(msec(10)));
        assert!(drive.motor_speed(msec(190)) > 49.0);
        assert!(drive.motor_at_full_speed(msec(380)));

        drive.set_motor(msec(400), false, &msgq);
        assert!(drive.motor_slowing_down(msec(410)));
        assert!(drive.motor_stopped(msec(500)));
    }

    #[test]
    fn test_read_byte_without_disk() {
        let mut drive = drive();
        assert_eq!(drive.read_head_byte(0), 0xFF);
    }

    #[test]
    fn test_read_noise_while_stepping() {
        let msgq = MsgQueue::new();
        let mut drive = Drive::new(0);
        drive.mechanics = DriveMechanics::A1010;
        drive.disk = Some(FloppyDisk::blank(Diameter::Inch35, Density::Dd));

        drive.step(msec(1), false, &msgq);
        // While the step settles, reads return masked noise
        let byte = drive.read_head_byte(msec(1) + usec(1));
        assert_eq!(byte & !0x55, 0);
    }

    #[test]
    fn test_rotate_wraps_and_reports_index() {
        let mut drive = drive();
        let msgq = MsgQueue::new();
        drive.disk = Some(FloppyDisk::blank(Diameter::Inch35, Density::Dd));
        drive.set_motor(0, true, &msgq);

        let len = drive.disk.as_ref().unwrap().track_len(0, 0);
        let mut pulses = 0;
        for _ in 0..len * 2 {
            if drive.read_byte_and_rotate(0).1 {
                pulses += 1;
            }
        }
        assert_eq!(pulses, 2);
        assert_eq!(drive.head.offset, 0);
    }

    #[test]
    fn test_write_and_read_back() {
        let mut drive = drive();
        let msgq = MsgQueue::new();
        drive.disk = Some(FloppyDisk::blank(Diameter::Inch35, Density::Dd));
        drive.set_motor(0, true, &msgq);

        drive.write_word_and_rotate(0x4489);
        drive.head.offset = 0;
        let (word, _) = drive.read_word_and_rotate(0);
        assert_eq!(word, 0x4489);
        assert!(drive.disk.as_ref().unwrap().modified);
    }

    #[test]
    fn test_insertability() {
        let drive35 = Drive::new(0);
        let dd = FloppyDisk::blank(Diameter::Inch35, Density::Dd);
        let hd = FloppyDisk::blank(Diameter::Inch35, Density::Hd);
        let dd525 = FloppyDisk::blank(Diameter::Inch525, Density::Dd);

        assert!(drive35.is_insertable(&dd).is_ok());
        assert_eq!(drive35.is_insertable(&hd), Err(CoreError::DiskIncompatible));
        assert_eq!(drive35.is_insertable(&dd525), Err(CoreError::DiskIncompatible));
    }

    #[test]
    fn test_disk_change_latch() {
        let msgq = MsgQueue::new();
        let mut drive = drive();
        drive.prb = select_mask(0); // selected
        drive.disk = Some(FloppyDisk::blank(Diameter::Inch35, Density::Dd));
        drive.dskchange = true;

        // Eject pulls /CHNG low
        drive.service_disk_change(false, &msgq);
        assert_eq!(drive.drive_status_flags(0) & 0b0000_0100, 0);

        // Insertion alone does not release the latch
        drive.disk_to_insert = Some(FloppyDisk::blank(Diameter::Inch35, Density::Dd));
        drive.service_disk_change(true, &msgq);
        assert_eq!(drive.drive_status_flags(0) & 0b0000_0100, 0);

        // The first step after the insertion does
        drive.step(0, false, &msgq);
        assert_ne!(drive.drive_status_flags(0) & 0b0000_0100, 0);
    }

    #[test]
    fn test_track0_flag() {
        let msgq = MsgQueue::new();
        let mut drive = drive();
        drive.prb = select_mask(0);

        assert_eq!(drive.drive_status_flags(0) & 0b0001_0000, 0);
        drive.step(0, false, &msgq);
        assert_ne!(drive.drive_status_flags(0) & 0b0001_0000, 0);
    }

    #[test]
    fn test_unselected_drive_is_silent() {
        let drive_unsel = Drive::new(0); // prb = 0xFF, not selected
        assert_eq!(drive_unsel.drive_status_flags(0), 0xFF);
    }

    #[test]
    fn test_polling_detector() {
        let msgq = MsgQueue::new();
        let mut drive = drive();

        // Alternate 0-1 like the 1.x boot ROMs
        for _ in 0..4 {
            drive.step(0, false, &msgq); // to 1
            drive.step(0, true, &msgq); // to 0
        }
        assert!(drive.polls_for_disk());

        // With a disk inserted the same pattern is not polling
        drive.disk = Some(FloppyDisk::blank(Diameter::Inch35, Density::Dd));
        assert!(!drive.polls_for_disk());
    }

    #[test]
    fn test_polling_messages() {
        let msgq = MsgQueue::new();
        let mut drive = drive();

        for _ in 0..4 {
            drive.step(0, false, &msgq);
            drive.step(0, true, &msgq);
        }
        // Drain and find at least one poll message
        let mut seen_poll = false;
        while let Some(msg) = msgq.get() {
            if matches!(msg, Msg::DrivePoll { .. }) {
                seen_poll = true;
            }
        }
        assert!(seen_poll);
    }

    #[test]
    fn test_extension_point_for_signatures() {
        let msgq = MsgQueue::new();
        let mut drive = drive();
        drive.set_poll_signatures(&[0x000200020002]);

        // 0-2-0-2 is not a built-in pattern
        for _ in 0..4 {
            drive.step(0, false, &msgq);
            drive.step(0, false, &msgq); // to 2
            drive.step(0, true, &msgq);
            drive.step(0, true, &msgq); // to 0
        }
        // History low bytes: ... 02 01 00 -> the custom mask matches 0002 0002 pattern?
        // Build the exact history: alternate 2 and 0 via double steps
        let mut drive2 = Drive::new(1);
        drive2.mechanics = DriveMechanics::None;
        drive2.connected = true;
        drive2.cylinder_history = 0x000200020002;
        drive2.set_poll_signatures(&[0x000200020002]);
        assert!(drive2.polls_for_disk());
    }

    #[test]
    fn test_prb_motor_and_id() {
        let msgq = MsgQueue::new();
        let mut drive = Drive::new(1);
        drive.connected = true;
        drive.mechanics = DriveMechanics::None;

        // Falling select edge with MTR low switches the motor on
        let sel = select_mask(1);
        drive.prb_did_change(0, 0xFF, sel & !0x80, &msgq);
        assert!(drive.motor());

        // Deselect, then select with MTR high: motor off
        drive.prb_did_change(0, sel, 0xFF, &msgq);
        drive.prb_did_change(0, 0xFF, sel | 0x80, &msgq);
        assert!(!drive.motor());
    }

    #[test]
    fn test_id_shift_register() {
        let msgq = MsgQueue::new();
        let mut drive = Drive::new(1);
        drive.connected = true;
        drive.mechanics = DriveMechanics::None;
        // External DD drive: id = all ones
        let sel = select_mask(1);

        // Clock the shift register a few times via select edges
        for _ in 0..5 {
            drive.prb_did_change(0, 0xFF, sel | 0x80, &msgq);
            drive.prb_did_change(0, sel | 0x80, 0xFF, &msgq);
        }
        assert!(drive.id_bit);
    }

    #[test]
    fn test_side_select() {
        let msgq = MsgQueue::new();
        let mut drive = drive();
        drive.prb_did_change(0, 0xFF, 0xFF & !0b100, &msgq);
        assert_eq!(drive.head.head, 1);
        drive.prb_did_change(0, 0xFF & !0b100, 0xFF, &msgq);
        assert_eq!(drive.head.head, 0);
    }
}
