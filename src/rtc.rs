//! Real-time clock
//!
//! An Oki-style clock chip in the RTC bank: sixteen 4-bit registers, one
//! BCD digit each, mapped to the odd byte of every fourth address. The
//! visible time is the host clock plus a delta; guest writes adjust the
//! delta, so the clock keeps running between accesses. The three control
//! registers are stored as written.

use chrono::{Datelike, NaiveDate, Timelike};
use log::trace;

/// Register indices
mod regs {
    pub const SEC1: usize = 0;
    pub const SEC10: usize = 1;
    pub const MIN1: usize = 2;
    pub const MIN10: usize = 3;
    pub const HOUR1: usize = 4;
    pub const HOUR10: usize = 5;
    pub const DAY1: usize = 6;
    pub const DAY10: usize = 7;
    pub const MON1: usize = 8;
    pub const MON10: usize = 9;
    pub const YEAR1: usize = 10;
    pub const YEAR10: usize = 11;
    pub const WEEKDAY: usize = 12;
    pub const CTRL_D: usize = 13;
    pub const CTRL_E: usize = 14;
    pub const CTRL_F: usize = 15;
}

/// Clock chip state
#[derive(Debug, Clone)]
pub struct Rtc {
    /// Seconds added to the host clock
    delta: i64,
    /// Control registers D, E, F
    ctrl: [u8; 3],
    /// Fixed time source for deterministic tests (unix seconds)
    fixed_now: Option<i64>,
}

impl Rtc {
    pub fn new() -> Self {
        Self {
            delta: 0,
            ctrl: [0; 3],
            fixed_now: None,
        }
    }

    pub fn reset(&mut self) {
        self.ctrl = [0; 3];
    }

    /// Pin the time source (tests)
    pub fn set_fixed_time(&mut self, unix_seconds: i64) {
        self.fixed_now = Some(unix_seconds);
    }

    fn host_seconds(&self) -> i64 {
        match self.fixed_now {
            Some(seconds) => seconds,
            None => chrono::Utc::now().timestamp(),
        }
    }

    fn shown_time(&self) -> chrono::NaiveDateTime {
        let seconds = self.host_seconds() + self.delta;
        chrono::DateTime::from_timestamp(seconds, 0)
            .map(|dt| dt.naive_utc())
            .unwrap_or_default()
    }

    /// Current value of a time register
    fn time_register(&self, reg: usize) -> u8 {
        let time = self.shown_time();
        let value = match reg {
            regs::SEC1 => time.second() % 10,
            regs::SEC10 => time.second() / 10,
            regs::MIN1 => time.minute() % 10,
            regs::MIN10 => time.minute() / 10,
            regs::HOUR1 => time.hour() % 10,
            regs::HOUR10 => time.hour() / 10,
            regs::DAY1 => time.day() % 10,
            regs::DAY10 => time.day() / 10,
            regs::MON1 => time.month() % 10,
            regs::MON10 => time.month() / 10,
            regs::YEAR1 => (time.year() as u32) % 10,
            regs::YEAR10 => (time.year() as u32 / 10) % 10,
            regs::WEEKDAY => time.weekday().num_days_from_sunday(),
            _ => 0,
        };
        value as u8
    }

    fn register_index(addr: u32) -> usize {
        ((addr >> 2) & 0xF) as usize
    }

    /// Read a register byte. The chip answers on odd addresses; even
    /// addresses float.
    pub fn peek8(&self, addr: u32) -> u8 {
        self.spypeek8(addr)
    }

    pub fn spypeek8(&self, addr: u32) -> u8 {
        if addr & 1 == 0 {
            return 0;
        }
        let reg = Self::register_index(addr);
        match reg {
            regs::CTRL_D => self.ctrl[0] & 0xF,
            regs::CTRL_E => self.ctrl[1] & 0xF,
            regs::CTRL_F => self.ctrl[2] & 0xF,
            _ => self.time_register(reg) & 0xF,
        }
    }

    /// Write a register byte; time writes shift the delta
    pub fn poke8(&mut self, addr: u32, value: u8) {
        if addr & 1 == 0 {
            return;
        }
        let reg = Self::register_index(addr);
        let value = value & 0xF;
        trace!("rtc: reg {} = {:X}", reg, value);

        match reg {
            regs::CTRL_D => self.ctrl[0] = value,
            regs::CTRL_E => self.ctrl[1] = value,
            regs::CTRL_F => self.ctrl[2] = value,
            regs::WEEKDAY => {}
            _ => self.write_time_register(reg, value),
        }
    }

    fn write_time_register(&mut self, reg: usize, value: u8) {
        // Collect the current digits, replace one, rebuild the timestamp
        let mut digits = [0u8; 12];
        for (i, digit) in digits.iter_mut().enumerate() {
            *digit = self.time_register(i);
        }
        digits[reg] = value;

        let second = (digits[regs::SEC10] * 10 + digits[regs::SEC1]) as u32;
        let minute = (digits[regs::MIN10] * 10 + digits[regs::MIN1]) as u32;
        let hour = (digits[regs::HOUR10] * 10 + digits[regs::HOUR1]) as u32;
        let day = (digits[regs::DAY10] * 10 + digits[regs::DAY1]) as u32;
        let month = (digits[regs::MON10] * 10 + digits[regs::MON1]) as u32;
        let year = (digits[regs::YEAR10] as i32 * 10 + digits[regs::YEAR1] as i32)
            + (self.shown_time().year() / 100) * 100;

        let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
            return;
        };
        let Some(time) = date.and_hms_opt(hour, minute, second) else {
            return;
        };

        self.delta = time.and_utc().timestamp() - self.host_seconds();
    }

    //
    // Snapshot access
    //

    pub const SNAPSHOT_SIZE: usize = 8 + 3;

    pub fn save_state(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.delta.to_le_bytes());
        buf.extend_from_slice(&self.ctrl);
    }

    pub fn load_state(&mut self, buf: &[u8]) -> Result<usize, crate::error::CoreError> {
        use crate::error::CoreError;
        if buf.len() < Self::SNAPSHOT_SIZE {
            return Err(CoreError::SnapshotCorrupted);
        }
        self.delta = i64::from_le_bytes(buf[..8].try_into().unwrap());
        self.ctrl.copy_from_slice(&buf[8..11]);
        Ok(Self::SNAPSHOT_SIZE)
    }
}

impl Default for Rtc {
    fn default() -> Self {
        Self::new()
    }
}
