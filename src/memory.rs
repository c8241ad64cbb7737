//! Memory regions and bank tables
//!
//! This module owns the RAM and ROM buffers and the two 256-entry bank
//! tables that translate the upper eight bits of a 24-bit address to a
//! region. One table is consulted for CPU accesses, the other for DMA
//! accesses. The access dispatch itself (including waits for a bus-free
//! cycle and the chipset register file) lives in `bus.rs`; this module
//! provides the raw storage operations.
//!
//! Memory map (CPU accessor, A500 bank map):
//!
//! | Address Range       | Region                               |
//! |---------------------|--------------------------------------|
//! | 0x000000 - 0x1FFFFF | Chip RAM and mirrors (overlay at 0)  |
//! | 0xA00000 - 0xBFFFFF | CIA chips and mirrors                |
//! | 0xC00000 - 0xD7FFFF | Slow RAM / custom mirror             |
//! | 0xD80000 - 0xDCFFFF | Real-time clock (per bank map)       |
//! | 0xDE0000 - 0xDFFFFF | Custom chip registers                |
//! | 0xE80000 - 0xE8FFFF | Autoconfig                           |
//! | 0xF80000 - 0xFFFFFF | Kickstart ROM (or WOM on the A1000)  |
//!
//! All 16-bit quantities are big-endian, matching the bus.

use crate::config::{BankMap, RamInitPattern, UnmappedValue};
use crate::error::CoreError;
use crate::zorro::ZorroBoard;
use log::debug;

/// Highest usable address
pub const ADDR_MASK: u32 = 0xFFFFFF;

/// Base of the slow RAM area
pub const SLOW_BASE: u32 = 0xC00000;

/// Base of the Kickstart area
pub const ROM_BASE: u32 = 0xF80000;

/// Base of the ROM mirror area
pub const ROM_MIRROR_BASE: u32 = 0xE00000;

/// Size ceilings checked when loading snapshots and ROMs
pub const CHIP_RAM_MAX: usize = 2048 * 1024;
pub const SLOW_RAM_MAX: usize = 1792 * 1024;
pub const FAST_RAM_MAX: usize = 8192 * 1024;
pub const ROM_MAX: usize = 512 * 1024;

/// Header of an encrypted ROM image
const ENCRYPTED_ROM_HEADER: &[u8] = b"AMIROMTYPE1";

/// Region variants a bank can map to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MemSrc {
    #[default]
    None,
    Chip,
    ChipMirror,
    Slow,
    SlowMirror,
    Fast,
    Cia,
    CiaMirror,
    Rtc,
    Custom,
    CustomMirror,
    Autoconf,
    Zor,
    Rom,
    RomMirror,
    Wom,
    Ext,
}

/// Who is driving the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessor {
    Cpu,
    Agnus,
}

/// Pseudo-random generator for the random RAM fill pattern and the drive's
/// noise byte. A small LFSR keeps results reproducible across hosts.
#[derive(Debug, Clone)]
pub struct Rng {
    state: [u8; 3],
}

impl Rng {
    pub fn new() -> Self {
        Self { state: [0x9A, 0x59, 0xC6] }
    }

    pub fn seed(&mut self, s1: u8, s2: u8, s3: u8) {
        self.state = [s1, s2, s3];
    }

    /// Next pseudo-random byte
    pub fn next(&mut self) -> u8 {
        let bit = ((self.state[0] >> 7)
            ^ (self.state[0] >> 5)
            ^ (self.state[0] >> 4)
            ^ (self.state[0] >> 3))
            & 1;
        let result = self.state[0];
        self.state[0] = (self.state[0] << 1) | ((self.state[1] >> 7) & 1);
        self.state[1] = (self.state[1] << 1) | ((self.state[2] >> 7) & 1);
        self.state[2] = (self.state[2] << 1) | bit;
        result
    }
}

impl Default for Rng {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory buffers and bank tables
#[derive(Debug, Clone)]
pub struct Memory {
    /// Chip RAM (reachable by the DMA engine)
    chip: Vec<u8>,
    /// Slow RAM (chip bus timing, no DMA access)
    slow: Vec<u8>,
    /// Fast RAM (CPU-only, no bus arbitration)
    fast: Vec<u8>,
    /// Kickstart ROM
    rom: Vec<u8>,
    /// Write-once RAM (boot-ROM boards only)
    wom: Vec<u8>,
    /// Extension ROM
    ext: Vec<u8>,

    /// Bank the extension ROM is mapped at (0xE0 or 0xF0)
    ext_start: u8,

    /// Bank table consulted by the CPU accessor
    cpu_src: [MemSrc; 256],
    /// Bank table consulted by the DMA accessor
    agnus_src: [MemSrc; 256],

    /// Value of the most recent data bus transfer
    pub data_bus: u16,

    /// Once true, the WOM is read-only
    pub wom_locked: bool,

    /// Mirror slow RAM into the DMA space (ECS feature)
    pub slow_ram_mirror: bool,

    pub bank_map: BankMap,
    pub unmapping_type: UnmappedValue,
    pub ram_init_pattern: RamInitPattern,

    rng: Rng,
}

impl Memory {
    pub fn new() -> Self {
        Self {
            chip: Vec::new(),
            slow: Vec::new(),
            fast: Vec::new(),
            rom: Vec::new(),
            wom: Vec::new(),
            ext: Vec::new(),
            ext_start: 0xE0,
            cpu_src: [MemSrc::None; 256],
            agnus_src: [MemSrc::None; 256],
            data_bus: 0,
            wom_locked: false,
            slow_ram_mirror: true,
            bank_map: BankMap::A500,
            unmapping_type: UnmappedValue::Floating,
            ram_init_pattern: RamInitPattern::AllZeroes,
            rng: Rng::new(),
        }
    }

    //
    // Allocation
    //

    pub fn alloc_chip(&mut self, kib: usize) {
        self.chip = vec![0; kib * 1024];
    }

    pub fn alloc_slow(&mut self, kib: usize) {
        self.slow = vec![0; kib * 1024];
    }

    pub fn alloc_fast(&mut self, kib: usize) {
        self.fast = vec![0; kib * 1024];
    }

    pub fn chip_size(&self) -> usize {
        self.chip.len()
    }

    pub fn slow_size(&self) -> usize {
        self.slow.len()
    }

    pub fn fast_size(&self) -> usize {
        self.fast.len()
    }

    pub fn rom_size(&self) -> usize {
        self.rom.len()
    }

    pub fn has_rom(&self) -> bool {
        !self.rom.is_empty()
    }

    pub fn has_wom(&self) -> bool {
        !self.wom.is_empty()
    }

    pub fn has_ext(&self) -> bool {
        !self.ext.is_empty()
    }

    /// Raw buffer access for the snapshot writer
    pub fn chip_bytes(&self) -> &[u8] {
        &self.chip
    }

    pub fn chip_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.chip
    }

    pub fn slow_bytes(&self) -> &[u8] {
        &self.slow
    }

    pub fn slow_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.slow
    }

    pub fn fast_bytes(&self) -> &[u8] {
        &self.fast
    }

    pub fn fast_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.fast
    }

    pub fn rom_bytes(&self) -> &[u8] {
        &self.rom
    }

    pub fn wom_bytes(&self) -> &[u8] {
        &self.wom
    }

    pub fn ext_bytes(&self) -> &[u8] {
        &self.ext
    }

    //
    // ROM handling
    //

    /// Install a Kickstart image. Encrypted images need `load_rom_encrypted`.
    pub fn load_rom(&mut self, buf: &[u8]) -> Result<(), CoreError> {
        if buf.starts_with(ENCRYPTED_ROM_HEADER) {
            return Err(CoreError::DecryptionFailed(Some("key required".into())));
        }
        if buf.is_empty() {
            return Err(CoreError::RomMissing);
        }
        if buf.len() > ROM_MAX {
            return Err(CoreError::RomTooLarge);
        }

        self.rom = buf.to_vec();
        debug!("installed ROM ({} KB)", buf.len() / 1024);
        Ok(())
    }

    /// Install an encrypted Kickstart image, decrypting with the given key
    pub fn load_rom_encrypted(&mut self, buf: &[u8], key: &[u8]) -> Result<(), CoreError> {
        if !buf.starts_with(ENCRYPTED_ROM_HEADER) {
            return Err(CoreError::FileTypeMismatch);
        }
        if key.is_empty() {
            return Err(CoreError::DecryptionFailed(Some("empty key".into())));
        }

        let payload = &buf[ENCRYPTED_ROM_HEADER.len()..];
        let decrypted: Vec<u8> = payload
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % key.len()])
            .collect();

        self.load_rom(&decrypted)
    }

    /// Install a boot ROM and the writable WOM it unlocks (A1000 boards)
    pub fn load_boot_rom(&mut self, buf: &[u8]) -> Result<(), CoreError> {
        self.load_rom(buf)?;
        self.wom = vec![0; 256 * 1024];
        self.wom_locked = false;
        Ok(())
    }

    /// Install an extension ROM at bank 0xE0 or 0xF0
    pub fn load_ext(&mut self, buf: &[u8], start: u8) -> Result<(), CoreError> {
        if start != 0xE0 && start != 0xF0 {
            return Err(CoreError::InvalidOptionValue(Some(format!("bank {:02X}", start))));
        }
        if buf.is_empty() {
            return Err(CoreError::RomMissing);
        }
        if buf.len() > ROM_MAX {
            return Err(CoreError::RomTooLarge);
        }

        self.ext = buf.to_vec();
        self.ext_start = start;
        Ok(())
    }

    pub fn delete_rom(&mut self) {
        self.rom.clear();
    }

    //
    // Reset
    //

    /// Re-apply the configured fill pattern to all RAM regions
    pub fn fill_ram_with_init_pattern(&mut self) {
        match self.ram_init_pattern {
            RamInitPattern::AllZeroes => {
                self.chip.fill(0x00);
                self.slow.fill(0x00);
                self.fast.fill(0x00);
            }
            RamInitPattern::AllOnes => {
                self.chip.fill(0xFF);
                self.slow.fill(0xFF);
                self.fast.fill(0xFF);
            }
            RamInitPattern::Random => {
                self.rng = Rng::new();
                for i in 0..self.chip.len() {
                    self.chip[i] = self.rng.next();
                }
                for i in 0..self.slow.len() {
                    self.slow[i] = self.rng.next();
                }
                for i in 0..self.fast.len() {
                    self.fast[i] = self.rng.next();
                }
            }
        }
    }

    //
    // Bank tables
    //

    pub fn cpu_src(&self, addr: u32) -> MemSrc {
        self.cpu_src[((addr & ADDR_MASK) >> 16) as usize]
    }

    pub fn agnus_src(&self, addr: u32) -> MemSrc {
        self.agnus_src[((addr & ADDR_MASK) >> 16) as usize]
    }

    /// Rebuild both bank tables
    ///
    /// `ovl` is the overlay line driven by timer-chip A port bit 0;
    /// `zorro` contributes the autoconfig and Fast RAM banks.
    pub fn update_mem_src_tables(&mut self, ovl: bool, zorro: &ZorroBoard) {
        self.update_cpu_table(ovl, zorro);
        self.update_agnus_table();
    }

    fn update_cpu_table(&mut self, ovl: bool, zorro: &ZorroBoard) {
        let mem_rom = if self.has_rom() { MemSrc::Rom } else { MemSrc::None };
        let mem_wom = if self.has_wom() { MemSrc::Wom } else { mem_rom };
        let mem_rom_mirror = if self.has_rom() { MemSrc::RomMirror } else { MemSrc::None };

        let chip_pages = self.chip.len() / 0x10000;
        let slow_pages = self.slow.len() / 0x10000;
        let old = matches!(self.bank_map, BankMap::A1000 | BankMap::A2000A);

        // Start from scratch
        for entry in self.cpu_src.iter_mut() {
            *entry = MemSrc::None;
        }

        // Chip RAM
        if chip_pages > 0 {
            for i in 0..chip_pages {
                self.cpu_src[i] = MemSrc::Chip;
            }
            for i in chip_pages..=0x1F {
                self.cpu_src[i] = MemSrc::ChipMirror;
            }
        }

        // Timer chips
        for i in 0xA0..=0xBE {
            self.cpu_src[i] = MemSrc::CiaMirror;
        }
        self.cpu_src[0xBF] = MemSrc::Cia;

        // Slow RAM
        for i in 0xC0..=0xD7 {
            self.cpu_src[i] = if i - 0xC0 < slow_pages {
                MemSrc::Slow
            } else {
                MemSrc::CustomMirror
            };
        }

        // Real-time clock (position depends on the board revision)
        for i in 0xD8..=0xDB {
            self.cpu_src[i] = if old { MemSrc::Rtc } else { MemSrc::Custom };
        }
        self.cpu_src[0xDC] = if old { MemSrc::Custom } else { MemSrc::Rtc };

        // Reserved
        self.cpu_src[0xDD] = MemSrc::None;

        // Custom chip set
        self.cpu_src[0xDE] = MemSrc::Custom;
        self.cpu_src[0xDF] = MemSrc::Custom;

        // Kickstart mirror or extension ROM
        if self.bank_map != BankMap::A1000 {
            for i in 0xE0..=0xE7 {
                self.cpu_src[i] = mem_rom_mirror;
            }
        }
        if self.has_ext() && self.ext_start == 0xE0 {
            for i in 0xE0..=0xE7 {
                self.cpu_src[i] = MemSrc::Ext;
            }
        }

        // Autoconfig
        self.cpu_src[0xE8] = MemSrc::Autoconf;

        // Extension ROM at the alternate bank
        if self.has_ext() && self.ext_start == 0xF0 {
            for i in 0xF0..=0xF7 {
                self.cpu_src[i] = MemSrc::Ext;
            }
        }

        // Kickstart WOM or ROM
        for i in 0xF8..=0xFF {
            self.cpu_src[i] = mem_wom;
        }

        // Blend in the boot ROM while the WOM is still writable
        if self.has_wom() && !self.wom_locked {
            for i in 0xF8..=0xFB {
                self.cpu_src[i] = mem_rom;
            }
        }

        // Blend in the ROM in low memory while the overlay line is high
        if ovl {
            for i in 0..8 {
                if self.cpu_src[0xF8 + i] == MemSrc::None {
                    break;
                }
                self.cpu_src[i] = self.cpu_src[0xF8 + i];
            }
        }

        // Expansion boards
        zorro.update_mem_src_table(&mut self.cpu_src);
    }

    fn update_agnus_table(&mut self) {
        let chip_pages = self.chip.len() / 0x10000;

        for entry in self.agnus_src.iter_mut() {
            *entry = MemSrc::None;
        }

        for i in 0..chip_pages {
            self.agnus_src[i] = MemSrc::Chip;
        }

        if self.slow_ram_is_mirrored_in() {
            for i in 0x8..=0xF {
                self.agnus_src[i] = MemSrc::SlowMirror;
            }
        }
    }

    /// ECS-only feature: with 512 KB chip + 512 KB slow, slow RAM shows up
    /// in the second chip segment of the DMA space
    fn slow_ram_is_mirrored_in(&self) -> bool {
        self.slow_ram_mirror
            && self.chip.len() == 512 * 1024
            && self.slow.len() == 512 * 1024
    }

    //
    // Raw region accesses (big-endian, mirror-wrapping)
    //

    fn read8(buf: &[u8], offset: usize) -> u8 {
        buf[offset % buf.len()]
    }

    fn read16(buf: &[u8], offset: usize) -> u16 {
        let len = buf.len();
        let hi = buf[offset % len] as u16;
        let lo = buf[(offset + 1) % len] as u16;
        (hi << 8) | lo
    }

    fn write8(buf: &mut [u8], offset: usize, value: u8) {
        let len = buf.len();
        buf[offset % len] = value;
    }

    fn write16(buf: &mut [u8], offset: usize, value: u16) {
        let len = buf.len();
        buf[offset % len] = (value >> 8) as u8;
        buf[(offset + 1) % len] = value as u8;
    }

    pub fn chip_read8(&self, addr: u32) -> u8 {
        Self::read8(&self.chip, addr as usize)
    }

    pub fn chip_read16(&self, addr: u32) -> u16 {
        Self::read16(&self.chip, (addr & !1) as usize)
    }

    pub fn chip_write8(&mut self, addr: u32, value: u8) {
        Self::write8(&mut self.chip, addr as usize, value);
    }

    pub fn chip_write16(&mut self, addr: u32, value: u16) {
        Self::write16(&mut self.chip, (addr & !1) as usize, value);
    }

    pub fn slow_read8(&self, addr: u32) -> u8 {
        Self::read8(&self.slow, (addr - SLOW_BASE) as usize)
    }

    pub fn slow_read16(&self, addr: u32) -> u16 {
        Self::read16(&self.slow, ((addr - SLOW_BASE) & !1) as usize)
    }

    pub fn slow_write8(&mut self, addr: u32, value: u8) {
        Self::write8(&mut self.slow, (addr - SLOW_BASE) as usize, value);
    }

    pub fn slow_write16(&mut self, addr: u32, value: u16) {
        Self::write16(&mut self.slow, ((addr - SLOW_BASE) & !1) as usize, value);
    }

    /// Slow RAM as seen through the DMA mirror in the second chip segment
    pub fn slow_mirror_read16(&self, addr: u32) -> u16 {
        Self::read16(&self.slow, ((addr - 0x080000) & !1) as usize)
    }

    pub fn slow_mirror_write16(&mut self, addr: u32, value: u16) {
        Self::write16(&mut self.slow, ((addr - 0x080000) & !1) as usize, value);
    }

    pub fn fast_read8(&self, addr: u32, base: u32) -> u8 {
        Self::read8(&self.fast, (addr - base) as usize)
    }

    pub fn fast_read16(&self, addr: u32, base: u32) -> u16 {
        Self::read16(&self.fast, ((addr - base) & !1) as usize)
    }

    pub fn fast_write8(&mut self, addr: u32, base: u32, value: u8) {
        Self::write8(&mut self.fast, (addr - base) as usize, value);
    }

    pub fn fast_write16(&mut self, addr: u32, base: u32, value: u16) {
        Self::write16(&mut self.fast, ((addr - base) & !1) as usize, value);
    }

    pub fn rom_read8(&self, addr: u32) -> u8 {
        Self::read8(&self.rom, addr as usize)
    }

    pub fn rom_read16(&self, addr: u32) -> u16 {
        Self::read16(&self.rom, (addr & !1) as usize)
    }

    /// ROM writes only stick on boards whose ROM region is writable (A1000
    /// boot sequence); everybody else ignores them
    pub fn rom_write16(&mut self, addr: u32, value: u16) {
        if !self.wom_locked && self.has_wom() {
            Self::write16(&mut self.rom, (addr & !1) as usize, value);
        }
    }

    pub fn wom_read8(&self, addr: u32) -> u8 {
        Self::read8(&self.wom, addr as usize)
    }

    pub fn wom_read16(&self, addr: u32) -> u16 {
        Self::read16(&self.wom, (addr & !1) as usize)
    }

    pub fn wom_write8(&mut self, addr: u32, value: u8) {
        if !self.wom_locked {
            Self::write8(&mut self.wom, addr as usize, value);
        }
    }

    pub fn wom_write16(&mut self, addr: u32, value: u16) {
        if !self.wom_locked {
            Self::write16(&mut self.wom, (addr & !1) as usize, value);
        }
    }

    pub fn ext_read8(&self, addr: u32) -> u8 {
        Self::read8(&self.ext, addr as usize)
    }

    pub fn ext_read16(&self, addr: u32) -> u16 {
        Self::read16(&self.ext, (addr & !1) as usize)
    }

    /// Lock the write-once RAM. Triggered by the first write observed in the
    /// ROM-mirror area; the caller rebuilds the bank tables afterwards.
    pub fn lock_wom(&mut self) {
        if !self.wom_locked {
            debug!("locking WOM");
            self.wom_locked = true;
        }
    }

    /// Value returned for reads of unmapped banks
    pub fn unmapped16(&self) -> u16 {
        match self.unmapping_type {
            UnmappedValue::Floating => self.data_bus,
            UnmappedValue::AllOnes => 0xFFFF,
            UnmappedValue::AllZeroes => 0x0000,
        }
    }

    /// A pseudo-random byte (drive noise, uninitialized reads)
    pub fn random_byte(&mut self) -> u8 {
        self.rng.next()
    }

    pub fn seed_rng(&mut self, s1: u8, s2: u8, s3: u8) {
        self.rng.seed(s1, s2, s3);
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(chip_kib: usize, slow_kib: usize) -> Memory {
        let mut mem = Memory::new();
        mem.alloc_chip(chip_kib);
        mem.alloc_slow(slow_kib);
        mem.update_mem_src_tables(false, &ZorroBoard::new(0));
        mem
    }

    #[test]
    fn test_chip_banks() {
        let mem = memory_with(512, 0);

        assert_eq!(mem.cpu_src(0x000000), MemSrc::Chip);
        assert_eq!(mem.cpu_src(0x070000), MemSrc::Chip);
        assert_eq!(mem.cpu_src(0x080000), MemSrc::ChipMirror);
        assert_eq!(mem.cpu_src(0x1F0000), MemSrc::ChipMirror);
        assert_eq!(mem.cpu_src(0x200000), MemSrc::None);
    }

    #[test]
    fn test_cia_banks() {
        let mem = memory_with(512, 0);

        assert_eq!(mem.cpu_src(0xA00000), MemSrc::CiaMirror);
        assert_eq!(mem.cpu_src(0xBE0000), MemSrc::CiaMirror);
        assert_eq!(mem.cpu_src(0xBF0000), MemSrc::Cia);
    }

    #[test]
    fn test_slow_banks() {
        let mem = memory_with(512, 512);

        assert_eq!(mem.cpu_src(0xC00000), MemSrc::Slow);
        assert_eq!(mem.cpu_src(0xC70000), MemSrc::Slow);
        assert_eq!(mem.cpu_src(0xC80000), MemSrc::CustomMirror);
        assert_eq!(mem.cpu_src(0xD70000), MemSrc::CustomMirror);
    }

    #[test]
    fn test_rtc_position_follows_bank_map() {
        let mut mem = memory_with(512, 0);

        // Newer boards: RTC at 0xDC
        assert_eq!(mem.cpu_src(0xD80000), MemSrc::Custom);
        assert_eq!(mem.cpu_src(0xDC0000), MemSrc::Rtc);

        // Older boards: RTC at 0xD8
        mem.bank_map = BankMap::A2000A;
        mem.update_mem_src_tables(false, &ZorroBoard::new(0));
        assert_eq!(mem.cpu_src(0xD80000), MemSrc::Rtc);
        assert_eq!(mem.cpu_src(0xDC0000), MemSrc::Custom);
    }

    #[test]
    fn test_custom_banks() {
        let mem = memory_with(512, 0);
        assert_eq!(mem.cpu_src(0xDD0000), MemSrc::None);
        assert_eq!(mem.cpu_src(0xDE0000), MemSrc::Custom);
        assert_eq!(mem.cpu_src(0xDF0000), MemSrc::Custom);
        assert_eq!(mem.cpu_src(0xE80000), MemSrc::Autoconf);
    }

    #[test]
    fn test_rom_banks_and_mirror() {
        let mut mem = memory_with(512, 0);
        mem.load_rom(&vec![0xAA; 256 * 1024]).unwrap();
        mem.update_mem_src_tables(false, &ZorroBoard::new(0));

        assert_eq!(mem.cpu_src(0xF80000), MemSrc::Rom);
        assert_eq!(mem.cpu_src(0xFF0000), MemSrc::Rom);
        assert_eq!(mem.cpu_src(0xE00000), MemSrc::RomMirror);

        // The A1000 map has no ROM mirror
        mem.bank_map = BankMap::A1000;
        mem.update_mem_src_tables(false, &ZorroBoard::new(0));
        assert_eq!(mem.cpu_src(0xE00000), MemSrc::None);
    }

    #[test]
    fn test_overlay_mirrors_rom_into_low_memory() {
        let mut mem = memory_with(512, 0);
        mem.load_rom(&vec![0xAA; 256 * 1024]).unwrap();

        mem.update_mem_src_tables(true, &ZorroBoard::new(0));
        assert_eq!(mem.cpu_src(0x000000), MemSrc::Rom);
        assert_eq!(mem.cpu_src(0x070000), MemSrc::Rom);

        mem.update_mem_src_tables(false, &ZorroBoard::new(0));
        assert_eq!(mem.cpu_src(0x000000), MemSrc::Chip);
    }

    #[test]
    fn test_wom_lock_changes_table() {
        let mut mem = memory_with(256, 0);
        mem.bank_map = BankMap::A1000;
        mem.load_boot_rom(&vec![0x11; 64 * 1024]).unwrap();
        mem.update_mem_src_tables(false, &ZorroBoard::new(0));

        // Boot ROM visible in the lower WOM banks while unlocked
        assert_eq!(mem.cpu_src(0xF80000), MemSrc::Rom);
        assert_eq!(mem.cpu_src(0xFC0000), MemSrc::Wom);

        mem.lock_wom();
        mem.update_mem_src_tables(false, &ZorroBoard::new(0));
        assert_eq!(mem.cpu_src(0xF80000), MemSrc::Wom);
    }

    #[test]
    fn test_agnus_table_chip_only() {
        let mut mem = memory_with(512, 0);
        mem.alloc_fast(1024);
        mem.update_mem_src_tables(false, &ZorroBoard::new(1024));

        assert_eq!(mem.agnus_src(0x000000), MemSrc::Chip);
        assert_eq!(mem.agnus_src(0x070000), MemSrc::Chip);
        // Fast RAM is never reachable from the DMA accessor
        for page in 8..=0xFF_u32 {
            assert_eq!(mem.agnus_src(page << 16), MemSrc::None);
        }
    }

    #[test]
    fn test_agnus_slow_mirror() {
        let mem = memory_with(512, 512);
        assert_eq!(mem.agnus_src(0x080000), MemSrc::SlowMirror);
        assert_eq!(mem.agnus_src(0x0F0000), MemSrc::SlowMirror);
    }

    #[test]
    fn test_chip_roundtrip_and_mirror() {
        let mut mem = memory_with(512, 0);
        mem.chip_write16(0x1234, 0xBEEF);
        assert_eq!(mem.chip_read16(0x1234), 0xBEEF);

        // Big-endian byte order
        assert_eq!(mem.chip_read8(0x1234), 0xBE);
        assert_eq!(mem.chip_read8(0x1235), 0xEF);

        // A mirror access resolves to the same cell
        assert_eq!(mem.chip_read16(0x1234 + 512 * 1024), 0xBEEF);
    }

    #[test]
    fn test_slow_roundtrip() {
        let mut mem = memory_with(512, 512);
        mem.slow_write16(0xC00100, 0x1234);
        assert_eq!(mem.slow_read16(0xC00100), 0x1234);
        assert_eq!(mem.slow_mirror_read16(0x080100), 0x1234);
    }

    #[test]
    fn test_fill_patterns() {
        let mut mem = memory_with(256, 0);

        mem.ram_init_pattern = RamInitPattern::AllOnes;
        mem.fill_ram_with_init_pattern();
        assert_eq!(mem.chip_read8(0), 0xFF);

        mem.ram_init_pattern = RamInitPattern::AllZeroes;
        mem.fill_ram_with_init_pattern();
        assert_eq!(mem.chip_read8(0), 0x00);

        mem.ram_init_pattern = RamInitPattern::Random;
        mem.fill_ram_with_init_pattern();
        let a = mem.chip_read8(0);
        let b = mem.chip_read8(1);
        let c = mem.chip_read8(2);
        // The pattern is deterministic for a fresh generator
        mem.fill_ram_with_init_pattern();
        assert_eq!(mem.chip_read8(0), a);
        assert_eq!(mem.chip_read8(1), b);
        assert_eq!(mem.chip_read8(2), c);
    }

    #[test]
    fn test_rom_loading_errors() {
        let mut mem = Memory::new();
        assert_eq!(mem.load_rom(&[]), Err(CoreError::RomMissing));
        assert_eq!(
            mem.load_rom(&vec![0; ROM_MAX + 1]),
            Err(CoreError::RomTooLarge)
        );

        let mut encrypted = b"AMIROMTYPE1".to_vec();
        encrypted.extend_from_slice(&[0x55; 16]);
        assert!(matches!(
            mem.load_rom(&encrypted),
            Err(CoreError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_encrypted_rom_roundtrip() {
        let key = [0x13, 0x37, 0xC0];
        let plain: Vec<u8> = (0u32..64).map(|i| (i * 7) as u8).collect();

        let mut image = b"AMIROMTYPE1".to_vec();
        for (i, b) in plain.iter().enumerate() {
            image.push(b ^ key[i % key.len()]);
        }

        let mut mem = Memory::new();
        mem.load_rom_encrypted(&image, &key).unwrap();
        assert_eq!(mem.rom_bytes(), &plain[..]);

        assert_eq!(
            mem.load_rom_encrypted(&plain, &key),
            Err(CoreError::FileTypeMismatch)
        );
    }

    #[test]
    fn test_unmapped_value_follows_config() {
        let mut mem = Memory::new();
        mem.data_bus = 0xABCD;

        mem.unmapping_type = UnmappedValue::Floating;
        assert_eq!(mem.unmapped16(), 0xABCD);

        mem.unmapping_type = UnmappedValue::AllOnes;
        assert_eq!(mem.unmapped16(), 0xFFFF);

        mem.unmapping_type = UnmappedValue::AllZeroes;
        assert_eq!(mem.unmapped16(), 0x0000);
    }

    #[test]
    fn test_rng_determinism() {
        let mut mem = Memory::new();
        mem.seed_rng(0x12, 0x34, 0x56);
        assert_eq!(mem.random_byte(), 0x12);
        let second = mem.random_byte();

        let mut mem2 = Memory::new();
        mem2.seed_rng(0x12, 0x34, 0x56);
        assert_eq!(mem2.random_byte(), 0x12);
        assert_eq!(mem2.random_byte(), second);
    }
}
