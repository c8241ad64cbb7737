//! Snapshots
//!
//! A snapshot is a header, the serialized state of every component in a
//! fixed order, and the raw memory regions. ROMs are only included when the
//! save-ROMs flag is set. Loading verifies the magic, the version and the
//! region sizes before any state is touched.

use crate::agnus::{ChipReg, DmaFlags, RegChange};
use crate::bus::Bus;
use crate::cpu::{Cpu, DebugFlags};
use crate::error::CoreError;
use crate::memory::{CHIP_RAM_MAX, FAST_RAM_MAX, ROM_MAX, SLOW_RAM_MAX};

/// Snapshot file magic
pub const MAGIC: [u8; 4] = *b"ACSS";

fn version() -> [u8; 3] {
    let mut parts = env!("CARGO_PKG_VERSION").split('.');
    let mut next = || {
        parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .unwrap_or(0)
    };
    [next(), next(), next()]
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// A length-prefixed region
    fn region(&mut self, bytes: &[u8]) {
        self.u32(bytes.len() as u32);
        self.bytes(bytes);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), CoreError> {
        if self.pos + n > self.buf.len() {
            return Err(CoreError::SnapshotCorrupted);
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CoreError> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, CoreError> {
        self.need(2)?;
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, CoreError> {
        self.need(4)?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn i64(&mut self) -> Result<i64, CoreError> {
        self.need(8)?;
        let v = i64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn rest(&mut self) -> &'a [u8] {
        let buf: &'a [u8] = self.buf;
        let rest = &buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Hand a component the remaining bytes and advance past what it read
    fn component<F>(&mut self, f: F) -> Result<(), CoreError>
    where
        F: FnOnce(&[u8]) -> Result<usize, CoreError>,
    {
        let used = f(&self.buf[self.pos..])?;
        self.pos += used;
        Ok(())
    }

    fn region(&mut self) -> Result<&'a [u8], CoreError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let buf: &'a [u8] = self.buf;
        let bytes = &buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}

/// Serialize the whole core
pub fn save(cpu: &Cpu, bus: &Bus, save_roms: bool) -> Vec<u8> {
    let mut w = Writer::new();

    // Header
    w.bytes(&MAGIC);
    w.bytes(&version());
    w.u8(save_roms as u8);
    w.u32(bus.mem.chip_size() as u32);
    w.u32(bus.mem.slow_size() as u32);
    w.u32(bus.mem.fast_size() as u32);

    // CPU adapter
    w.i64(cpu.clock);
    w.u8(cpu.get_ipl());
    w.u8(cpu.overclocking as u8);
    w.i64(cpu.debt);
    w.i64(cpu.slow_cycles);
    w.u8(cpu.flags.bits());
    w.u32(cpu.pc);
    w.u32(cpu.ssp);

    // Agnus
    w.i64(bus.agnus.clock);
    w.i64(bus.agnus.frame);
    w.u16(bus.agnus.dmacon.bits());
    w.u32(bus.agnus.dskpt);
    for n in 0..4 {
        w.u32(bus.agnus.audlc[n]);
        w.u32(bus.agnus.audpt[n]);
    }
    w.u32(bus.agnus.ptr_mask);

    let changes = bus.agnus.pending_changes();
    w.u32(changes.len() as u32);
    for change in changes {
        w.i64(change.cycle);
        w.u8(change.reg as u8);
        w.u16(change.value);
    }

    bus.agnus.scheduler.save_state(&mut w.buf);

    // Memory bookkeeping (the raw buffers follow at the end)
    w.u16(bus.mem.data_bus);
    w.u8(bus.mem.wom_locked as u8);

    // Paula
    bus.paula.irq.save_state(&mut w.buf);
    w.u16(bus.paula.adkcon);
    bus.paula.pot.save_state(&mut w.buf);
    for channel in &bus.paula.audio {
        channel.save_state(&mut w.buf);
    }
    bus.paula.disk.save_state(&mut w.buf);
    bus.paula.uart.save_state(&mut w.buf);

    // Timer chips
    bus.ciaa.save_state(&mut w.buf);
    bus.ciab.save_state(&mut w.buf);

    // Real-time clock
    bus.rtc.save_state(&mut w.buf);

    // Drives
    for drive in &bus.df {
        drive.save_state(&mut w.buf);
    }

    // Memory regions in fixed order
    w.region(bus.mem.chip_bytes());
    w.region(bus.mem.slow_bytes());
    w.region(bus.mem.fast_bytes());
    if save_roms {
        w.region(bus.mem.rom_bytes());
        w.region(bus.mem.wom_bytes());
        w.region(bus.mem.ext_bytes());
    }

    w.buf
}

/// Restore a previously saved core
pub fn load(cpu: &mut Cpu, bus: &mut Bus, buf: &[u8]) -> Result<(), CoreError> {
    let mut r = Reader::new(buf);

    // Header
    r.need(4)?;
    if r.buf[..4] != MAGIC {
        return Err(CoreError::SnapshotCorrupted);
    }
    r.pos += 4;

    let found = [r.u8()?, r.u8()?, r.u8()?];
    let expected = version();
    if found != expected {
        return Err(CoreError::SnapshotVersion {
            expected: format!("{}.{}.{}", expected[0], expected[1], expected[2]),
            found: format!("{}.{}.{}", found[0], found[1], found[2]),
        });
    }

    let saved_roms = r.u8()? != 0;
    let chip_size = r.u32()? as usize;
    let slow_size = r.u32()? as usize;
    let fast_size = r.u32()? as usize;

    // Sanity-check the region sizes before touching anything
    if chip_size > CHIP_RAM_MAX || slow_size > SLOW_RAM_MAX || fast_size > FAST_RAM_MAX {
        return Err(CoreError::SnapshotCorrupted);
    }

    // CPU adapter
    cpu.clock = r.i64()?;
    cpu.set_ipl(r.u8()?);
    cpu.overclocking = r.u8()? as usize;
    cpu.debt = r.i64()?;
    cpu.slow_cycles = r.i64()?;
    cpu.flags = DebugFlags::from_bits_truncate(r.u8()?);
    cpu.pc = r.u32()?;
    cpu.ssp = r.u32()?;

    // Agnus
    bus.agnus.clock = r.i64()?;
    bus.agnus.frame = r.i64()?;
    bus.agnus.dmacon = DmaFlags::from_bits_truncate(r.u16()?);
    bus.agnus.dskpt = r.u32()?;
    for n in 0..4 {
        bus.agnus.audlc[n] = r.u32()?;
        bus.agnus.audpt[n] = r.u32()?;
    }
    bus.agnus.ptr_mask = r.u32()?;

    let change_count = r.u32()? as usize;
    if change_count > 1024 {
        return Err(CoreError::SnapshotCorrupted);
    }
    let mut changes = Vec::with_capacity(change_count);
    for _ in 0..change_count {
        let cycle = r.i64()?;
        let reg = match r.u8()? {
            0 => ChipReg::Intreq,
            1 => ChipReg::Intena,
            2 => ChipReg::Dmacon,
            3 => ChipReg::Adkcon,
            4 => ChipReg::Serdat,
            _ => return Err(CoreError::SnapshotCorrupted),
        };
        let value = r.u16()?;
        changes.push(RegChange { cycle, reg, value });
    }
    bus.agnus.restore_changes(changes);

    r.component(|b| bus.agnus.scheduler.load_state(b))?;

    // Memory bookkeeping
    bus.mem.data_bus = r.u16()?;
    let wom_locked = r.u8()? != 0;

    // Paula
    r.component(|b| bus.paula.irq.load_state(b))?;
    bus.paula.adkcon = r.u16()?;
    r.component(|b| bus.paula.pot.load_state(b))?;
    for channel in bus.paula.audio.iter_mut() {
        r.component(|b| channel.load_state(b))?;
    }
    r.component(|b| bus.paula.disk.load_state(b))?;
    r.component(|b| bus.paula.uart.load_state(b))?;

    // Timer chips
    r.component(|b| bus.ciaa.load_state(b))?;
    r.component(|b| bus.ciab.load_state(b))?;

    // Real-time clock
    r.component(|b| bus.rtc.load_state(b))?;

    // Drives
    for drive in bus.df.iter_mut() {
        r.component(|b| drive.load_state(b))?;
    }

    // Memory regions
    bus.mem.alloc_chip(chip_size / 1024);
    bus.mem.alloc_slow(slow_size / 1024);
    bus.mem.alloc_fast(fast_size / 1024);

    let chip = r.region()?;
    if chip.len() != chip_size {
        return Err(CoreError::SnapshotCorrupted);
    }
    bus.mem.chip_bytes_mut().copy_from_slice(chip);

    let slow = r.region()?;
    if slow.len() != slow_size {
        return Err(CoreError::SnapshotCorrupted);
    }
    bus.mem.slow_bytes_mut().copy_from_slice(slow);

    let fast = r.region()?;
    if fast.len() != fast_size {
        return Err(CoreError::SnapshotCorrupted);
    }
    bus.mem.fast_bytes_mut().copy_from_slice(fast);

    if saved_roms {
        let rom = r.region()?.to_vec();
        let wom = r.region()?.to_vec();
        let ext = r.region()?.to_vec();
        if rom.len() > ROM_MAX || wom.len() > ROM_MAX || ext.len() > ROM_MAX {
            return Err(CoreError::SnapshotCorrupted);
        }
        if !rom.is_empty() {
            bus.mem.load_rom(&rom)?;
        }
        if !ext.is_empty() {
            bus.mem.load_ext(&ext, 0xE0)?;
        }
        let _ = wom;
    }

    // Rebuild the derived state
    bus.mem.wom_locked = wom_locked;
    bus.update_mem_src_tables();

    let _ = r.rest();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{dma_cycles, EventId, Slot};

    fn configured_core() -> (Cpu, Bus) {
        let mut bus = Bus::new();
        bus.mem.alloc_chip(512);
        bus.mem.alloc_slow(256);
        bus.update_mem_src_tables();
        bus.schedule_initial_events();
        let mut cpu = Cpu::new();

        // Leave some fingerprints
        bus.cpu_poke16(&mut cpu, 0x001234, 0xC0DE);
        bus.cpu_poke16(&mut cpu, 0xC00010, 0xF00D);
        bus.cpu_poke16(&mut cpu, 0xDFF09A, 0xC008);
        bus.execute_dma_cycles(&mut cpu, 40);
        bus.agnus
            .scheduler
            .schedule_abs(Slot::Dsk, dma_cycles(5000), EventId::DskRotate);
        cpu.pc = 0x00FC_0000;

        (cpu, bus)
    }

    #[test]
    fn test_roundtrip_is_observably_identical() {
        let (cpu, bus) = configured_core();
        let image = save(&cpu, &bus, false);

        let mut cpu2 = Cpu::new();
        let mut bus2 = Bus::new();
        load(&mut cpu2, &mut bus2, &image).unwrap();

        assert_eq!(cpu2.clock, cpu.clock);
        assert_eq!(cpu2.pc, cpu.pc);
        assert_eq!(bus2.agnus.clock, bus.agnus.clock);
        assert_eq!(bus2.paula.irq.intena, bus.paula.irq.intena);
        assert_eq!(bus2.mem.chip_read16(0x001234), 0xC0DE);
        assert_eq!(bus2.mem.slow_read16(0xC00010), 0xF00D);

        // The scheduler queue came back
        assert_eq!(
            bus2.agnus.scheduler.trigger[Slot::Dsk as usize],
            dma_cycles(5000)
        );
        assert_eq!(
            bus2.agnus.scheduler.id[Slot::Dsk as usize],
            EventId::DskRotate
        );

        // Saving the restored core produces identical bytes
        let image2 = save(&cpu2, &bus2, false);
        assert_eq!(image, image2);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let (cpu, bus) = configured_core();
        let mut image = save(&cpu, &bus, false);
        image[0] = b'X';

        let mut cpu2 = Cpu::new();
        let mut bus2 = Bus::new();
        assert_eq!(
            load(&mut cpu2, &mut bus2, &image),
            Err(CoreError::SnapshotCorrupted)
        );
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let (cpu, bus) = configured_core();
        let mut image = save(&cpu, &bus, false);
        image[4] = image[4].wrapping_add(1);

        let mut cpu2 = Cpu::new();
        let mut bus2 = Bus::new();
        assert!(matches!(
            load(&mut cpu2, &mut bus2, &image),
            Err(CoreError::SnapshotVersion { .. })
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let (cpu, bus) = configured_core();
        let image = save(&cpu, &bus, false);

        let mut cpu2 = Cpu::new();
        let mut bus2 = Bus::new();
        assert_eq!(
            load(&mut cpu2, &mut bus2, &image[..image.len() - 100]),
            Err(CoreError::SnapshotCorrupted)
        );
    }

    #[test]
    fn test_oversized_region_rejected() {
        let (cpu, bus) = configured_core();
        let mut image = save(&cpu, &bus, false);
        // Patch the chip size field beyond the ceiling
        let size = (3 * 1024 * 1024u32).to_le_bytes();
        image[8..12].copy_from_slice(&size);

        let mut cpu2 = Cpu::new();
        let mut bus2 = Bus::new();
        assert_eq!(
            load(&mut cpu2, &mut bus2, &image),
            Err(CoreError::SnapshotCorrupted)
        );
    }

    #[test]
    fn test_roms_follow_flag() {
        let (cpu, mut bus) = configured_core();
        bus.mem.load_rom(&vec![0xAB; 128 * 1024]).unwrap();

        let without = save(&cpu, &bus, false);
        let with = save(&cpu, &bus, true);
        assert!(with.len() > without.len() + 128 * 1024);

        let mut cpu2 = Cpu::new();
        let mut bus2 = Bus::new();
        load(&mut cpu2, &mut bus2, &with).unwrap();
        assert_eq!(bus2.mem.rom_bytes(), bus.mem.rom_bytes());

        let mut bus3 = Bus::new();
        load(&mut cpu2, &mut bus3, &without).unwrap();
        assert!(!bus3.mem.has_rom());
    }

    #[test]
    fn test_disk_travels_with_drive() {
        let (cpu, mut bus) = configured_core();
        let mut disk = crate::drive::FloppyDisk::blank(
            crate::drive::Diameter::Inch35,
            crate::drive::Density::Dd,
        );
        disk.fill_track(2, 1, &[0xDE, 0xAD, 0xBE, 0xEF]);
        bus.df[0].disk = Some(disk);

        let image = save(&cpu, &bus, false);
        let mut cpu2 = Cpu::new();
        let mut bus2 = Bus::new();
        load(&mut cpu2, &mut bus2, &image).unwrap();

        let restored = bus2.df[0].disk.as_ref().unwrap();
        assert_eq!(restored.read_byte(2, 1, 0), 0xDE);
        assert_eq!(restored.read_byte(2, 1, 3), 0xEF);
    }
}
