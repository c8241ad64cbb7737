//! End-to-end scenarios
//!
//! These tests drive the assembled core through its public access paths:
//! chipset registers through the CPU accessor, drive control through the
//! timer-chip ports, and time through the DMA-cycle clock.

use crate::agnus::HPOS_CNT;
use crate::amiga::Amiga;
use crate::config::ConfigOption;
use crate::drive::{Density, Diameter, FloppyDisk};
use crate::paula::disk::DriveDmaState;
use crate::paula::IrqSource;
use crate::scheduler::{dma_cycles, EventId, Slot};

/// A powered core with a ROM whose reset vectors point into itself
fn powered_amiga() -> Amiga {
    let mut amiga = Amiga::new();
    let mut rom = vec![0u8; 256 * 1024];
    rom[0..4].copy_from_slice(&0x0002_0000u32.to_be_bytes());
    rom[4..8].copy_from_slice(&0x00F8_0010u32.to_be_bytes());
    for (i, byte) in rom.iter_mut().enumerate().skip(8) {
        *byte = (i * 7) as u8;
    }
    amiga.load_rom(&rom).unwrap();
    amiga.power_on().unwrap();
    amiga
}

fn poke16(amiga: &mut Amiga, addr: u32, value: u16) {
    let Amiga { cpu, bus, .. } = amiga;
    bus.cpu_poke16(cpu, addr, value);
}

fn peek16(amiga: &mut Amiga, addr: u32) -> u16 {
    let Amiga { cpu, bus, .. } = amiga;
    bus.cpu_peek16(cpu, addr)
}

fn poke8(amiga: &mut Amiga, addr: u32, value: u8) {
    let Amiga { cpu, bus, .. } = amiga;
    bus.cpu_poke8(cpu, addr, value);
}

fn peek8(amiga: &mut Amiga, addr: u32) -> u8 {
    let Amiga { cpu, bus, .. } = amiga;
    bus.cpu_peek8(cpu, addr)
}

/// Select drive 0 and switch its motor on through the timer-chip port
fn spin_up_drive0(amiga: &mut Amiga) {
    amiga.set_option(ConfigOption::DriveMechanics(0), 0).unwrap();
    poke8(amiga, 0xBFD300, 0xFF); // DDRB: all outputs
    poke8(amiga, 0xBFD100, !0b0000_1000u8 & !0x80); // SEL0 low, MTR low
    assert_eq!(amiga.bus.paula.disk.selected(), Some(0));
    assert!(amiga.bus.df[0].motor());
}

#[test]
fn test_interrupt_routing() {
    let mut amiga = powered_amiga();

    // Enable the master bit and the vertical-blank source
    poke16(&mut amiga, 0xDFF09A, 0xC020);
    amiga.run_for(3);

    // Request the vertical-blank interrupt
    poke16(&mut amiga, 0xDFF09C, 0x8020);
    amiga.run_for(3);
    assert_ne!(amiga.bus.paula.irq.intreq & 0x0020, 0);

    // The priority level reaches the CPU four DMA cycles later
    amiga.run_for(5);
    assert_eq!(amiga.cpu.get_ipl(), 3);
}

#[test]
fn test_interrupt_request_set_semantics_per_call() {
    let mut amiga = powered_amiga();

    // Two set-writes in succession accumulate only the bits of each call
    poke16(&mut amiga, 0xDFF09C, 0x8003);
    amiga.run_for(3);
    poke16(&mut amiga, 0xDFF09C, 0x8014);
    amiga.run_for(3);

    assert_eq!(amiga.bus.paula.irq.intreq, 0x0017);
}

#[test]
fn test_disk_sync() {
    let mut amiga = powered_amiga();

    // A track holding the sync mark at offsets 100..103
    let mut disk = FloppyDisk::blank(Diameter::Inch35, Density::Dd);
    let mut track = vec![0u8; 200];
    track[100] = 0x44;
    track[101] = 0x89;
    track[102] = 0x55;
    track[103] = 0xAA;
    disk.fill_track(0, 0, &track);
    amiga.bus.insert_disk(0, disk, 0).unwrap();

    spin_up_drive0(&mut amiga);

    // WORDSYNC on, sync word 0x4489
    poke16(&mut amiga, 0xDFF09E, 0x8000 | 1 << 10);
    amiga.run_for(3);
    poke16(&mut amiga, 0xDFF07E, 0x4489);

    // Arm a read: the controller waits for the sync mark
    poke16(&mut amiga, 0xDFF024, 0x9000);
    poke16(&mut amiga, 0xDFF024, 0x9000);
    assert_eq!(amiga.bus.paula.disk.state(), DriveDmaState::Wait);

    // Rotate through the track; stop as soon as the sync interrupt shows
    let mut synced = false;
    for _ in 0..110 * 60 {
        amiga.run_for(1);
        if amiga.bus.paula.irq.intreq & (1 << 12) != 0 {
            synced = true;
            break;
        }
    }

    assert!(synced, "sync interrupt never raised");
    assert_eq!(amiga.bus.paula.disk.state(), DriveDmaState::Read);
    assert_eq!(amiga.bus.paula.disk.fifo_count(), 0);

    // The byte that completed the match was the one at offset 101
    assert_eq!(amiga.bus.df[0].head.offset, 102);
}

#[test]
fn test_bank_overlay() {
    let mut amiga = powered_amiga();

    // After a hard reset the overlay mirrors the ROM into page zero
    let low = (peek16(&mut amiga, 0x000000) as u32) << 16
        | peek16(&mut amiga, 0x000002) as u32;
    let rom = (peek16(&mut amiga, 0xF80000) as u32) << 16
        | peek16(&mut amiga, 0xF80002) as u32;
    assert_eq!(low, rom);

    // The boot code drives the overlay pin through port A bit 0
    poke8(&mut amiga, 0xBFE201, 0x01); // DDRA: bit 0 output
    poke8(&mut amiga, 0xBFE001, 0x00); // overlay off

    // Zero-filled RAM appears
    assert_eq!(peek16(&mut amiga, 0x000000), 0x0000);
    assert_eq!(peek16(&mut amiga, 0x000002), 0x0000);

    // And it is writable
    poke16(&mut amiga, 0x000000, 0x1234);
    assert_eq!(peek16(&mut amiga, 0x000000), 0x1234);
}

#[test]
fn test_scheduler_ordering() {
    let mut amiga = powered_amiga();

    // Two events in different slots at the same cycle fire in slot order
    let cycle = amiga.bus.agnus.clock + dma_cycles(50);
    amiga
        .bus
        .agnus
        .scheduler
        .schedule_abs(Slot::Blt, cycle, EventId::BltRequest);
    amiga
        .bus
        .agnus
        .scheduler
        .schedule_abs(Slot::Cop, cycle, EventId::CopRequest);

    amiga.run_for(51);

    assert!(amiga.bus.cop_stamp != 0 && amiga.bus.blt_stamp != 0);
    assert!(
        amiga.bus.cop_stamp < amiga.bus.blt_stamp,
        "the earlier-declared slot must fire first"
    );
}

#[test]
fn test_turbo_disk() {
    let mut amiga = powered_amiga();
    amiga.set_option(ConfigOption::DriveSpeed, -1).unwrap();

    // Track data: word i holds the value i
    let mut disk = FloppyDisk::blank(Diameter::Inch35, Density::Dd);
    let mut track = Vec::new();
    for word in 0u16..1024 {
        track.extend_from_slice(&word.to_be_bytes());
    }
    disk.fill_track(0, 0, &track);
    amiga.bus.insert_disk(0, disk, 0).unwrap();

    spin_up_drive0(&mut amiga);

    // Point disk DMA at chip RAM and arm a 512-word read
    poke16(&mut amiga, 0xDFF020, 0x0001); // DSKPTH
    poke16(&mut amiga, 0xDFF022, 0x0000); // DSKPTL
    poke16(&mut amiga, 0xDFF024, 0x8200);
    poke16(&mut amiga, 0xDFF024, 0x8200);

    // The transfer completed synchronously on the arming write
    assert_eq!(amiga.bus.paula.disk.state(), DriveDmaState::Off);
    for i in [0u32, 1, 2, 255, 511] {
        assert_eq!(
            amiga.bus.mem.chip_read16(0x10000 + 2 * i),
            i as u16,
            "word {}",
            i
        );
    }

    // The block interrupt trails by 512 DMA cycles
    assert_eq!(amiga.bus.paula.irq.intreq & (1 << IrqSource::Dskblk as u16), 0);
    amiga.run_for(513);
    assert_ne!(amiga.bus.paula.irq.intreq & (1 << IrqSource::Dskblk as u16), 0);
}

#[test]
fn test_timer_one_shot() {
    let mut amiga = powered_amiga();

    // Timer A of chip A: latch 1000, one-shot, started by the control write
    poke8(&mut amiga, 0xBFE401, 0xE8); // TA low
    poke8(&mut amiga, 0xBFE501, 0x03); // TA high
    poke8(&mut amiga, 0xBFEE01, 0x09); // start + one-shot

    // 1000 chip cycles, plus pipeline slack
    amiga.run_for(1010 * 5);

    // The counter reloaded, the run bit cleared itself, and the
    // interrupt-control register latched the underflow
    let lo = peek8(&mut amiga, 0xBFE401) as u16;
    let hi = peek8(&mut amiga, 0xBFE501) as u16;
    assert_eq!(lo | (hi << 8), 1000);
    assert_eq!(peek8(&mut amiga, 0xBFEE01) & 0x01, 0);
    assert_ne!(amiga.bus.ciaa.spypeek(0xD) & 0x01, 0);
}

#[test]
fn test_timer_decrement_rate() {
    let mut amiga = powered_amiga();

    // A continuously running timer loses one count per chip cycle
    poke8(&mut amiga, 0xBFE401, 0xFF);
    poke8(&mut amiga, 0xBFE501, 0xFF);
    poke8(&mut amiga, 0xBFEE01, 0x01); // start, continuous

    let read_counter = |amiga: &mut Amiga| {
        let lo = peek8(amiga, 0xBFE401) as u16;
        let hi = peek8(amiga, 0xBFE501) as u16;
        lo | (hi << 8)
    };

    // Let the counting pipeline reach its steady state
    amiga.run_for(50);

    let start = read_counter(&mut amiga);
    let clock_before = amiga.bus.agnus.clock;
    amiga.run_for(100 * 5);
    let end = read_counter(&mut amiga);
    let elapsed_chip_cycles = (amiga.bus.agnus.clock - clock_before) / 40;

    let counted = (start - end) as i64;
    assert!(
        (counted - elapsed_chip_cycles).abs() <= 2,
        "counted {} in {} chip cycles",
        counted,
        elapsed_chip_cycles
    );
}

#[test]
fn test_paddle_counter_scan() {
    let mut amiga = powered_amiga();
    amiga.bus.paula.pot.targets = [0x34, 0x56, 0, 0];

    poke16(&mut amiga, 0xDFF034, 0x0001);

    // Eight discharge lines, then one charge step per line
    amiga.run_for((8 + 0x56 + 2) * HPOS_CNT);
    assert_eq!(peek16(&mut amiga, 0xDFF012), 0x5634);
}

#[test]
fn test_snapshot_roundtrip_preserves_pending_events() {
    let mut amiga = powered_amiga();

    poke16(&mut amiga, 0xDFF09A, 0xC008);
    amiga.run_for(100);
    amiga
        .bus
        .agnus
        .scheduler
        .schedule_abs(Slot::Cop, amiga.bus.agnus.clock + dma_cycles(777), EventId::CopRequest);

    let image = amiga.save_snapshot();

    let mut restored = powered_amiga();
    restored.load_snapshot(&image).unwrap();

    assert_eq!(restored.bus.agnus.clock, amiga.bus.agnus.clock);
    assert_eq!(restored.bus.paula.irq.intena, 0x4008);
    assert_eq!(
        restored.bus.agnus.scheduler.trigger[Slot::Cop as usize],
        amiga.bus.agnus.scheduler.trigger[Slot::Cop as usize]
    );

    // Both cores evolve identically
    amiga.run_for(1000);
    restored.run_for(1000);
    assert_eq!(restored.bus.agnus.clock, amiga.bus.agnus.clock);
    assert_eq!(restored.cpu.get_ipl(), amiga.cpu.get_ipl());
}

#[test]
fn test_drive_step_boundaries() {
    let mut amiga = powered_amiga();
    spin_up_drive0(&mut amiga);

    // Step pulses through the port: direction inwards first
    let base = !0b0000_1000u8 & !0x80; // selected, motor on
    for _ in 0..90 {
        poke8(&mut amiga, 0xBFD100, base & !0x03); // step low, dir inwards
        poke8(&mut amiga, 0xBFD100, (base & !0x02) | 0x01); // step edge
    }
    // Stepping past the last cylinder is a no-op
    assert_eq!(amiga.bus.df[0].head.cylinder, 83);

    // Then outwards, past cylinder zero
    for _ in 0..90 {
        poke8(&mut amiga, 0xBFD100, (base | 0x02) & !0x01);
        poke8(&mut amiga, 0xBFD100, base | 0x03);
    }
    assert_eq!(amiga.bus.df[0].head.cylinder, 0);
}
