//! Emulator orchestrator
//!
//! Owns the CPU adapter and the bus and wires them together: lifecycle
//! (power on/off, hard and soft reset), configuration routing with the
//! power-state locks, the snapshot entry points, and the debug surface the
//! remote servers talk to.

use crate::bus::Bus;
use crate::config::{
    BankMap, CiaRevision, ConfigOption, CoreConfig, CpuRevision, DriveMechanics, RamInitPattern,
    SamplingMethod, ServerProtocol, UnmappedValue,
};
use crate::cpu::Cpu;
use crate::error::CoreError;
use crate::msgq::Msg;
use crate::scheduler::Cycle;
use crate::snapshot;
use crate::srv::DebugTarget;
use crate::zorro::ZorroBoard;
use log::{debug, info};

/// The emulator core
pub struct Amiga {
    pub cpu: Cpu,
    pub bus: Bus,
    config: CoreConfig,
    powered_on: bool,
    /// Emulation is advancing (cleared by breakpoints and the debugger)
    pub running: bool,
}

impl Amiga {
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(config: CoreConfig) -> Self {
        let mut amiga = Self {
            cpu: Cpu::new(),
            bus: Bus::new(),
            config,
            powered_on: false,
            running: false,
        };
        amiga.apply_config();
        amiga
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn is_powered_on(&self) -> bool {
        self.powered_on
    }

    /// Push the configuration record into the components
    fn apply_config(&mut self) {
        let config = &self.config;

        self.bus.mem.bank_map = config.bank_map;
        self.bus.mem.unmapping_type = config.unmapping_type;
        self.bus.mem.ram_init_pattern = config.ram_init_pattern;

        self.cpu.revision = config.cpu_revision;
        self.cpu.overclocking = config.cpu_overclocking;

        self.bus.ciaa.revision = config.cia_revision;
        self.bus.ciab.revision = config.cia_revision;
        self.bus.ciaa.tod.tod_bug = config.tod_bug;
        self.bus.ciab.tod.tod_bug = config.tod_bug;
        self.bus.eclock_syncing = config.eclock_syncing;

        self.bus.paula.disk.speed = config.drive_speed;
        self.bus.paula.disk.auto_dsksync = config.auto_dsksync;
        self.bus.paula.disk.lock_dsksync = config.lock_dsksync;

        for (nr, drive) in self.bus.df.iter_mut().enumerate() {
            drive.connected = config.drive_connected[nr];
            drive.mechanics = config.drive_mechanics[nr];
        }
    }

    //
    // Configuration
    //

    /// Change one option. Options affecting the memory layout are locked
    /// while the core is powered on.
    pub fn set_option(&mut self, option: ConfigOption, value: i64) -> Result<(), CoreError> {
        if CoreConfig::requires_power_off(option) && self.powered_on {
            return Err(CoreError::OptionLocked);
        }

        match option {
            ConfigOption::ChipRam => {
                CoreConfig::check_ram_size(option, value as usize)?;
                self.config.chip_ram = value as usize;
            }
            ConfigOption::SlowRam => {
                CoreConfig::check_ram_size(option, value as usize)?;
                self.config.slow_ram = value as usize;
            }
            ConfigOption::FastRam => {
                CoreConfig::check_ram_size(option, value as usize)?;
                self.config.fast_ram = value as usize;
            }
            ConfigOption::BankMap => {
                self.config.bank_map = match value {
                    0 => BankMap::A500,
                    1 => BankMap::A1000,
                    2 => BankMap::A2000A,
                    3 => BankMap::A2000B,
                    _ => return Err(CoreError::InvalidOptionValue(Some("0..3".into()))),
                };
            }
            ConfigOption::UnmappingType => {
                self.config.unmapping_type = match value {
                    0 => UnmappedValue::Floating,
                    1 => UnmappedValue::AllOnes,
                    2 => UnmappedValue::AllZeroes,
                    _ => return Err(CoreError::InvalidOptionValue(Some("0..2".into()))),
                };
            }
            ConfigOption::RamInitPattern => {
                self.config.ram_init_pattern = match value {
                    0 => RamInitPattern::AllZeroes,
                    1 => RamInitPattern::AllOnes,
                    2 => RamInitPattern::Random,
                    _ => return Err(CoreError::InvalidOptionValue(Some("0..2".into()))),
                };
            }
            ConfigOption::SaveRoms => self.config.save_roms = value != 0,
            ConfigOption::CpuRevision => {
                self.config.cpu_revision = match value {
                    0 => CpuRevision::M68000,
                    1 => CpuRevision::M68010,
                    2 => CpuRevision::M68EC020,
                    _ => return Err(CoreError::InvalidOptionValue(Some("0..2".into()))),
                };
            }
            ConfigOption::CpuOverclocking => {
                if value < 1 || value > 16 {
                    return Err(CoreError::InvalidOptionValue(Some("1..16".into())));
                }
                self.config.cpu_overclocking = value as usize;
                self.bus.msgq.put(Msg::Overclocking(value as usize));
            }
            ConfigOption::CiaRevision => {
                self.config.cia_revision = match value {
                    0 => CiaRevision::Mos8520Dip,
                    1 => CiaRevision::Mos8520Plcc,
                    _ => return Err(CoreError::InvalidOptionValue(Some("0..1".into()))),
                };
            }
            ConfigOption::EClockSyncing => self.config.eclock_syncing = value != 0,
            ConfigOption::TodBug => self.config.tod_bug = value != 0,
            ConfigOption::DriveSpeed => {
                CoreConfig::check_drive_speed(value as i32)?;
                self.config.drive_speed = value as i32;
            }
            ConfigOption::AutoDskSync => self.config.auto_dsksync = value != 0,
            ConfigOption::LockDskSync => self.config.lock_dsksync = value != 0,
            ConfigOption::DriveConnect(nr) => {
                if nr >= 4 {
                    return Err(CoreError::InvalidOptionValue(Some("drive 0..3".into())));
                }
                // The internal drive stays connected
                if nr == 0 && value == 0 {
                    return Ok(());
                }
                self.config.drive_connected[nr] = value != 0;
                self.bus.msgq.put(Msg::DriveConnect {
                    drive: nr,
                    connected: value != 0,
                });
            }
            ConfigOption::DriveMechanics(nr) => {
                if nr >= 4 {
                    return Err(CoreError::InvalidOptionValue(Some("drive 0..3".into())));
                }
                self.config.drive_mechanics[nr] = match value {
                    0 => DriveMechanics::None,
                    1 => DriveMechanics::A1010,
                    _ => return Err(CoreError::InvalidOptionValue(Some("0..1".into()))),
                };
            }
            ConfigOption::DriveSwapDelay(nr) => {
                if nr >= 4 {
                    return Err(CoreError::InvalidOptionValue(Some("drive 0..3".into())));
                }
                self.config.drive_swap_delay[nr] = value;
            }
            ConfigOption::AudSamplingMethod => {
                self.config.sampling_method = match value {
                    0 => SamplingMethod::None,
                    1 => SamplingMethod::Nearest,
                    2 => SamplingMethod::Linear,
                    _ => return Err(CoreError::InvalidOptionValue(Some("0..2".into()))),
                };
            }
            ConfigOption::SrvPort => self.config.srv_port = value as u16,
            ConfigOption::SrvProtocol => {
                self.config.srv_protocol = match value {
                    0 => ServerProtocol::Terminal,
                    1 => ServerProtocol::GdbStub,
                    _ => return Err(CoreError::InvalidOptionValue(Some("0..1".into()))),
                };
            }
            ConfigOption::SrvAutoRun => self.config.srv_auto_run = value != 0,
            ConfigOption::SrvVerbose => self.config.srv_verbose = value != 0,
        }

        self.apply_config();
        Ok(())
    }

    //
    // Media
    //

    pub fn load_rom(&mut self, buf: &[u8]) -> Result<(), CoreError> {
        self.bus.mem.load_rom(buf)?;
        self.bus.update_mem_src_tables();
        Ok(())
    }

    pub fn load_rom_encrypted(&mut self, buf: &[u8], key: &[u8]) -> Result<(), CoreError> {
        self.bus.mem.load_rom_encrypted(buf, key)?;
        self.bus.update_mem_src_tables();
        Ok(())
    }

    pub fn load_ext(&mut self, buf: &[u8], start: u8) -> Result<(), CoreError> {
        self.bus.mem.load_ext(buf, start)?;
        self.bus.update_mem_src_tables();
        Ok(())
    }

    /// Insert a disk using the configured swap delay
    pub fn insert_disk(
        &mut self,
        nr: usize,
        disk: crate::drive::FloppyDisk,
    ) -> Result<(), CoreError> {
        let delay = self.config.drive_swap_delay[nr];
        self.bus.insert_disk(nr, disk, delay)
    }

    pub fn eject_disk(&mut self, nr: usize) {
        let delay = self.config.drive_swap_delay[nr];
        self.bus.eject_disk(nr, delay);
    }

    //
    // Lifecycle
    //

    /// Check that the core can start
    pub fn is_ready(&self) -> Result<(), CoreError> {
        if !self.bus.mem.has_rom() {
            return Err(CoreError::RomMissing);
        }
        if self.config.chip_ram == 0 {
            return Err(CoreError::ChipRamMissing);
        }
        Ok(())
    }

    /// Allocate memory per the configuration and perform a hard reset
    pub fn power_on(&mut self) -> Result<(), CoreError> {
        self.is_ready()?;

        info!("powering on");
        self.bus.mem.alloc_chip(self.config.chip_ram);
        self.bus.mem.alloc_slow(self.config.slow_ram);
        self.bus.mem.alloc_fast(self.config.fast_ram);
        self.bus.zorro = ZorroBoard::new(self.config.fast_ram);

        self.powered_on = true;
        self.hard_reset();
        self.bus.msgq.put(Msg::PowerOn);
        Ok(())
    }

    pub fn power_off(&mut self) {
        if self.powered_on {
            self.powered_on = false;
            self.running = false;
            self.bus.msgq.put(Msg::PowerOff);
        }
    }

    /// Power-on state: RAM refilled, tables rebuilt, all chips reset
    pub fn hard_reset(&mut self) {
        debug!("hard reset");

        self.cpu.reset();
        self.bus.agnus.clock = 0;
        self.bus.agnus.frame = 0;
        self.bus.agnus.reset();
        self.bus.paula.reset();
        self.bus.ciaa.reset();
        self.bus.ciab.reset();
        self.bus.rtc.reset();
        self.bus.zorro.reset();
        for drive in self.bus.df.iter_mut() {
            drive.reset();
        }

        self.bus.mem.fill_ram_with_init_pattern();
        self.bus.mem.wom_locked = false;
        self.bus.update_mem_src_tables();
        self.bus.schedule_initial_events();

        self.load_reset_vectors();
    }

    /// Registers and RAM survive; pending events restart
    pub fn soft_reset(&mut self) {
        debug!("soft reset");

        self.bus.agnus.reset();
        self.bus.schedule_initial_events();
        self.load_reset_vectors();
    }

    /// SSP from vector 0, PC from vector 1 (visible through the overlay)
    fn load_reset_vectors(&mut self) {
        let ssp = self.bus.spypeek32(0x000000);
        let pc = self.bus.spypeek32(0x000004);
        self.cpu.load_reset_vectors(ssp, pc);
    }

    //
    // Execution
    //

    /// Drive the core forward by a number of DMA cycles
    pub fn run_for(&mut self, dma_cycles: Cycle) {
        let Amiga { cpu, bus, .. } = self;
        bus.execute_dma_cycles(cpu, dma_cycles);
    }

    /// Stop the emulator on an internal inconsistency. The condition is
    /// fatal for the emulated machine, not for the host: the loop stops
    /// and the embedder is notified.
    pub fn halt(&mut self) {
        self.cpu.halt();
        self.running = false;
        self.bus.msgq.put(Msg::CpuHalt);
    }

    //
    // Snapshots
    //

    pub fn save_snapshot(&self) -> Vec<u8> {
        let image = snapshot::save(&self.cpu, &self.bus, self.config.save_roms);
        self.bus.msgq.put(Msg::SnapshotTaken);
        image
    }

    pub fn load_snapshot(&mut self, buf: &[u8]) -> Result<(), CoreError> {
        snapshot::load(&mut self.cpu, &mut self.bus, buf)
    }

    //
    // Shell
    //

    /// Execute a terminal-server command
    pub fn execute_shell_command(&mut self, command: &str) -> String {
        let mut parts = command.split_whitespace();
        match parts.next() {
            Some("help") => "commands: help, version, state, run, pause, reset, peek <addr>\n"
                .to_string(),
            Some("version") => format!("{}\n", env!("CARGO_PKG_VERSION")),
            Some("state") => format!(
                "powered {} | running {} | clock {} | frame {}\n",
                if self.powered_on { "on" } else { "off" },
                self.running,
                self.bus.agnus.clock,
                self.bus.agnus.frame
            ),
            Some("run") => {
                self.running = true;
                "running\n".to_string()
            }
            Some("pause") => {
                self.running = false;
                "paused\n".to_string()
            }
            Some("reset") => {
                self.hard_reset();
                "reset\n".to_string()
            }
            Some("peek") => match parts
                .next()
                .and_then(|arg| u32::from_str_radix(arg.trim_start_matches("0x"), 16).ok())
            {
                Some(addr) => format!("{:06X}: {:04X}\n", addr, self.bus.spypeek16(addr)),
                None => "usage: peek <hexaddr>\n".to_string(),
            },
            Some(other) => format!("{}\n", CoreError::UnknownCommand(Some(other.to_string()))),
            None => String::new(),
        }
    }
}

impl Default for Amiga {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugTarget for Amiga {
    fn read_register(&mut self, nr: usize) -> u32 {
        // The data and address registers live in the external decoder;
        // the adapter mirrors the debugger-visible subset
        match nr {
            15 => self.cpu.ssp,
            17 => self.cpu.pc,
            _ => 0,
        }
    }

    fn read_memory(&mut self, addr: u32) -> u8 {
        self.bus.spypeek8(addr)
    }

    fn resume(&mut self) {
        self.running = true;
    }

    fn pause(&mut self) {
        self.running = false;
    }

    fn execute_command(&mut self, command: &str) -> String {
        self.execute_shell_command(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amiga_with_rom() -> Amiga {
        let mut amiga = Amiga::new();
        // A ROM whose reset vectors point into itself
        let mut rom = vec![0u8; 256 * 1024];
        rom[0..4].copy_from_slice(&0x0004_0000u32.to_be_bytes());
        rom[4..8].copy_from_slice(&0x00F8_0008u32.to_be_bytes());
        amiga.load_rom(&rom).unwrap();
        amiga
    }

    #[test]
    fn test_power_on_requires_rom() {
        let mut amiga = Amiga::new();
        assert_eq!(amiga.power_on(), Err(CoreError::RomMissing));

        let mut amiga = amiga_with_rom();
        assert!(amiga.power_on().is_ok());
        assert!(amiga.is_powered_on());
    }

    #[test]
    fn test_reset_vectors_via_overlay() {
        let mut amiga = amiga_with_rom();
        amiga.power_on().unwrap();

        assert_eq!(amiga.cpu.ssp, 0x0004_0000);
        assert_eq!(amiga.cpu.pc, 0x00F8_0008);
    }

    #[test]
    fn test_memory_options_locked_while_powered() {
        let mut amiga = amiga_with_rom();
        amiga.set_option(ConfigOption::ChipRam, 1024).unwrap();
        amiga.power_on().unwrap();

        assert_eq!(
            amiga.set_option(ConfigOption::ChipRam, 512),
            Err(CoreError::OptionLocked)
        );
        assert_eq!(
            amiga.set_option(ConfigOption::BankMap, 1),
            Err(CoreError::OptionLocked)
        );

        // Behavioral options stay available
        amiga.set_option(ConfigOption::DriveSpeed, 2).unwrap();
        assert_eq!(amiga.bus.paula.disk.speed, 2);
    }

    #[test]
    fn test_invalid_option_values() {
        let mut amiga = Amiga::new();
        assert!(amiga.set_option(ConfigOption::ChipRam, 313).is_err());
        assert!(amiga.set_option(ConfigOption::DriveSpeed, 3).is_err());
        assert!(amiga.set_option(ConfigOption::BankMap, 9).is_err());
        assert!(amiga.set_option(ConfigOption::CpuOverclocking, 0).is_err());
    }

    #[test]
    fn test_config_propagates_to_components() {
        let mut amiga = Amiga::new();
        amiga.set_option(ConfigOption::TodBug, 0).unwrap();
        assert!(!amiga.bus.ciaa.tod.tod_bug);

        amiga.set_option(ConfigOption::LockDskSync, 1).unwrap();
        assert!(amiga.bus.paula.disk.lock_dsksync);

        amiga.set_option(ConfigOption::CpuOverclocking, 4).unwrap();
        assert_eq!(amiga.cpu.overclocking, 4);
    }

    #[test]
    fn test_internal_drive_stays_connected() {
        let mut amiga = Amiga::new();
        amiga.set_option(ConfigOption::DriveConnect(0), 0).unwrap();
        assert!(amiga.config().drive_connected[0]);

        amiga.set_option(ConfigOption::DriveConnect(1), 1).unwrap();
        assert!(amiga.config().drive_connected[1]);
    }

    #[test]
    fn test_hard_reset_refills_ram() {
        let mut amiga = amiga_with_rom();
        amiga
            .set_option(ConfigOption::RamInitPattern, 1)
            .unwrap(); // all ones
        amiga.power_on().unwrap();

        // Overwrite a cell, then hard-reset
        amiga.bus.mem.chip_write16(0x1000, 0x0000);
        amiga.hard_reset();
        assert_eq!(amiga.bus.mem.chip_read16(0x1000), 0xFFFF);
    }

    #[test]
    fn test_soft_reset_preserves_ram() {
        let mut amiga = amiga_with_rom();
        amiga.power_on().unwrap();

        amiga.bus.mem.chip_write16(0x1000, 0x1234);
        amiga.run_for(100);
        amiga.soft_reset();
        assert_eq!(amiga.bus.mem.chip_read16(0x1000), 0x1234);

        // Events were re-initialized
        assert!(amiga
            .bus
            .agnus
            .scheduler
            .is_pending(crate::scheduler::Slot::CiaA));
    }

    #[test]
    fn test_shell_commands() {
        let mut amiga = amiga_with_rom();
        amiga.power_on().unwrap();

        assert!(amiga.execute_shell_command("version").contains('.'));
        assert!(amiga.execute_shell_command("state").contains("powered on"));

        amiga.bus.mem.chip_write16(0x2000, 0xBEEF);
        let out = amiga.execute_shell_command("peek 2000");
        assert!(out.contains("BEEF"), "{}", out);

        assert!(amiga
            .execute_shell_command("frobnicate")
            .contains("unrecognized command"));
    }

    #[test]
    fn test_halt_surfaces_through_the_queue() {
        let mut amiga = amiga_with_rom();
        amiga.power_on().unwrap();
        amiga.running = true;

        amiga.halt();
        assert!(amiga.cpu.is_halted());
        assert!(!amiga.running);

        let mut seen = false;
        while let Some(msg) = amiga.bus.msgq.get() {
            if msg == Msg::CpuHalt {
                seen = true;
            }
        }
        assert!(seen, "halt notification missing");
    }

    #[test]
    fn test_snapshot_through_the_core() {
        let mut amiga = amiga_with_rom();
        amiga.power_on().unwrap();
        amiga.bus.mem.chip_write16(0x4000, 0xABCD);
        amiga.run_for(500);

        let image = amiga.save_snapshot();

        let mut restored = amiga_with_rom();
        restored.power_on().unwrap();
        restored.load_snapshot(&image).unwrap();

        assert_eq!(restored.bus.mem.chip_read16(0x4000), 0xABCD);
        assert_eq!(restored.bus.agnus.clock, amiga.bus.agnus.clock);
    }
}
