//! Core configuration
//!
//! A flat set of enumerated options, applied through `Amiga::set_option`.
//! Options that change the memory layout are only legal while the core is
//! powered off; violations yield `CoreError::OptionLocked`.

use crate::error::CoreError;

/// Memory-layout variants of the supported board revisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BankMap {
    /// Kickstart at 0xF80000, no extra mirrors
    #[default]
    A500,
    /// Boot ROM with write-once RAM at 0xF80000, RTC at 0xD8xxxx
    A1000,
    /// Like the A1000 mapping but with a regular ROM
    A2000A,
    /// Like the A500 mapping with the RTC at 0xDCxxxx
    A2000B,
}

/// Value returned when an unmapped address is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmappedValue {
    /// The last value seen on the data bus
    #[default]
    Floating,
    /// 0xFFFF
    AllOnes,
    /// 0x0000
    AllZeroes,
}

/// Pattern used to fill RAM on a hard reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RamInitPattern {
    #[default]
    AllZeroes,
    AllOnes,
    Random,
}

/// Supported CPU revisions (affects instruction timing only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuRevision {
    #[default]
    M68000,
    M68010,
    M68EC020,
}

/// Supported timer-chip revisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CiaRevision {
    /// DIP package, pins readable on output bits
    #[default]
    Mos8520Dip,
    /// PLCC package, output bits read back from the data register
    Mos8520Plcc,
}

/// Mechanical timing profile of a floppy drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriveMechanics {
    /// All delays are zero
    None,
    /// Timing of the common OEM mechanism
    #[default]
    A1010,
}

/// Audio sampling method (stored for the host layer; mixing is external)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingMethod {
    #[default]
    None,
    Nearest,
    Linear,
}

/// Wire protocol spoken by a remote-observer server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerProtocol {
    /// Raw bytes, line buffered
    #[default]
    Terminal,
    /// GDB remote serial protocol
    GdbStub,
}

/// All run-time configurable options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOption {
    ChipRam,
    SlowRam,
    FastRam,
    BankMap,
    UnmappingType,
    RamInitPattern,
    SaveRoms,
    CpuRevision,
    CpuOverclocking,
    CiaRevision,
    EClockSyncing,
    TodBug,
    DriveSpeed,
    AutoDskSync,
    LockDskSync,
    DriveConnect(usize),
    DriveMechanics(usize),
    DriveSwapDelay(usize),
    AudSamplingMethod,
    SrvPort,
    SrvProtocol,
    SrvAutoRun,
    SrvVerbose,
}

/// Configuration record passed at construction and mutated through options
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Chip RAM size in KiB (256, 512, 1024, or 2048)
    pub chip_ram: usize,
    /// Slow RAM size in KiB (0 to 1792 in 256 KiB steps)
    pub slow_ram: usize,
    /// Fast RAM size in KiB (0 to 8192 in 64 KiB steps)
    pub fast_ram: usize,
    pub bank_map: BankMap,
    pub unmapping_type: UnmappedValue,
    pub ram_init_pattern: RamInitPattern,
    /// Include ROM contents in snapshots
    pub save_roms: bool,
    pub cpu_revision: CpuRevision,
    /// 1 = off, N = N micro-cycles per DMA cycle for CPU-internal work
    pub cpu_overclocking: usize,
    pub cia_revision: CiaRevision,
    /// Align timer-chip accesses to the E-clock phase
    pub eclock_syncing: bool,
    /// Emulate the time-of-day counter erratum
    pub tod_bug: bool,
    /// Words transferred per disk DMA slot; -1 selects turbo mode
    pub drive_speed: i32,
    pub auto_dsksync: bool,
    pub lock_dsksync: bool,
    pub drive_connected: [bool; 4],
    pub drive_mechanics: [DriveMechanics; 4],
    /// Delay between eject and insert when swapping disks, in master cycles
    pub drive_swap_delay: [i64; 4],
    pub sampling_method: SamplingMethod,
    pub srv_port: u16,
    pub srv_protocol: ServerProtocol,
    pub srv_auto_run: bool,
    pub srv_verbose: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            chip_ram: 512,
            slow_ram: 512,
            fast_ram: 0,
            bank_map: BankMap::A500,
            unmapping_type: UnmappedValue::Floating,
            ram_init_pattern: RamInitPattern::AllZeroes,
            save_roms: false,
            cpu_revision: CpuRevision::M68000,
            cpu_overclocking: 1,
            cia_revision: CiaRevision::Mos8520Dip,
            eclock_syncing: true,
            tod_bug: true,
            drive_speed: 1,
            auto_dsksync: false,
            lock_dsksync: false,
            drive_connected: [true, false, false, false],
            drive_mechanics: [DriveMechanics::A1010; 4],
            drive_swap_delay: [crate::scheduler::SEC / 2; 4],
            sampling_method: SamplingMethod::None,
            srv_port: 8080,
            srv_protocol: ServerProtocol::Terminal,
            srv_auto_run: false,
            srv_verbose: false,
        }
    }
}

impl CoreConfig {
    /// Validate a RAM size option before applying it
    pub fn check_ram_size(option: ConfigOption, kib: usize) -> Result<(), CoreError> {
        let valid = match option {
            ConfigOption::ChipRam => matches!(kib, 256 | 512 | 1024 | 2048),
            ConfigOption::SlowRam => kib <= 1792 && kib % 256 == 0,
            ConfigOption::FastRam => kib <= 8192 && kib % 64 == 0,
            _ => return Err(CoreError::UnsupportedOption),
        };
        if valid {
            Ok(())
        } else {
            Err(CoreError::InvalidOptionValue(Some(format!("{} KiB", kib))))
        }
    }

    /// Validate the drive speed factor
    pub fn check_drive_speed(speed: i32) -> Result<(), CoreError> {
        match speed {
            -1 | 1 | 2 | 4 | 8 => Ok(()),
            _ => Err(CoreError::InvalidOptionValue(Some("-1, 1, 2, 4, 8".into()))),
        }
    }

    /// True if the option may only change while powered off
    pub fn requires_power_off(option: ConfigOption) -> bool {
        matches!(
            option,
            ConfigOption::ChipRam
                | ConfigOption::SlowRam
                | ConfigOption::FastRam
                | ConfigOption::BankMap
        )
    }
}
