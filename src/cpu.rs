//! CPU bus adapter
//!
//! The instruction decoder is an external collaborator; this module owns
//! everything the core needs around it: the CPU-side clock, the
//! overclocking debt counter, the interrupt-priority-level latch, the reset
//! vectors and the debugger flags. Memory accesses themselves are paced by
//! the bus (`Bus::cpu_read*`), which advances the DMA engine to the next
//! bus-free cycle before chip-bus accesses.
//!
//! Overclocking runs N micro-cycles per DMA cycle and accumulates the
//! difference in a debt counter. When a hard synchronization point is
//! reached, the debt is flushed by advancing the master clock one DMA cycle
//! and servicing the DMA engine once.

use crate::config::CpuRevision;
use crate::scheduler::Cycle;
use bitflags::bitflags;
use log::debug;

bitflags! {
    /// Reasons the emulator loop stops between instructions. These are
    /// control-flow signals, not errors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugFlags: u8 {
        const BREAKPOINT = 1 << 0;
        const WATCHPOINT = 1 << 1;
        const CATCHPOINT = 1 << 2;
        const SWTRAP     = 1 << 3;
        const SOFTSTOP   = 1 << 4;
        const HALTED     = 1 << 5;
    }
}

/// Guard points observed between instructions
#[derive(Debug, Clone, Default)]
pub struct Debugger {
    pub breakpoints: Vec<u32>,
    pub watchpoints: Vec<u32>,
    /// Exception vectors to catch
    pub catchpoints: Vec<u8>,
}

impl Debugger {
    pub fn check_breakpoint(&self, pc: u32) -> bool {
        self.breakpoints.contains(&pc)
    }

    pub fn check_watchpoint(&self, addr: u32) -> bool {
        self.watchpoints.contains(&addr)
    }

    pub fn check_catchpoint(&self, vector: u8) -> bool {
        self.catchpoints.contains(&vector)
    }
}

/// CPU-side adapter state
#[derive(Debug, Clone)]
pub struct Cpu {
    /// CPU clock in master cycles
    pub clock: Cycle,

    /// Current interrupt priority level presented to the core
    ipl: u8,

    pub revision: CpuRevision,

    /// 1 = off, N = N-fold speed for CPU-internal work
    pub overclocking: usize,

    /// Micro-cycles owed to the DMA engine
    pub debt: i64,

    /// Cycles that must run at original speed (after a hard sync)
    pub slow_cycles: i64,

    /// Stop-request flags, checked by the external core between
    /// instructions
    pub flags: DebugFlags,

    pub debugger: Debugger,

    /// Program counter mirror (kept by the external core, cached here for
    /// the debugger surface)
    pub pc: u32,
    /// Supervisor stack pointer mirror
    pub ssp: u32,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            clock: 0,
            ipl: 0,
            revision: CpuRevision::M68000,
            overclocking: 1,
            debt: 0,
            slow_cycles: 0,
            flags: DebugFlags::empty(),
            debugger: Debugger::default(),
            pc: 0,
            ssp: 0,
        }
    }

    pub fn reset(&mut self) {
        self.clock = 0;
        self.ipl = 0;
        self.debt = 0;
        self.slow_cycles = 0;
        self.flags = DebugFlags::empty();
    }

    /// Initialize SSP and PC from the reset vectors.
    /// `vector0` and `vector1` are the long words at addresses 0 and 4.
    pub fn load_reset_vectors(&mut self, vector0: u32, vector1: u32) {
        self.ssp = vector0;
        self.pc = vector1;
        debug!("reset: ssp = {:08X}, pc = {:08X}", self.ssp, self.pc);
    }

    pub fn get_ipl(&self) -> u8 {
        self.ipl
    }

    /// Driven by the delayed `IplChange` event
    pub fn set_ipl(&mut self, level: u8) {
        self.ipl = level;
    }

    /// Number of micro-cycles per DMA cycle in overclocked mode
    pub fn micro_cycles_per_dma_cycle(&self) -> i64 {
        2 * self.overclocking as i64
    }

    /// Request that the next `n` CPU cycles run at original speed
    pub fn request_slow_cycles(&mut self, n: i64) {
        self.slow_cycles = self.slow_cycles.max(n);
    }

    pub fn halt(&mut self) {
        self.flags |= DebugFlags::HALTED;
    }

    pub fn is_halted(&self) -> bool {
        self.flags.contains(DebugFlags::HALTED)
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
