//! Event scheduler
//!
//! The core is event driven. Any action that has to happen at a specific
//! master-clock cycle (a disk byte arriving, a timer-chip step, an interrupt
//! level change) is scheduled into a named event slot and executed when the
//! trigger cycle is reached.
//!
//! Each slot holds at most one pending event. A slot is a tiny state machine
//! running in parallel with the other slots; because the machines interact
//! (e.g. by blocking the bus), the slot ordering matters: two events due at
//! the same cycle fire in slot-declaration order.
//!
//! Slots are split into three tiers. Primary slots hold frequent events and
//! are checked on every pass. Secondary slots are only walked when the
//! `Sec` wakeup slot (itself primary) fires, and tertiary slots only when
//! the `Ter` wakeup slot (itself secondary) fires. Scheduling into a deeper
//! tier automatically drags the corresponding wakeup slot forward, so the
//! mechanism is invisible to callers.

/// A point on the master timeline, measured in master-clock cycles
pub type Cycle = i64;

/// Trigger value of an empty slot
pub const NEVER: Cycle = i64::MAX;

/// Master clock frequency (PAL)
pub const MASTER_FREQUENCY: i64 = 28_375_160;

/// One second in master cycles
pub const SEC: Cycle = MASTER_FREQUENCY;

/// Convert CPU cycles to master cycles (a CPU cycle is half a DMA cycle)
pub const fn cpu_cycles(n: i64) -> Cycle {
    n * 4
}

/// Convert DMA cycles to master cycles
pub const fn dma_cycles(n: i64) -> Cycle {
    n * 8
}

/// Convert timer-chip cycles to master cycles
pub const fn cia_cycles(n: i64) -> Cycle {
    n * 40
}

/// Milliseconds in master cycles
pub const fn msec(n: i64) -> Cycle {
    n * MASTER_FREQUENCY / 1000
}

/// Microseconds in master cycles
pub const fn usec(n: i64) -> Cycle {
    n * MASTER_FREQUENCY / 1_000_000
}

/// Event slots, in service order
///
/// The discriminant order is the service order. `Sec` and `Ter` are the
/// wakeup slots enabling the next tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum Slot {
    // Primary slots
    /// Deferred chipset register changes
    Reg = 0,
    /// Timer chip A execution
    CiaA,
    /// Timer chip B execution
    CiaB,
    /// Copper bus requests
    Cop,
    /// Blitter bus requests
    Blt,
    /// Enables the secondary slots
    Sec,

    // Secondary slots
    /// Audio channel 0
    Ch0,
    /// Audio channel 1
    Ch1,
    /// Audio channel 2
    Ch2,
    /// Audio channel 3
    Ch3,
    /// Disk controller byte clock
    Dsk,
    /// Vertical blank
    Vbl,
    /// Deferred interrupt requests
    Irq,
    /// CPU interrupt priority line
    Ipl,
    /// Serial data out
    Txd,
    /// Serial data in
    Rxd,
    /// Potentiometer counters
    Pot,
    /// End of rasterline
    Eol,
    /// Enables the tertiary slots
    Ter,

    // Tertiary slots
    /// Disk change, drive 0
    Dc0,
    /// Disk change, drive 1
    Dc1,
    /// Disk change, drive 2
    Dc2,
    /// Disk change, drive 3
    Dc3,
    /// Remote server launch daemon
    Srv,
}

/// Total number of slots
pub const SLOT_COUNT: usize = Slot::Srv as usize + 1;

/// All slots in service order
pub const SLOTS: [Slot; SLOT_COUNT] = [
    Slot::Reg,
    Slot::CiaA,
    Slot::CiaB,
    Slot::Cop,
    Slot::Blt,
    Slot::Sec,
    Slot::Ch0,
    Slot::Ch1,
    Slot::Ch2,
    Slot::Ch3,
    Slot::Dsk,
    Slot::Vbl,
    Slot::Irq,
    Slot::Ipl,
    Slot::Txd,
    Slot::Rxd,
    Slot::Pot,
    Slot::Eol,
    Slot::Ter,
    Slot::Dc0,
    Slot::Dc1,
    Slot::Dc2,
    Slot::Dc3,
    Slot::Srv,
];

impl Slot {
    /// Slots up to and including `Sec` are checked on every pass
    pub fn is_primary(self) -> bool {
        self <= Slot::Sec
    }

    /// Everything behind the `Sec` wakeup slot
    pub fn is_secondary(self) -> bool {
        self > Slot::Sec
    }

    /// Everything behind the `Ter` wakeup slot
    pub fn is_tertiary(self) -> bool {
        self > Slot::Ter
    }
}

/// Event identifiers
///
/// Identifiers are only meaningful within their slot; the slot is the
/// discriminant carrier when events are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventId {
    /// Empty slot
    #[default]
    None,
    /// Apply a recorded register change
    RegChange,
    /// Execute one timer-chip cycle
    CiaExecute,
    /// Wake a sleeping timer chip
    CiaWakeup,
    /// Copper requests the bus (the DMA engine collaborator)
    CopRequest,
    /// Blitter requests the bus (the DMA engine collaborator)
    BltRequest,
    /// Wakeup call for the secondary tier
    SecTrigger,
    /// Audio channel period counter expired
    ChxPerfin,
    /// Clock one byte out of the selected drive
    DskRotate,
    /// Vertical blank strobe
    VblStrobe,
    /// Service deferred interrupt requests
    IrqCheck,
    /// Update the CPU interrupt priority line
    IplChange,
    /// Shift out one serial bit
    TxdBit,
    /// Shift in one serial bit
    RxdBit,
    /// Discharge the potentiometer capacitors
    PotDischarge,
    /// Charge step of the potentiometer counters
    PotCharge,
    /// Horizontal sync
    EolHsync,
    /// Wakeup call for the tertiary tier
    TerTrigger,
    /// Insert the pending disk
    DchInsert,
    /// Eject the current disk
    DchEject,
    /// Let the remote-server daemon reconsider its state
    SrvLaunchDaemon,
}

/// The event scheduler
///
/// Plain data: the dispatch loop walking due slots lives with the component
/// owner, which can reach every peripheral.
#[derive(Debug, Clone)]
pub struct Scheduler {
    /// Trigger cycle per slot (`NEVER` = empty)
    pub trigger: [Cycle; SLOT_COUNT],
    /// Event identifier per slot
    pub id: [EventId; SLOT_COUNT],
    /// Optional 64-bit payload per slot
    pub data: [i64; SLOT_COUNT],
    /// Cached earliest primary trigger
    pub next_trigger: Cycle,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            trigger: [NEVER; SLOT_COUNT],
            id: [EventId::None; SLOT_COUNT],
            data: [0; SLOT_COUNT],
            next_trigger: NEVER,
        }
    }

    /// Empty all slots
    pub fn reset(&mut self) {
        self.trigger = [NEVER; SLOT_COUNT];
        self.id = [EventId::None; SLOT_COUNT];
        self.data = [0; SLOT_COUNT];
        self.next_trigger = NEVER;
    }

    /// True if the slot contains any event
    pub fn has_event(&self, slot: Slot) -> bool {
        self.id[slot as usize] != EventId::None
    }

    /// True if the slot contains an event that has not fired yet
    pub fn is_pending(&self, slot: Slot) -> bool {
        self.trigger[slot as usize] != NEVER
    }

    /// True if the slot's event is due at the given cycle
    pub fn is_due(&self, slot: Slot, cycle: Cycle) -> bool {
        cycle >= self.trigger[slot as usize]
    }

    /// Set the slot to fire at an absolute cycle
    pub fn schedule_abs(&mut self, slot: Slot, cycle: Cycle, id: EventId) {
        self.trigger[slot as usize] = cycle;
        self.id[slot as usize] = id;
        self.sync_wakeup(slot, cycle);
    }

    /// Set the slot to fire at an absolute cycle, with a payload
    pub fn schedule_abs_data(&mut self, slot: Slot, cycle: Cycle, id: EventId, data: i64) {
        self.schedule_abs(slot, cycle, id);
        self.data[slot as usize] = data;
    }

    /// Set the slot to fire immediately (on the next pass)
    pub fn schedule_imm(&mut self, slot: Slot, id: EventId) {
        self.schedule_abs(slot, 0, id);
    }

    /// Set the slot to fire `delta` cycles after its current trigger
    pub fn schedule_inc(&mut self, slot: Slot, delta: Cycle, id: EventId) {
        let cycle = self.trigger[slot as usize].saturating_add(delta);
        self.schedule_abs(slot, cycle, id);
    }

    /// Change the trigger cycle without touching the event id
    pub fn reschedule_abs(&mut self, slot: Slot, cycle: Cycle) {
        self.trigger[slot as usize] = cycle;
        self.sync_wakeup(slot, cycle);
    }

    /// Move the trigger cycle relative to its current value
    pub fn reschedule_inc(&mut self, slot: Slot, delta: Cycle) {
        let cycle = self.trigger[slot as usize].saturating_add(delta);
        self.reschedule_abs(slot, cycle);
    }

    /// Empty the slot
    ///
    /// Always safe, even if the slot already fired earlier in the same
    /// `execute_until` pass; the owning component must be idempotent.
    pub fn cancel(&mut self, slot: Slot) {
        self.id[slot as usize] = EventId::None;
        self.data[slot as usize] = 0;
        self.trigger[slot as usize] = NEVER;
    }

    /// Keep the wakeup slots and the primary cache in sync with a newly
    /// scheduled trigger
    fn sync_wakeup(&mut self, slot: Slot, cycle: Cycle) {
        if cycle < self.next_trigger {
            self.next_trigger = cycle;
        }
        if slot.is_tertiary() && cycle < self.trigger[Slot::Ter as usize] {
            self.trigger[Slot::Ter as usize] = cycle;
            self.id[Slot::Ter as usize] = EventId::TerTrigger;
        }
        if slot.is_secondary() && cycle < self.trigger[Slot::Sec as usize] {
            self.trigger[Slot::Sec as usize] = cycle;
            self.id[Slot::Sec as usize] = EventId::SecTrigger;
        }
    }

    /// Earliest trigger among the primary slots
    pub fn earliest_primary(&self) -> Cycle {
        let mut next = self.trigger[0];
        for i in 1..=Slot::Sec as usize {
            if self.trigger[i] < next {
                next = self.trigger[i];
            }
        }
        next
    }

    /// Earliest trigger among the secondary slots (including `Ter`)
    pub fn earliest_secondary(&self) -> Cycle {
        let mut next = self.trigger[Slot::Sec as usize + 1];
        for i in Slot::Sec as usize + 2..=Slot::Ter as usize {
            if self.trigger[i] < next {
                next = self.trigger[i];
            }
        }
        next
    }

    /// Earliest trigger among the tertiary slots
    pub fn earliest_tertiary(&self) -> Cycle {
        let mut next = self.trigger[Slot::Ter as usize + 1];
        for i in Slot::Ter as usize + 2..SLOT_COUNT {
            if self.trigger[i] < next {
                next = self.trigger[i];
            }
        }
        next
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ========== State Persistence ==========

impl Scheduler {
    /// Size of the scheduler state in a snapshot:
    /// per slot 8 (trigger) + 1 (id) + 8 (data), plus 8 for next_trigger
    pub const SNAPSHOT_SIZE: usize = SLOT_COUNT * 17 + 8;

    /// Save scheduler state to bytes
    pub fn save_state(&self, buf: &mut Vec<u8>) {
        for i in 0..SLOT_COUNT {
            buf.extend_from_slice(&self.trigger[i].to_le_bytes());
            buf.push(self.id[i] as u8);
            buf.extend_from_slice(&self.data[i].to_le_bytes());
        }
        buf.extend_from_slice(&self.next_trigger.to_le_bytes());
    }

    /// Load scheduler state from bytes, returning the number of bytes read
    pub fn load_state(&mut self, buf: &[u8]) -> Result<usize, crate::error::CoreError> {
        use crate::error::CoreError;

        if buf.len() < Self::SNAPSHOT_SIZE {
            return Err(CoreError::SnapshotCorrupted);
        }

        let mut pos = 0;
        for i in 0..SLOT_COUNT {
            self.trigger[i] = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            self.id[i] = event_id_from_u8(buf[pos]).ok_or(CoreError::SnapshotCorrupted)?;
            pos += 1;
            self.data[i] = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
        }
        self.next_trigger = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;

        Ok(pos)
    }
}

fn event_id_from_u8(value: u8) -> Option<EventId> {
    use EventId::*;
    const TABLE: [EventId; 21] = [
        None, RegChange, CiaExecute, CiaWakeup, CopRequest, BltRequest, SecTrigger, ChxPerfin,
        DskRotate, VblStrobe, IrqCheck, IplChange, TxdBit, RxdBit, PotDischarge, PotCharge,
        EolHsync, TerTrigger, DchInsert, DchEject, SrvLaunchDaemon,
    ];
    TABLE.get(value as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_conversions() {
        // One DMA cycle is two CPU cycles
        assert_eq!(dma_cycles(1), cpu_cycles(2));
        // One chip cycle is five DMA cycles
        assert_eq!(cia_cycles(1), dma_cycles(5));
        assert_eq!(sec_to_cycles(1), MASTER_FREQUENCY);
    }

    fn sec_to_cycles(n: i64) -> Cycle {
        n * SEC
    }

    #[test]
    fn test_tier_predicates() {
        assert!(Slot::Reg.is_primary());
        assert!(Slot::Sec.is_primary());
        assert!(!Slot::Sec.is_secondary());
        assert!(Slot::Ch0.is_secondary());
        assert!(Slot::Ter.is_secondary());
        assert!(!Slot::Ter.is_tertiary());
        assert!(Slot::Dc0.is_tertiary());
        assert!(Slot::Srv.is_tertiary());
    }

    #[test]
    fn test_new_scheduler_is_empty() {
        let scheduler = Scheduler::new();
        for slot in SLOTS {
            assert!(!scheduler.has_event(slot));
            assert!(!scheduler.is_pending(slot));
        }
        assert_eq!(scheduler.next_trigger, NEVER);
    }

    #[test]
    fn test_schedule_primary() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_abs(Slot::Cop, 100, EventId::CopRequest);

        assert!(scheduler.has_event(Slot::Cop));
        assert!(scheduler.is_pending(Slot::Cop));
        assert!(!scheduler.is_due(Slot::Cop, 99));
        assert!(scheduler.is_due(Slot::Cop, 100));
        assert_eq!(scheduler.next_trigger, 100);

        // The wakeup slots remain untouched for primary events
        assert!(!scheduler.is_pending(Slot::Sec));
        assert!(!scheduler.is_pending(Slot::Ter));
    }

    #[test]
    fn test_schedule_secondary_arms_wakeup() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_abs(Slot::Dsk, 200, EventId::DskRotate);

        // The secondary wakeup must fire no later than the new trigger
        assert_eq!(scheduler.trigger[Slot::Sec as usize], 200);
        assert_eq!(scheduler.id[Slot::Sec as usize], EventId::SecTrigger);
        assert_eq!(scheduler.next_trigger, 200);
    }

    #[test]
    fn test_schedule_tertiary_arms_both_wakeups() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_abs(Slot::Dc1, 300, EventId::DchInsert);

        assert_eq!(scheduler.trigger[Slot::Ter as usize], 300);
        assert_eq!(scheduler.trigger[Slot::Sec as usize], 300);
        assert_eq!(scheduler.next_trigger, 300);
    }

    #[test]
    fn test_wakeup_keeps_earlier_trigger() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_abs(Slot::Dsk, 100, EventId::DskRotate);
        scheduler.schedule_abs(Slot::Txd, 500, EventId::TxdBit);

        // The wakeup slot stays at the earlier of the two triggers
        assert_eq!(scheduler.trigger[Slot::Sec as usize], 100);
    }

    #[test]
    fn test_schedule_inc() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_abs(Slot::CiaA, 40, EventId::CiaExecute);
        scheduler.schedule_inc(Slot::CiaA, 40, EventId::CiaExecute);
        assert_eq!(scheduler.trigger[Slot::CiaA as usize], 80);
    }

    #[test]
    fn test_reschedule_keeps_id() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_abs(Slot::Irq, 100, EventId::IrqCheck);
        scheduler.reschedule_abs(Slot::Irq, 50);

        assert_eq!(scheduler.trigger[Slot::Irq as usize], 50);
        assert_eq!(scheduler.id[Slot::Irq as usize], EventId::IrqCheck);
    }

    #[test]
    fn test_cancel_restores_pristine_state() {
        let mut scheduler = Scheduler::new();
        let pristine = scheduler.clone();

        scheduler.schedule_abs_data(Slot::Ipl, 100, EventId::IplChange, 3);
        scheduler.cancel(Slot::Ipl);

        assert_eq!(scheduler.trigger, pristine.trigger);
        assert_eq!(scheduler.id, pristine.id);
        assert_eq!(scheduler.data, pristine.data);
    }

    #[test]
    fn test_earliest_per_tier() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_abs(Slot::Reg, 70, EventId::RegChange);
        scheduler.schedule_abs(Slot::Blt, 30, EventId::BltRequest);
        scheduler.schedule_abs(Slot::Dsk, 90, EventId::DskRotate);
        scheduler.schedule_abs(Slot::Dc0, 120, EventId::DchEject);

        // Primary minimum includes the Sec wakeup dragged to 90
        assert_eq!(scheduler.earliest_primary(), 30);
        assert_eq!(scheduler.earliest_tertiary(), 120);
    }

    #[test]
    fn test_payload_travels_with_event() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_abs_data(Slot::Ipl, 64, EventId::IplChange, 6);
        assert_eq!(scheduler.data[Slot::Ipl as usize], 6);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_abs_data(Slot::Dsk, 12345, EventId::DskRotate, -7);
        scheduler.schedule_abs(Slot::CiaB, 40, EventId::CiaExecute);

        let mut buf = Vec::new();
        scheduler.save_state(&mut buf);
        assert_eq!(buf.len(), Scheduler::SNAPSHOT_SIZE);

        let mut restored = Scheduler::new();
        let read = restored.load_state(&buf).unwrap();
        assert_eq!(read, Scheduler::SNAPSHOT_SIZE);
        assert_eq!(restored.trigger, scheduler.trigger);
        assert_eq!(restored.id, scheduler.id);
        assert_eq!(restored.data, scheduler.data);
    }

    #[test]
    fn test_truncated_snapshot_fails() {
        let scheduler = Scheduler::new();
        let mut buf = Vec::new();
        scheduler.save_state(&mut buf);
        buf.truncate(buf.len() - 1);

        let mut restored = Scheduler::new();
        assert!(restored.load_state(&buf).is_err());
    }
}
