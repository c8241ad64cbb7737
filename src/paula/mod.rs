//! Audio/Disk/Interrupt unit
//!
//! Owns the 16-bit interrupt request and enable registers and the six-level
//! priority encoder, the ADKCON control register, the four audio-channel
//! state machines, the disk controller, the UART and the analog-input
//! (potentiometer) counters.
//!
//! Sixteen interrupt sources map onto six CPU priority levels in fixed
//! groups. Both interrupt registers use the set/clear write convention:
//! bit 15 of the written value selects the direction, the low bits select
//! the affected sources.

pub mod audio;
pub mod disk;
pub mod uart;

use crate::agnus::Agnus;
use crate::error::CoreError;
use crate::scheduler::{dma_cycles, Cycle, EventId, Slot, NEVER};
use audio::AudioChannel;
use disk::DiskController;
use log::trace;
use uart::Uart;

/// Interrupt sources, by bit position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IrqSource {
    /// Serial transmit buffer empty
    Tbe = 0,
    /// Disk block finished
    Dskblk = 1,
    /// Software interrupt
    Soft = 2,
    /// Timer chip A / parallel ports
    Ports = 3,
    /// Copper
    Coper = 4,
    /// Vertical blank
    Vertb = 5,
    /// Blitter finished
    Blit = 6,
    /// Audio channels
    Aud0 = 7,
    Aud1 = 8,
    Aud2 = 9,
    Aud3 = 10,
    /// Serial receive buffer full
    Rbf = 11,
    /// Disk sync word recognized
    Dsksyn = 12,
    /// Timer chip B / external
    Exter = 13,
}

/// The interrupt source of audio channel `n`
pub fn aud_irq(channel: usize) -> IrqSource {
    match channel {
        0 => IrqSource::Aud0,
        1 => IrqSource::Aud1,
        2 => IrqSource::Aud2,
        _ => IrqSource::Aud3,
    }
}

/// State of the interrupt pins of the two timer chips (false = asserted)
#[derive(Debug, Clone, Copy)]
pub struct CiaPins {
    pub a: bool,
    pub b: bool,
}

impl CiaPins {
    pub fn released() -> Self {
        Self { a: true, b: true }
    }
}

/// Interrupt latch, enable mask and the deferred-request table
#[derive(Debug, Clone)]
pub struct IrqController {
    /// Request latch (INTREQ)
    pub intreq: u16,
    /// Enable mask (INTENA); bit 14 is the global enable
    pub intena: u16,

    /// Deferred set/clear triggers per source
    set_intreq: [Cycle; 16],
    clr_intreq: [Cycle; 16],
}

impl IrqController {
    pub fn new() -> Self {
        Self {
            intreq: 0,
            intena: 0,
            set_intreq: [NEVER; 16],
            clr_intreq: [NEVER; 16],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// INTREQR: the latch with the inverted timer-chip pins blended in
    pub fn peek_intreqr(&self, pins: CiaPins) -> u16 {
        let mut result = self.intreq;
        if !pins.a {
            result |= 1 << IrqSource::Ports as u16;
        }
        if !pins.b {
            result |= 1 << IrqSource::Exter as u16;
        }
        result
    }

    pub fn peek_intenar(&self) -> u16 {
        self.intena
    }

    /// Apply an INTREQ write (set/clear convention)
    pub fn set_intreq(&mut self, value: u16, agnus: &mut Agnus, pins: CiaPins) {
        if value & 0x8000 != 0 {
            self.intreq |= value & 0x7FFF;
        } else {
            self.intreq &= !value;
        }
        self.check_interrupt(agnus, pins);
    }

    /// Apply an INTENA write (set/clear convention)
    pub fn set_intena(&mut self, value: u16, agnus: &mut Agnus, pins: CiaPins) {
        if value & 0x8000 != 0 {
            self.intena |= value & 0x7FFF;
        } else {
            self.intena &= !value;
        }
        self.check_interrupt(agnus, pins);
    }

    /// Raise an interrupt now
    pub fn raise_irq(&mut self, src: IrqSource, agnus: &mut Agnus, pins: CiaPins) {
        self.set_intreq(0x8000 | 1 << src as u16, agnus, pins);
    }

    /// Raise an interrupt after a delay, through the deferred-request table
    pub fn schedule_irq_rel(
        &mut self,
        src: IrqSource,
        delay: Cycle,
        agnus: &mut Agnus,
        pins: CiaPins,
    ) {
        if delay == 0 {
            self.raise_irq(src, agnus, pins);
            return;
        }

        let trigger = agnus.clock + delay;
        self.set_intreq_deferred(src, trigger);

        if trigger < agnus.scheduler.trigger[Slot::Irq as usize] {
            agnus.scheduler.schedule_abs(Slot::Irq, trigger, EventId::IrqCheck);
        }
    }

    fn set_intreq_deferred(&mut self, src: IrqSource, trigger: Cycle) {
        // Keep the earliest pending trigger per source
        let entry = &mut self.set_intreq[src as usize];
        if trigger < *entry {
            *entry = trigger;
        }
    }

    /// The raw setter of the request latch.
    ///
    /// A trigger cycle of zero takes effect immediately. The deferred path
    /// of this entry point is unspecified behavior; callers wanting a
    /// delayed interrupt use `schedule_irq_rel`.
    pub fn schedule_irq(
        &mut self,
        src: IrqSource,
        trigger: Cycle,
        set: bool,
        agnus: &mut Agnus,
        pins: CiaPins,
    ) -> Result<(), CoreError> {
        if trigger == 0 {
            let dir = if set { 0x8000 } else { 0 };
            self.set_intreq(dir | 1 << src as u16, agnus, pins);
            return Ok(());
        }

        Err(CoreError::NotImplemented("deferred irq scheduling"))
    }

    /// Service the `Irq` slot: apply every deferred request whose trigger
    /// has been reached and re-arm the slot
    pub fn service_irq_event(&mut self, agnus: &mut Agnus, pins: CiaPins) {
        let clock = agnus.clock;
        let mut next = NEVER;

        for src in 0..16 {
            if clock >= self.set_intreq[src] {
                self.intreq |= 1 << src;
                self.set_intreq[src] = NEVER;
            } else {
                next = next.min(self.set_intreq[src]);
            }

            if clock >= self.clr_intreq[src] {
                self.intreq &= !(1 << src);
                self.clr_intreq[src] = NEVER;
            } else {
                next = next.min(self.clr_intreq[src]);
            }
        }

        self.check_interrupt(agnus, pins);

        if next != NEVER {
            agnus.scheduler.schedule_abs(Slot::Irq, next, EventId::IrqCheck);
        } else {
            agnus.scheduler.cancel(Slot::Irq);
        }
    }

    /// The interrupt priority level encoder
    pub fn interrupt_level(&self, pins: CiaPins) -> u8 {
        if self.intena & 0x4000 == 0 {
            return 0;
        }

        let mask = self.peek_intreqr(pins) & self.intena;

        if mask & 0b0110_0000_0000_0000 != 0 {
            return 6;
        }
        if mask & 0b0001_1000_0000_0000 != 0 {
            return 5;
        }
        if mask & 0b0000_0111_1000_0000 != 0 {
            return 4;
        }
        if mask & 0b0000_0000_0111_0000 != 0 {
            return 3;
        }
        if mask & 0b0000_0000_0000_1000 != 0 {
            return 2;
        }
        if mask & 0b0000_0000_0000_0111 != 0 {
            return 1;
        }
        0
    }

    /// Schedule the delayed propagation of the priority level to the CPU
    pub fn check_interrupt(&mut self, agnus: &mut Agnus, pins: CiaPins) {
        let level = self.interrupt_level(pins);
        agnus.schedule_rel_data(Slot::Ipl, dma_cycles(4), EventId::IplChange, level as i64);
    }

    //
    // Snapshot access
    //

    pub const SNAPSHOT_SIZE: usize = 4 + 32 * 8;

    pub fn save_state(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.intreq.to_le_bytes());
        buf.extend_from_slice(&self.intena.to_le_bytes());
        for trigger in self.set_intreq.iter().chain(self.clr_intreq.iter()) {
            buf.extend_from_slice(&trigger.to_le_bytes());
        }
    }

    pub fn load_state(&mut self, buf: &[u8]) -> Result<usize, CoreError> {
        if buf.len() < Self::SNAPSHOT_SIZE {
            return Err(CoreError::SnapshotCorrupted);
        }
        self.intreq = u16::from_le_bytes([buf[0], buf[1]]);
        self.intena = u16::from_le_bytes([buf[2], buf[3]]);
        let mut pos = 4;
        for i in 0..16 {
            self.set_intreq[i] = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
        }
        for i in 0..16 {
            self.clr_intreq[i] = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
        }
        Ok(pos)
    }
}

impl Default for IrqController {
    fn default() -> Self {
        Self::new()
    }
}

/// Potentiometer counters
///
/// Writing POTGO clears all four counters. If the START bit is set, the
/// capacitors discharge over eight rasterlines, then each counter charges
/// one step per line until it reaches the value supplied by its port.
#[derive(Debug, Clone)]
pub struct PotCounters {
    pub potgo: u16,
    counters: [u8; 4],
    /// Port-supplied target values (x0, y0, x1, y1)
    pub targets: [u8; 4],
}

impl PotCounters {
    pub fn new() -> Self {
        Self {
            potgo: 0,
            counters: [0; 4],
            targets: [128; 4],
        }
    }

    pub fn reset(&mut self) {
        self.potgo = 0;
        self.counters = [0; 4];
    }

    /// POTxDAT: counter pair, or the data bits for output-configured lines
    pub fn peek_potdat(&self, pair: usize) -> u16 {
        let (outy, daty, outx, datx) = if pair == 1 {
            (15, 14, 13, 12)
        } else {
            (11, 10, 9, 8)
        };

        let pot_y = if self.potgo & (1 << outy) != 0 {
            if self.potgo & (1 << daty) != 0 {
                0xFF
            } else {
                0x00
            }
        } else {
            self.counters[pair * 2 + 1]
        };

        let pot_x = if self.potgo & (1 << outx) != 0 {
            if self.potgo & (1 << datx) != 0 {
                0xFF
            } else {
                0x00
            }
        } else {
            self.counters[pair * 2]
        };

        ((pot_y as u16) << 8) | pot_x as u16
    }

    /// POTGOR: current pin levels
    pub fn peek_potgor(&self) -> u16 {
        let mut result = 0u16;

        for (bit_out, bit_dat, counter) in
            [(9, 8, 0usize), (11, 10, 1), (13, 12, 2), (15, 14, 3)]
        {
            let level = if self.potgo & (1 << bit_out) != 0 {
                self.potgo & (1 << bit_dat) != 0
            } else {
                // The capacitor level crosses the threshold at 0x80
                self.counters[counter] >= 0x80
            };
            if level {
                result |= 1 << bit_dat;
            }
        }
        result
    }

    /// Write POTGO: clear the counters, optionally start a scan
    pub fn poke_potgo(&mut self, value: u16, agnus: &mut Agnus) {
        trace!("POTGO = {:04X}", value);
        self.potgo = value;
        self.counters = [0; 4];

        if value & 1 != 0 {
            // Eight discharge steps at end-of-line rate
            agnus.schedule_rel_data(
                Slot::Pot,
                dma_cycles(crate::agnus::HPOS_CNT),
                EventId::PotDischarge,
                8,
            );
        }
    }

    /// Service a pot event
    pub fn service_pot_event(&mut self, id: EventId, agnus: &mut Agnus) {
        match id {
            EventId::PotDischarge => {
                let remaining = agnus.scheduler.data[Slot::Pot as usize] - 1;
                agnus.scheduler.data[Slot::Pot as usize] = remaining;

                if remaining > 0 {
                    for counter in self.counters.iter_mut() {
                        *counter = counter.wrapping_add(1);
                    }
                    agnus.schedule_rel_data(
                        Slot::Pot,
                        dma_cycles(crate::agnus::HPOS_CNT),
                        EventId::PotDischarge,
                        remaining,
                    );
                } else {
                    self.counters = [0; 4];
                    agnus.schedule_rel(
                        Slot::Pot,
                        dma_cycles(crate::agnus::HPOS_CNT),
                        EventId::PotCharge,
                    );
                }
            }
            EventId::PotCharge => {
                // Step every counter towards its target
                let mut cont = false;
                for (counter, target) in self.counters.iter_mut().zip(self.targets) {
                    if *counter < target {
                        *counter += 1;
                        cont = true;
                    }
                }
                if cont {
                    agnus.schedule_rel(
                        Slot::Pot,
                        dma_cycles(crate::agnus::HPOS_CNT),
                        EventId::PotCharge,
                    );
                } else {
                    agnus.scheduler.cancel(Slot::Pot);
                }
            }
            _ => {}
        }
    }

    pub const SNAPSHOT_SIZE: usize = 2 + 4 + 4;

    pub fn save_state(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.potgo.to_le_bytes());
        buf.extend_from_slice(&self.counters);
        buf.extend_from_slice(&self.targets);
    }

    pub fn load_state(&mut self, buf: &[u8]) -> Result<usize, CoreError> {
        if buf.len() < Self::SNAPSHOT_SIZE {
            return Err(CoreError::SnapshotCorrupted);
        }
        self.potgo = u16::from_le_bytes([buf[0], buf[1]]);
        self.counters.copy_from_slice(&buf[2..6]);
        self.targets.copy_from_slice(&buf[6..10]);
        Ok(Self::SNAPSHOT_SIZE)
    }
}

impl Default for PotCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// The complete unit
#[derive(Debug)]
pub struct Paula {
    pub irq: IrqController,
    /// Audio/disk control register (set/clear convention)
    pub adkcon: u16,
    pub pot: PotCounters,
    pub audio: [AudioChannel; 4],
    pub disk: DiskController,
    pub uart: Uart,
}

impl Paula {
    pub fn new() -> Self {
        Self {
            irq: IrqController::new(),
            adkcon: 0,
            pot: PotCounters::new(),
            audio: [
                AudioChannel::new(0),
                AudioChannel::new(1),
                AudioChannel::new(2),
                AudioChannel::new(3),
            ],
            disk: DiskController::new(),
            uart: Uart::new(),
        }
    }

    pub fn reset(&mut self) {
        self.irq.reset();
        self.adkcon = 0;
        self.pot.reset();
        for channel in self.audio.iter_mut() {
            channel.reset();
        }
        self.disk.reset();
        self.uart.reset();
    }

    /// Apply an ADKCON write (set/clear convention)
    pub fn set_adkcon(&mut self, value: u16) {
        if value & 0x8000 != 0 {
            self.adkcon |= value & 0x7FFF;
        } else {
            self.adkcon &= !value;
        }
    }

    pub fn peek_adkconr(&self) -> u16 {
        self.adkcon
    }

    /// WORDSYNC bit: gate the disk controller on the sync word
    pub fn wordsync(&self) -> bool {
        self.adkcon & (1 << 10) != 0
    }

    /// UARTBRK bit: force the TXD line low
    pub fn uartbrk(&self) -> bool {
        self.adkcon & (1 << 11) != 0
    }
}

impl Default for Paula {
    fn default() -> Self {
        Self::new()
    }
}
