//! UART
//!
//! The serial interface shifts bits at a programmable rate (SERPER), LSB
//! first, one start bit, eight or nine data bits and one stop bit. Outgoing
//! bytes pass through the transmit buffer into the shift register; incoming
//! edges on RXD start a sampling sequence in the middle of the first data
//! bit. Buffer hand-offs raise the TBE and RBF interrupts.
//!
//! The module does not touch the interrupt latch itself; it reports the
//! requested interrupts to the caller, which owns the latch and the UARTBRK
//! bit in ADKCON.

use crate::scheduler::{dma_cycles, Cycle};
use log::trace;

/// Interrupts and line changes produced by a UART operation
#[derive(Debug, Clone, Copy, Default)]
pub struct UartEvents {
    /// Transmit-buffer-empty interrupt, delayed by two DMA cycles
    pub tbe_irq: bool,
    /// Receive-buffer-full interrupt
    pub rbf_irq: bool,
    /// A byte left the shift register (host/GUI notification)
    pub out_byte: Option<u16>,
    /// Schedule the next transmit bit this many cycles ahead
    pub next_tx: Option<Cycle>,
    /// Schedule the next receive sample this many cycles ahead
    pub next_rx: Option<Cycle>,
}

/// Serial interface state
#[derive(Debug, Clone)]
pub struct Uart {
    /// Baud-rate register; bit 15 selects 9 data bits
    pub serper: u16,

    receive_buffer: u16,
    receive_shift_reg: u16,
    transmit_buffer: u16,
    transmit_shift_reg: u16,

    /// Overrun flag (bit 15 of SERDATR)
    ovrun: bool,

    /// Current TXD output level
    pub out_bit: bool,
    /// Current RXD input level
    pub rxd: bool,

    /// Bits received in the current frame
    rec_cnt: usize,
}

impl Uart {
    pub fn new() -> Self {
        Self {
            serper: 0,
            receive_buffer: 0,
            receive_shift_reg: 0,
            transmit_buffer: 0,
            transmit_shift_reg: 0,
            ovrun: false,
            out_bit: true,
            rxd: true,
            rec_cnt: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Master cycles per serial bit
    pub fn pulse_width(&self) -> Cycle {
        dma_cycles(((self.serper & 0x7FFF) as i64) + 1)
    }

    /// Data bits per frame
    fn data_bits(&self) -> usize {
        if self.serper & 0x8000 != 0 {
            9
        } else {
            8
        }
    }

    //
    // Registers
    //

    /// SERDATR status word
    ///
    /// 15 OVRUN, 14 RBF, 13 TBE, 12 TSRE, 11 RXD, 9..0 received frame
    pub fn spypeek_serdatr(&self, rbf_pending: bool) -> u16 {
        let mut result = self.receive_buffer & 0x3FF;
        if self.ovrun {
            result |= 1 << 15;
        }
        if rbf_pending {
            result |= 1 << 14;
        }
        if self.transmit_buffer == 0 {
            result |= 1 << 13;
        }
        if self.transmit_shift_reg == 0 {
            result |= 1 << 12;
        }
        if self.rxd {
            result |= 1 << 11;
        }
        result
    }

    /// Read SERDATR. Acknowledging RBF clears the overrun flag.
    pub fn peek_serdatr(&mut self, rbf_pending: bool) -> u16 {
        if !rbf_pending {
            self.ovrun = false;
        }
        self.spypeek_serdatr(rbf_pending)
    }

    /// The pipelined SERDAT write has arrived (via the register-change
    /// queue). Returns the transmit schedule if a transmission starts.
    pub fn set_serdat(&mut self, value: u16) -> UartEvents {
        let mut events = UartEvents::default();
        self.transmit_buffer = value;

        if self.transmit_shift_reg == 0 && self.transmit_buffer != 0 {
            events.next_tx = Some(0);
        }
        events
    }

    pub fn poke_serper(&mut self, value: u16) {
        self.serper = value;
        trace!("SERPER = {:04X}", value);
    }

    //
    // Transmission
    //

    /// Move the transmit buffer into the shift register, prefixing the
    /// start bit
    fn copy_to_transmit_shift_register(&mut self) -> UartEvents {
        let mut events = UartEvents::default();

        events.out_byte = Some(self.transmit_buffer);
        self.transmit_shift_reg = self.transmit_buffer << 1;
        self.transmit_buffer = 0;

        // The buffer is free again
        events.tbe_irq = true;
        events
    }

    /// Service one transmit-bit event
    pub fn service_txd_event(&mut self) -> UartEvents {
        let mut events = UartEvents::default();

        if self.transmit_shift_reg == 0 && self.transmit_buffer != 0 {
            events = self.copy_to_transmit_shift_register();
        }

        if self.transmit_shift_reg != 0 {
            // Shift out the next bit, LSB first
            self.out_bit = self.transmit_shift_reg & 1 != 0;
            self.transmit_shift_reg >>= 1;

            if self.transmit_shift_reg == 0 && self.transmit_buffer == 0 {
                // Frame done: the line returns to the idle (stop) level
                // after one more bit time
            }
            events.next_tx = Some(self.pulse_width());
        } else {
            // Idle: line high, nothing more to send
            self.out_bit = true;
            events.next_tx = None;
        }
        events
    }

    /// TXD level including the UARTBRK override
    pub fn txd(&self, uartbrk: bool) -> bool {
        self.out_bit && !uartbrk
    }

    //
    // Reception
    //

    /// The RXD line changed. A falling edge outside a frame is a start
    /// bit; sampling begins in the middle of the first data bit.
    pub fn rxd_has_changed(&mut self, value: bool, receiving: bool) -> UartEvents {
        let mut events = UartEvents::default();
        self.rxd = value;

        if !value && !receiving {
            self.rec_cnt = 0;
            self.receive_shift_reg = 0;
            events.next_rx = Some(self.pulse_width() * 3 / 2);
        }
        events
    }

    /// Sample one bit of the incoming frame
    pub fn service_rxd_event(&mut self, rbf_pending: bool) -> UartEvents {
        let mut events = UartEvents::default();

        if self.rxd {
            self.receive_shift_reg |= 1 << self.rec_cnt;
        }
        self.rec_cnt += 1;

        // Data bits plus the stop bit
        if self.rec_cnt > self.data_bits() {
            self.receive_buffer = self.receive_shift_reg;
            self.receive_shift_reg = 0;

            // Overrun if the previous byte was never acknowledged
            self.ovrun = rbf_pending;
            events.rbf_irq = true;
            events.next_rx = None;
        } else {
            events.next_rx = Some(self.pulse_width());
        }
        events
    }

    //
    // Snapshot access
    //

    pub fn save_state(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.serper.to_le_bytes());
        buf.extend_from_slice(&self.receive_buffer.to_le_bytes());
        buf.extend_from_slice(&self.receive_shift_reg.to_le_bytes());
        buf.extend_from_slice(&self.transmit_buffer.to_le_bytes());
        buf.extend_from_slice(&self.transmit_shift_reg.to_le_bytes());
        buf.push(self.ovrun as u8);
        buf.push(self.out_bit as u8);
        buf.push(self.rxd as u8);
        buf.extend_from_slice(&(self.rec_cnt as u16).to_le_bytes());
    }

    pub const SNAPSHOT_SIZE: usize = 15;

    pub fn load_state(&mut self, buf: &[u8]) -> Result<usize, crate::error::CoreError> {
        use crate::error::CoreError;
        if buf.len() < Self::SNAPSHOT_SIZE {
            return Err(CoreError::SnapshotCorrupted);
        }
        self.serper = u16::from_le_bytes([buf[0], buf[1]]);
        self.receive_buffer = u16::from_le_bytes([buf[2], buf[3]]);
        self.receive_shift_reg = u16::from_le_bytes([buf[4], buf[5]]);
        self.transmit_buffer = u16::from_le_bytes([buf[6], buf[7]]);
        self.transmit_shift_reg = u16::from_le_bytes([buf[8], buf[9]]);
        self.ovrun = buf[10] != 0;
        self.out_bit = buf[11] != 0;
        self.rxd = buf[12] != 0;
        self.rec_cnt = u16::from_le_bytes([buf[13], buf[14]]) as usize;
        Ok(Self::SNAPSHOT_SIZE)
    }
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shift a full frame out of the UART, collecting the TXD levels
    fn transmit_frame(uart: &mut Uart, value: u16) -> Vec<bool> {
        let mut bits = Vec::new();
        let events = uart.set_serdat(value);
        assert_eq!(events.next_tx, Some(0));

        loop {
            let events = uart.service_txd_event();
            bits.push(uart.out_bit);
            if events.next_tx.is_none() {
                break;
            }
        }
        bits
    }

    #[test]
    fn test_pulse_width() {
        let mut uart = Uart::new();
        uart.poke_serper(371); // 9600 baud, roughly
        assert_eq!(uart.pulse_width(), dma_cycles(372));

        uart.poke_serper(0x8000 | 371);
        assert_eq!(uart.pulse_width(), dma_cycles(372));
        assert_eq!(uart.data_bits(), 9);
    }

    #[test]
    fn test_transmit_frame_shape() {
        let mut uart = Uart::new();
        // 0x55 data bits with the stop bits on top
        let bits = transmit_frame(&mut uart, 0x355);

        // First bit out is the start bit (low)
        assert!(!bits[0]);
        // Data bits follow, LSB first: 0x55 = 0101_0101
        for i in 0..8 {
            assert_eq!(bits[1 + i], 0x55 & (1 << i) != 0, "data bit {}", i);
        }
        // The line returns to idle (high) at the end
        assert!(*bits.last().unwrap());
    }

    #[test]
    fn test_tbe_raised_on_buffer_handoff() {
        let mut uart = Uart::new();
        uart.set_serdat(0x141);
        let events = uart.service_txd_event();
        assert!(events.tbe_irq);
        assert_eq!(events.out_byte, Some(0x141));

        // Status: buffer empty, shifter busy
        let status = uart.spypeek_serdatr(false);
        assert_ne!(status & (1 << 13), 0);
        assert_eq!(status & (1 << 12), 0);
    }

    #[test]
    fn test_receive_frame() {
        let mut uart = Uart::new();
        uart.poke_serper(0); // one DMA cycle per bit

        // Start bit
        let events = uart.rxd_has_changed(false, false);
        assert!(events.next_rx.is_some());

        // Clock in 0xA3, LSB first, then the stop bit
        let mut rbf = false;
        for i in 0..9 {
            let bit = if i < 8 { 0xA3 & (1 << i) != 0 } else { true };
            uart.rxd = bit;
            let events = uart.service_rxd_event(false);
            if events.rbf_irq {
                rbf = true;
                assert!(events.next_rx.is_none());
            }
        }
        assert!(rbf, "no receive interrupt");

        // SERDATR holds the data with the stop bit on top
        let status = uart.peek_serdatr(true);
        assert_eq!(status & 0xFF, 0xA3);
        assert_ne!(status & 0x100, 0);
    }

    #[test]
    fn test_overrun_flag() {
        let mut uart = Uart::new();
        uart.rxd_has_changed(false, false);
        for i in 0..9 {
            uart.rxd = i == 8;
            // The previous byte is still unacknowledged
            uart.service_rxd_event(true);
        }
        assert_ne!(uart.peek_serdatr(true) & (1 << 15), 0);

        // Acknowledging RBF clears the flag on the next read
        assert_eq!(uart.peek_serdatr(false) & (1 << 15), 0);
    }

    #[test]
    fn test_uartbrk_forces_txd_low() {
        let uart = Uart::new();
        assert!(uart.txd(false));
        assert!(!uart.txd(true));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut uart = Uart::new();
        uart.poke_serper(0x8173);
        uart.set_serdat(0x1FF);
        uart.service_txd_event();

        let mut buf = Vec::new();
        uart.save_state(&mut buf);

        let mut restored = Uart::new();
        restored.load_state(&buf).unwrap();
        assert_eq!(restored.serper, uart.serper);
        assert_eq!(restored.transmit_shift_reg, uart.transmit_shift_reg);
        assert_eq!(restored.out_bit, uart.out_bit);
    }
}
