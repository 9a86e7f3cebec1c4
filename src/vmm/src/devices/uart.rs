// SPDX-License-Identifier: Apache-2.0

//! PL011 UART emulation.
//!
//! Register offsets and bit positions follow the ARM PrimeCell UART
//! (PL011) TRM. Transmission is synchronous: a DR write goes straight
//! to the output sink, so the TX FIFO always reads as empty. Receive
//! data is queued in an RX FIFO by [`Pl011::inject_input`] and drained
//! by guest DR reads.
//!
//! The interrupt line is level triggered. After every state change the
//! masked status `RIS & IMSC` is recomputed and the GIC line is driven
//! only on edges, tracked by `irq_asserted`.

use std::collections::VecDeque;
use std::io::Write;

use super::{Device, IrqLine};

// Register offsets.
const UARTDR: u64 = 0x000;
const UARTRSR: u64 = 0x004;
const UARTFR: u64 = 0x018;
const UARTIBRD: u64 = 0x024;
const UARTFBRD: u64 = 0x028;
const UARTLCR_H: u64 = 0x02c;
const UARTCR: u64 = 0x030;
const UARTIMSC: u64 = 0x038;
const UARTRIS: u64 = 0x03c;
const UARTMIS: u64 = 0x040;
const UARTICR: u64 = 0x044;

// Flag register bits.
const FR_TXFE: u64 = 1 << 7;
const FR_RXFE: u64 = 1 << 4;

/// Receive interrupt bit in RIS/MIS/IMSC/ICR.
pub const INT_RX: u64 = 1 << 4;

/// PL011 UART with an injected output sink and a GIC line handle.
pub struct Pl011 {
    base: u64,
    out: Box<dyn Write + Send>,
    line: Box<dyn IrqLine>,

    cr: u64,
    lcr_h: u64,
    ibrd: u64,
    fbrd: u64,
    imsc: u64,
    ris: u64,
    rx_fifo: VecDeque<u8>,
    /// Last level driven onto the GIC line.
    irq_asserted: bool,
}

impl Pl011 {
    pub fn new(base: u64, out: Box<dyn Write + Send>, line: Box<dyn IrqLine>) -> Self {
        Pl011 {
            base,
            out,
            line,
            cr: 0,
            lcr_h: 0,
            ibrd: 0,
            fbrd: 0,
            imsc: 0,
            ris: 0,
            rx_fifo: VecDeque::new(),
            irq_asserted: false,
        }
    }

    /// Queue received bytes and raise the RX interrupt condition.
    pub fn inject_input(&mut self, data: &[u8]) {
        self.rx_fifo.extend(data);
        self.ris |= INT_RX;
        self.update_irq_line();
    }

    fn read_dr(&mut self) -> u64 {
        let value = match self.rx_fifo.pop_front() {
            Some(byte) => u64::from(byte),
            None => 0,
        };
        if self.rx_fifo.is_empty() {
            self.ris &= !INT_RX;
        } else {
            self.ris |= INT_RX;
        }
        self.update_irq_line();
        value
    }

    fn write_dr(&mut self, value: u64) {
        let byte = [(value & 0xff) as u8];
        if self.out.write_all(&byte).is_err() || self.out.flush().is_err() {
            log::warn!("pl011: dropped output byte");
        }
    }

    /// Drive the GIC line to match `RIS & IMSC`, edges only.
    fn update_irq_line(&mut self) {
        let masked = self.ris & self.imsc;
        if masked != 0 && !self.irq_asserted {
            self.line.set_level(true);
            self.irq_asserted = true;
        } else if masked == 0 && self.irq_asserted {
            self.line.set_level(false);
            self.irq_asserted = false;
        }
    }
}

impl Device for Pl011 {
    fn name(&self) -> &str {
        "pl011"
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        crate::layout::UART_SIZE
    }

    fn read(&mut self, offset: u64, _size: u8) -> u64 {
        match offset {
            UARTDR => self.read_dr(),
            // No receive errors to report.
            UARTRSR => 0,
            UARTFR => {
                let mut flags = FR_TXFE;
                if self.rx_fifo.is_empty() {
                    flags |= FR_RXFE;
                }
                flags
            }
            UARTCR => self.cr,
            UARTLCR_H => self.lcr_h,
            UARTIBRD => self.ibrd,
            UARTFBRD => self.fbrd,
            UARTIMSC => self.imsc,
            UARTRIS => self.ris,
            UARTMIS => self.ris & self.imsc,
            _ => 0,
        }
    }

    fn write(&mut self, offset: u64, _size: u8, value: u64) {
        match offset {
            UARTDR => self.write_dr(value),
            UARTRSR => {}
            UARTCR => self.cr = value,
            UARTLCR_H => self.lcr_h = value,
            UARTIBRD => self.ibrd = value,
            UARTFBRD => self.fbrd = value,
            UARTIMSC => {
                self.imsc = value;
                self.update_irq_line();
            }
            UARTICR => {
                self.ris &= !value;
                self.update_irq_line();
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.cr = 0;
        self.lcr_h = 0;
        self.ibrd = 0;
        self.fbrd = 0;
        self.imsc = 0;
        self.ris = 0;
        self.rx_fifo.clear();
        self.irq_asserted = false;
    }
}
