//! Behavioral stand-in for the SoC top level.
//!
//! Echoes every byte received on its serial input, mirrors both halves of the
//! switch word onto the LEDs, exposes a TAP on the JTAG pins and finishes once
//! it has received an end-of-transmission byte.

use crate::pins::{HardwareModel, SignalId, SignalSpec};
use crate::uart::{UartReceiver, UartTransmitter, DEFAULT_BAUD_RATE};

use super::tap::TapController;

/// Byte that makes the model report completion.
pub const END_OF_TRANSMISSION: u8 = 0x04;

/// IDCODE reported by the model's TAP.
pub const REFERENCE_IDCODE: u32 = 0x4BA0_0477;

/// Default clock period in virtual-time units (two harness time steps).
pub const DEFAULT_CLOCK_PERIOD: u64 = 20;

const CLK: usize = 0;
const RST: usize = 1;
const UART_RX: usize = 2;
const UART_TX: usize = 3;
const SW: usize = 4;
const LED: usize = 5;
const TCK: usize = 6;
const TMS: usize = 7;
const TDI: usize = 8;
const TRST_N: usize = 9;
const TDO: usize = 10;
const RX_COUNT: usize = 11;
const TAP_STATE: usize = 12;
const SIGNAL_COUNT: usize = 13;

/// Reference SoC model with the standard pin names.
#[derive(Debug, Clone)]
pub struct ReferenceSoc {
    signals: Vec<SignalSpec>,
    values: [u64; SIGNAL_COUNT],
    clock_period: u64,
    cycles: u64,
    last_clk: bool,
    rx: UartReceiver,
    tx: UartTransmitter,
    baud_rate: u32,
    tap: TapController,
    received: Vec<u8>,
    end_seen: bool,
}

impl Default for ReferenceSoc {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE, DEFAULT_CLOCK_PERIOD)
    }
}

impl ReferenceSoc {
    /// Creates a model whose UART runs at `baud_rate` and whose clock period
    /// is `clock_period` virtual-time units.
    #[must_use]
    pub fn new(baud_rate: u32, clock_period: u64) -> Self {
        let signals = vec![
            SignalSpec::input("clk", 1),
            SignalSpec::input("rst", 1),
            SignalSpec::input("i_uart_rx", 1),
            SignalSpec::output("o_uart_tx", 1),
            SignalSpec::input("i_sw", 32),
            SignalSpec::output("o_led", 16),
            SignalSpec::input("i_jtag_tck", 1),
            SignalSpec::input("i_jtag_tms", 1),
            SignalSpec::input("i_jtag_tdi", 1),
            SignalSpec::input("i_jtag_trst_n", 1),
            SignalSpec::output("o_jtag_tdo", 1),
            SignalSpec::output("soc.uart.rx_count", 32),
            SignalSpec::output("soc.tap.state", 4),
        ];
        let mut values = [0; SIGNAL_COUNT];
        values[UART_RX] = 1;
        values[UART_TX] = 1;
        Self {
            signals,
            values,
            clock_period,
            cycles: 0,
            last_clk: false,
            rx: UartReceiver::new(baud_rate),
            tx: UartTransmitter::new(baud_rate),
            baud_rate,
            tap: TapController::new(REFERENCE_IDCODE),
            received: Vec::new(),
            end_seen: false,
        }
    }

    /// Bytes received on the serial input.
    #[must_use]
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    /// The model's TAP controller.
    #[must_use]
    pub const fn tap(&self) -> &TapController {
        &self.tap
    }

    fn reset_uart(&mut self) {
        self.rx = UartReceiver::new(self.baud_rate);
        self.tx = UartTransmitter::new(self.baud_rate);
        self.values[UART_TX] = 1;
    }

    fn rising_edge(&mut self) {
        self.cycles += 1;
        let now = self.cycles * self.clock_period;
        if let Some(byte) = self.rx.tick(now, self.values[UART_RX] != 0) {
            self.received.push(byte);
            self.values[RX_COUNT] = self.received.len() as u64;
            if byte == END_OF_TRANSMISSION {
                self.end_seen = true;
            } else {
                self.tx.enqueue(&[byte]);
            }
        }
        self.values[UART_TX] = u64::from(self.tx.tick(now).level);
    }
}

impl HardwareModel for ReferenceSoc {
    fn signals(&self) -> &[SignalSpec] {
        &self.signals
    }

    fn read(&self, id: SignalId) -> u64 {
        self.values.get(id.0).copied().unwrap_or(0)
    }

    fn write(&mut self, id: SignalId, value: u64) {
        if let Some(slot) = self.values.get_mut(id.0) {
            *slot = value;
        }
    }

    fn eval(&mut self) {
        let clk = self.values[CLK] != 0;
        let rising = clk && !self.last_clk;
        self.last_clk = clk;
        if self.values[RST] != 0 {
            self.reset_uart();
        } else if rising {
            self.rising_edge();
        }

        let switches = self.values[SW];
        self.values[LED] = (switches & 0xFFFF) | ((switches >> 16) & 0xFFFF);

        if self.values[TRST_N] == 0 {
            self.tap.reset();
        } else {
            self.tap.clock(
                self.values[TCK] != 0,
                self.values[TMS] != 0,
                self.values[TDI] != 0,
            );
        }
        self.values[TDO] = u64::from(self.tap.tdo());
        self.values[TAP_STATE] = self.tap.state().code();
    }

    fn finished(&self) -> bool {
        self.end_seen && self.tx.is_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::{ReferenceSoc, CLK, LED, RST, SW, UART_RX, UART_TX};
    use crate::pins::{HardwareModel, SignalId};
    use crate::uart::{UartReceiver, UartTransmitter};

    const BAUD: u32 = 1_000_000;

    /// Drives `bytes` into the model and returns everything it sends back.
    fn echo(model: &mut ReferenceSoc, bytes: &[u8], half_periods: u64) -> Vec<u8> {
        let mut tx = UartTransmitter::new(BAUD);
        let mut rx = UartReceiver::new(BAUD);
        tx.enqueue(bytes);
        let mut echoed = Vec::new();
        let mut clk = true;
        for step in 0..half_periods {
            let now = step * 10;
            model.write(SignalId(UART_RX), u64::from(tx.tick(now).level));
            model.write(SignalId(CLK), u64::from(clk));
            model.eval();
            if let Some(byte) = rx.tick(now, model.read(SignalId(UART_TX)) != 0) {
                echoed.push(byte);
            }
            clk = !clk;
        }
        echoed
    }

    #[test]
    fn serial_bytes_are_echoed() {
        let mut model = ReferenceSoc::new(BAUD, 20);
        let echoed = echo(&mut model, b"hi", 6_000);
        assert_eq!(model.received(), b"hi");
        assert_eq!(echoed, b"hi");
        assert!(!model.finished());
    }

    #[test]
    fn end_of_transmission_finishes_after_echo_drains() {
        let mut model = ReferenceSoc::new(BAUD, 20);
        echo(&mut model, b"A\x04", 6_000);
        assert!(model.finished());
    }

    #[test]
    fn leds_combine_both_switch_halves() {
        let mut model = ReferenceSoc::default();
        model.write(SignalId(SW), 0x00F0_000F);
        model.eval();
        assert_eq!(model.read(SignalId(LED)), 0x00FF);
    }

    #[test]
    fn reset_holds_the_serial_output_idle() {
        let mut model = ReferenceSoc::new(BAUD, 20);
        model.write(SignalId(RST), 1);
        let echoed = echo(&mut model, b"x", 4_000);
        assert!(echoed.is_empty());
        assert!(model.received().is_empty());
        assert_eq!(model.read(SignalId(UART_TX)), 1);
    }
}
