//! Bit-banged 8N1 UART codec timed against virtual time.
//!
//! Both directions run a small phase machine (`Idle`, `Start`, eight `Data`
//! phases, `Stop`). Deadlines advance by exactly one bit period from the
//! previous deadline, so encode and decode stay bit-exact at any time step.

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::harness::{Bridge, BridgeOutcome};
use crate::pins::{PinAccess, PinRole};
use crate::time::SimulationContext;

/// Virtual-time units per second.
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Bit periods in one frame: start, eight data bits, stop.
pub const FRAME_BITS: u64 = 10;

/// Baud rate used when none is configured.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Bit period in virtual-time units for `baud_rate`, using integer division.
#[must_use]
pub const fn bit_period(baud_rate: u32) -> u64 {
    let baud = if baud_rate == 0 { 1 } else { baud_rate as u64 };
    NANOS_PER_SECOND / baud
}

/// Position of a codec inside the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UartPhase {
    /// Line idle, waiting for work (transmit) or a start edge (receive).
    #[default]
    Idle,
    /// Start bit in progress.
    Start,
    /// Data bit `n` in progress, least-significant first.
    Data(u8),
    /// Stop bit in progress.
    Stop,
}

/// Result of one transmitter tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxTick {
    /// Level to drive on the line.
    pub level: bool,
    /// Byte whose frame completed on this tick.
    pub sent: Option<u8>,
}

/// Transmit side: turns queued bytes into line levels.
#[derive(Debug, Clone)]
pub struct UartTransmitter {
    phase: UartPhase,
    bit_period: u64,
    next_deadline: u64,
    shift: u8,
    current: u8,
    level: bool,
    ready_at: Option<u64>,
    pending: VecDeque<u8>,
}

impl UartTransmitter {
    /// Creates an idle transmitter for `baud_rate`.
    #[must_use]
    pub fn new(baud_rate: u32) -> Self {
        Self {
            phase: UartPhase::Idle,
            bit_period: bit_period(baud_rate),
            next_deadline: 0,
            shift: 0,
            current: 0,
            level: true,
            ready_at: None,
            pending: VecDeque::new(),
        }
    }

    /// Queues bytes for transmission in order.
    pub fn enqueue(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes.iter().copied());
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> UartPhase {
        self.phase
    }

    /// Bit period in virtual-time units.
    #[must_use]
    pub const fn bit_period(&self) -> u64 {
        self.bit_period
    }

    /// Returns true when nothing is queued or in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.phase == UartPhase::Idle && self.pending.is_empty()
    }

    /// Advances the transmitter to `now` and returns the line level to drive.
    ///
    /// The first byte starts one bit period after the first tick so a receiver
    /// always observes an idle line before the start edge.
    pub fn tick(&mut self, now: u64) -> TxTick {
        let mut sent = None;
        match self.phase {
            UartPhase::Idle => {}
            UartPhase::Start => {
                if now >= self.next_deadline {
                    self.drive_next_data_bit(0);
                    self.next_deadline += self.bit_period;
                }
            }
            UartPhase::Data(index) => {
                if now >= self.next_deadline {
                    if index == 7 {
                        self.phase = UartPhase::Stop;
                        self.level = true;
                    } else {
                        self.drive_next_data_bit(index + 1);
                    }
                    self.next_deadline += self.bit_period;
                }
            }
            UartPhase::Stop => {
                if now >= self.next_deadline {
                    self.phase = UartPhase::Idle;
                    self.ready_at = Some(now);
                    sent = Some(self.current);
                }
            }
        }

        if self.phase == UartPhase::Idle {
            self.try_start(now);
        }

        TxTick {
            level: self.level,
            sent,
        }
    }

    fn try_start(&mut self, now: u64) {
        let ready_at = *self.ready_at.get_or_insert(now + self.bit_period);
        if now < ready_at {
            return;
        }
        if let Some(byte) = self.pending.pop_front() {
            self.current = byte;
            self.shift = byte;
            self.phase = UartPhase::Start;
            self.level = false;
            self.next_deadline = now + self.bit_period;
        }
    }

    fn drive_next_data_bit(&mut self, index: u8) {
        self.phase = UartPhase::Data(index);
        self.level = self.shift & 1 != 0;
        self.shift >>= 1;
    }
}

/// Receive side: reconstructs bytes from sampled line levels.
#[derive(Debug, Clone)]
pub struct UartReceiver {
    phase: UartPhase,
    bit_period: u64,
    next_deadline: u64,
    shift: u8,
    previous: Option<bool>,
}

impl UartReceiver {
    /// Creates an idle receiver for `baud_rate`.
    #[must_use]
    pub const fn new(baud_rate: u32) -> Self {
        Self {
            phase: UartPhase::Idle,
            bit_period: bit_period(baud_rate),
            next_deadline: 0,
            shift: 0,
            previous: None,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> UartPhase {
        self.phase
    }

    /// Feeds one line sample taken at `now`.
    ///
    /// Returns the decoded byte on the tick that closes its frame, exactly
    /// ten bit periods after the start edge. The stop level is not checked.
    pub fn tick(&mut self, now: u64, line: bool) -> Option<u8> {
        let mut delivered = None;
        match self.phase {
            UartPhase::Idle => {}
            UartPhase::Start => {
                if now >= self.next_deadline {
                    if line {
                        // Line went back high before mid-bit: not a start bit.
                        self.phase = UartPhase::Idle;
                    } else {
                        self.phase = UartPhase::Data(0);
                        self.next_deadline += self.bit_period;
                    }
                }
            }
            UartPhase::Data(index) => {
                if now >= self.next_deadline {
                    self.shift |= u8::from(line) << index;
                    if index == 7 {
                        self.phase = UartPhase::Stop;
                        // Close the frame on the stop bit's trailing boundary.
                        self.next_deadline +=
                            self.bit_period + (self.bit_period - self.bit_period / 2);
                    } else {
                        self.phase = UartPhase::Data(index + 1);
                        self.next_deadline += self.bit_period;
                    }
                }
            }
            UartPhase::Stop => {
                if now >= self.next_deadline {
                    self.phase = UartPhase::Idle;
                    delivered = Some(self.shift);
                }
            }
        }

        if self.phase == UartPhase::Idle && self.previous == Some(true) && !line {
            self.phase = UartPhase::Start;
            self.next_deadline = now + self.bit_period / 2;
            self.shift = 0;
        }
        self.previous = Some(line);
        delivered
    }
}

/// Harness adapter driving the model's serial input and decoding its output.
#[derive(Debug, Clone)]
pub struct UartBridge {
    tx: UartTransmitter,
    rx: UartReceiver,
    received: Vec<u8>,
    last_received: Option<u8>,
    sent: usize,
}

impl UartBridge {
    /// Creates a bridge for `baud_rate` with `script` queued for transmission.
    #[must_use]
    pub fn new(baud_rate: u32, script: &[u8]) -> Self {
        let mut tx = UartTransmitter::new(baud_rate);
        tx.enqueue(script);
        Self {
            tx,
            rx: UartReceiver::new(baud_rate),
            received: Vec::new(),
            last_received: None,
            sent: 0,
        }
    }

    /// Queues more bytes toward the model.
    pub fn enqueue(&mut self, bytes: &[u8]) {
        self.tx.enqueue(bytes);
    }

    /// Every byte decoded from the model so far.
    #[must_use]
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    /// Number of bytes fully transmitted to the model.
    #[must_use]
    pub const fn sent_count(&self) -> usize {
        self.sent
    }

    /// Byte decoded during the most recent tick, if any.
    #[must_use]
    pub const fn last_received(&self) -> Option<u8> {
        self.last_received
    }
}

impl Bridge for UartBridge {
    fn name(&self) -> &'static str {
        "uart"
    }

    fn attach(&mut self, pins: &mut dyn PinAccess) {
        pins.write(PinRole::UartRx, 1);
    }

    fn tick(&mut self, ctx: &SimulationContext, pins: &mut dyn PinAccess) -> BridgeOutcome {
        let now = ctx.virtual_time;
        self.last_received = None;

        let tx = self.tx.tick(now);
        pins.write(PinRole::UartRx, u64::from(tx.level));
        if let Some(byte) = tx.sent {
            self.sent += 1;
            info!(time = now, byte, "sent byte over UART");
        }

        let line = pins.read(PinRole::UartTx) != 0;
        if let Some(byte) = self.rx.tick(now, line) {
            let shown = if byte.is_ascii_graphic() || byte == b' ' {
                char::from(byte)
            } else {
                '.'
            };
            info!(time = now, byte, "read \"{shown}\" from UART");
            self.received.push(byte);
            self.last_received = Some(byte);
        }
        BridgeOutcome::Continue
    }

    fn shutdown(&mut self) {
        debug!(
            sent = self.sent,
            received = self.received.len(),
            "uart bridge stopped"
        );
    }
}
