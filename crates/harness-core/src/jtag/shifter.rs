//! TCK waveform generation for one `jtag_vpi` request at a time.
//!
//! Each [`JtagShifter::step`] is one TCK phase. The low phase sets up TMS
//! and TDI. The high phase samples TDO, which the target updates while TCK is
//! low, and then raises TCK.

use super::packet::{bit, set_bit, VpiCommand, VpiPacket};

/// Number of TCK periods with TMS high used for a `RESET` request.
pub const TAP_RESET_CYCLES: u32 = 5;

/// Levels the shifter drives onto the JTAG inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JtagLines {
    /// Test clock.
    pub tck: bool,
    /// Test mode select.
    pub tms: bool,
    /// Test data in.
    pub tdi: bool,
}

impl Default for JtagLines {
    fn default() -> Self {
        Self {
            tck: true,
            tms: true,
            tdi: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShiftKind {
    Reset,
    Tms,
    Scan { flip_tms: bool },
}

#[derive(Debug, Clone)]
struct Transfer {
    kind: ShiftKind,
    packet: Box<VpiPacket>,
    bit: u32,
    total: u32,
    tck_low: bool,
}

/// Clocks one validated request bit by bit.
#[derive(Debug, Clone, Default)]
pub struct JtagShifter {
    transfer: Option<Transfer>,
    lines: JtagLines,
}

impl JtagShifter {
    /// Creates an idle shifter with TCK high.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a request is being clocked.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.transfer.is_some()
    }

    /// Current line levels.
    #[must_use]
    pub const fn lines(&self) -> JtagLines {
        self.lines
    }

    /// Starts clocking `packet`. `StopSimulation` is not a waveform and is ignored.
    pub fn load(&mut self, command: VpiCommand, packet: VpiPacket) {
        let (kind, total) = match command {
            VpiCommand::Reset => (ShiftKind::Reset, TAP_RESET_CYCLES),
            VpiCommand::TmsSeq => (ShiftKind::Tms, packet.nb_bits),
            VpiCommand::ScanChain => (ShiftKind::Scan { flip_tms: false }, packet.nb_bits),
            VpiCommand::ScanChainFlipTms => (ShiftKind::Scan { flip_tms: true }, packet.nb_bits),
            VpiCommand::StopSimulation => return,
        };
        let mut packet = Box::new(packet);
        packet.buffer_in.fill(0);
        self.transfer = Some(Transfer {
            kind,
            packet,
            bit: 0,
            total,
            tck_low: false,
        });
    }

    /// Advances one TCK phase using the current `tdo` level.
    ///
    /// Returns the reply record when a scan request completes.
    pub fn step(&mut self, tdo: bool) -> Option<VpiPacket> {
        let transfer = self.transfer.as_mut()?;
        if transfer.bit < transfer.total {
            let index = transfer.bit as usize;
            if transfer.tck_low {
                if matches!(transfer.kind, ShiftKind::Scan { .. }) {
                    set_bit(&mut transfer.packet.buffer_in, index, tdo);
                }
                self.lines.tck = true;
                transfer.tck_low = false;
                transfer.bit += 1;
                if transfer.bit < transfer.total {
                    return None;
                }
            } else {
                let (tms, tdi) = match transfer.kind {
                    ShiftKind::Reset => (true, false),
                    ShiftKind::Tms => (bit(&transfer.packet.buffer_out, index), false),
                    ShiftKind::Scan { flip_tms } => (
                        flip_tms && transfer.bit + 1 == transfer.total,
                        bit(&transfer.packet.buffer_out, index),
                    ),
                };
                self.lines = JtagLines {
                    tck: false,
                    tms,
                    tdi,
                };
                transfer.tck_low = true;
                return None;
            }
        }
        let finished = self.transfer.take()?;
        match finished.kind {
            ShiftKind::Scan { .. } => Some(*finished.packet),
            ShiftKind::Reset | ShiftKind::Tms => None,
        }
    }
}
