//! JTAG transport: an OpenOCD `jtag_vpi` server that bit-bangs the model's
//! TAP pins from virtual time.

/// Non-blocking TCP server and per-phase stepping.
pub mod bridge;
/// Wire record codec.
pub mod packet;
/// TCK waveform generation.
pub mod shifter;

pub use bridge::{JtagBridge, JtagStatus};
pub use packet::{PacketError, VpiCommand, VpiPacket, PACKET_SIZE, XFER_MAX_SIZE};
pub use shifter::{JtagLines, JtagShifter, TAP_RESET_CYCLES};

use crate::harness::{Bridge, BridgeOutcome, TerminationCause};
use crate::pins::{PinAccess, PinRole};
use crate::time::SimulationContext;

/// Decides on which virtual-time instants the JTAG bridge runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JtagGate {
    period: u64,
}

impl JtagGate {
    /// One TCK phase every `divisor` loop iterations of `time_step` each.
    #[must_use]
    pub const fn new(divisor: u64, time_step: u64) -> Self {
        let period = divisor.saturating_mul(time_step);
        Self {
            period: if period == 0 { 1 } else { period },
        }
    }

    /// Virtual time between TCK phases.
    #[must_use]
    pub const fn period(&self) -> u64 {
        self.period
    }

    /// Cycle index for `virtual_time`, or `None` between gated instants.
    #[must_use]
    pub const fn cycle_for(&self, virtual_time: u64) -> Option<u64> {
        if virtual_time % self.period == 0 {
            Some(virtual_time / self.period)
        } else {
            None
        }
    }
}

/// Connects a [`JtagBridge`] to the model's TAP pins.
#[derive(Debug)]
pub struct JtagBridgeAdapter {
    bridge: JtagBridge,
    gate: JtagGate,
}

impl JtagBridgeAdapter {
    /// Wraps a bound server.
    #[must_use]
    pub const fn new(bridge: JtagBridge, gate: JtagGate) -> Self {
        Self { bridge, gate }
    }

    /// The underlying server.
    #[must_use]
    pub const fn bridge(&self) -> &JtagBridge {
        &self.bridge
    }
}

impl Bridge for JtagBridgeAdapter {
    fn name(&self) -> &'static str {
        "jtag"
    }

    fn attach(&mut self, pins: &mut dyn PinAccess) {
        let idle = JtagLines::default();
        pins.write(PinRole::JtagTck, u64::from(idle.tck));
        pins.write(PinRole::JtagTms, u64::from(idle.tms));
        pins.write(PinRole::JtagTdi, u64::from(idle.tdi));
    }

    fn tick(&mut self, ctx: &SimulationContext, pins: &mut dyn PinAccess) -> BridgeOutcome {
        let Some(cycle) = self.gate.cycle_for(ctx.virtual_time) else {
            return BridgeOutcome::Continue;
        };
        let tdo = pins.read(PinRole::JtagTdo) != 0;
        let (mut tms, mut tdi, mut tck) = (false, false, false);
        let status = self.bridge.step(cycle, &mut tms, &mut tdi, &mut tck, tdo);
        pins.write(PinRole::JtagTms, u64::from(tms));
        pins.write(PinRole::JtagTdi, u64::from(tdi));
        pins.write(PinRole::JtagTck, u64::from(tck));
        match status {
            JtagStatus::Success => BridgeOutcome::Continue,
            JtagStatus::ClientDisconnected => {
                BridgeOutcome::Terminate(TerminationCause::JtagDisconnected)
            }
            JtagStatus::ProtocolError => {
                BridgeOutcome::Terminate(TerminationCause::JtagProtocolError)
            }
        }
    }

    fn shutdown(&mut self) {
        self.bridge.close();
    }
}
