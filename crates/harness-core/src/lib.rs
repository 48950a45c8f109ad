//! Cycle-accurate hardware-in-the-loop harness for pin-level SoC models.

/// Virtual time base and clock state.
pub mod time;
pub use time::{ClockEdge, SimulationContext};

/// Role-based access to model signals.
pub mod pins;
pub use pins::{
    field_mask, Direction, HardwareModel, PinAccess, PinError, PinInterface, PinMap, PinRole,
    SignalId, SignalSpec,
};

/// Error taxonomy for harness startup and configuration.
pub mod error;
pub use error::HarnessError;

/// Runtime configuration and plusarg parsing.
pub mod config;
pub use config::{
    ClockConfig, GpioStimulusConfig, HarnessConfig, JtagConfig, ResetConfig,
    TelemetryConfig, TraceConfig, UartConfig, DEFAULT_JTAG_PORT, DEFAULT_TELEMETRY_PORT,
    DEFAULT_TRACE_DEPTH, DEFAULT_TRACE_FILE,
};

/// Software 8N1 serial codec and its bridge.
pub mod uart;
pub use uart::{
    bit_period, TxTick, UartBridge, UartPhase, UartReceiver, UartTransmitter, DEFAULT_BAUD_RATE,
};

/// `jtag_vpi` remote debug bridge.
pub mod jtag;
pub use jtag::{JtagBridge, JtagBridgeAdapter, JtagGate, JtagStatus};

/// GPIO input ownership, stimulus and output monitoring.
pub mod gpio;
pub use gpio::{
    AllocationError, ChannelAllocation, GpioStimulus, InputOwner, InputRange, OutputMonitor,
    GPIO_INPUT_WIDTH,
};

/// Interactive observer bridge over JSON lines.
pub mod telemetry;
pub use telemetry::{
    InputChannel, OutputChange, OutputChannel, OutputKind, TcpTelemetryEndpoint, TelemetryBridge,
    TelemetryEndpoint, TelemetryState,
};

/// VCD waveform recorder.
pub mod trace;
pub use trace::TraceRecorder;

/// Driver loop and bridge contract.
pub mod harness;
pub use harness::{Bridge, BridgeOutcome, Harness, RunReport, TerminationCause};

/// Built-in reference model.
pub mod model;
pub use model::{ReferenceSoc, TapController, TapState, END_OF_TRANSMISSION, REFERENCE_IDCODE};

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
#[cfg(test)]
use tempfile as _;
