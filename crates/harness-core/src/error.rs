//! Crate-level error type for harness construction.
//!
//! Only startup can fail with an error. Once the loop is running, transport
//! faults are reported as a [`TerminationCause`](crate::TerminationCause).

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::gpio::AllocationError;
use crate::pins::PinError;

/// Errors that prevent the harness from starting.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A transport listener could not be bound.
    #[error("failed to start {transport} listener on {addr}: {source}")]
    Startup {
        /// Transport name (`jtag` or `telemetry`).
        transport: &'static str,
        /// Address the listener tried to bind.
        addr: SocketAddr,
        /// Underlying socket error.
        source: io::Error,
    },
    /// The waveform file could not be created or its header written.
    #[error("failed to open waveform trace {}: {source}", path.display())]
    Trace {
        /// Requested trace path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Role binding failed.
    #[error(transparent)]
    Pin(#[from] PinError),
    /// Input channel ranges conflict.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}
