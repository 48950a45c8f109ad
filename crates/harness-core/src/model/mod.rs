//! Built-in hardware model used by the command-line driver and the tests.
//!
//! Real designs plug in through [`HardwareModel`](crate::pins::HardwareModel).

/// Reference SoC top level.
pub mod reference;
/// JTAG test access port.
pub mod tap;

pub use reference::{ReferenceSoc, DEFAULT_CLOCK_PERIOD, END_OF_TRANSMISSION, REFERENCE_IDCODE};
pub use tap::{TapController, TapState, BYPASS_INSTRUCTION, IDCODE_INSTRUCTION, IR_LENGTH};
