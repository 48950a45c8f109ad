//! Telemetry bridge: mirrors GPIO outputs and the UART stream to a remote
//! observer and applies the observer's switch inputs to the model.

/// Observer transport.
pub mod endpoint;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use endpoint::{
    ObserverMessage, ServerMessage, TcpTelemetryEndpoint, TelemetryEndpoint, MAX_PENDING_OUTPUT,
};

use crate::gpio::InputRange;
use crate::harness::{Bridge, BridgeOutcome};
use crate::pins::{PinAccess, PinRole};
use crate::time::SimulationContext;

/// Number of LED output channels.
pub const LED_CHANNELS: u32 = 16;

/// Name of the UART stream channel.
pub const UART_CHANNEL: &str = "uart";

/// Observer-driven channel mapped to one GPIO input bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputChannel {
    /// Channel name.
    pub name: String,
    /// Bit of the GPIO input word.
    pub bit: u32,
}

/// How an output channel is sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputKind {
    /// Level of one GPIO output bit; changes are deduplicated.
    Level {
        /// Bit of the GPIO output word.
        bit: u32,
    },
    /// Byte stream; every byte is published.
    Stream,
}

/// Model-driven channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChannel {
    /// Stable channel identifier.
    pub id: u32,
    /// Channel name.
    pub name: String,
    /// Source of the channel value.
    #[serde(flatten)]
    pub kind: OutputKind,
}

/// One published output value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChange {
    /// Channel name.
    pub channel: String,
    /// New level or stream byte.
    pub value: u64,
    /// Virtual time of the change.
    pub time: u64,
}

/// Channel tables and the last value published per level channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryState {
    /// Switch inputs.
    pub inputs: Vec<InputChannel>,
    /// LED levels followed by the UART stream.
    pub outputs: Vec<OutputChannel>,
    /// Last published value keyed by output channel id.
    pub last_observed: BTreeMap<u32, u64>,
}

impl TelemetryState {
    /// Builds `sw0..` over `range` and `led0..led15` plus the UART stream.
    #[must_use]
    pub fn new(range: InputRange) -> Self {
        let inputs = (0..range.width)
            .map(|index| InputChannel {
                name: format!("sw{index}"),
                bit: range.lsb + index,
            })
            .collect();
        let mut outputs: Vec<OutputChannel> = (0..LED_CHANNELS)
            .map(|bit| OutputChannel {
                id: bit,
                name: format!("led{bit}"),
                kind: OutputKind::Level { bit },
            })
            .collect();
        outputs.push(OutputChannel {
            id: LED_CHANNELS,
            name: UART_CHANNEL.to_string(),
            kind: OutputKind::Stream,
        });
        Self {
            inputs,
            outputs,
            last_observed: BTreeMap::new(),
        }
    }
}

/// Harness adapter around a [`TelemetryEndpoint`].
pub struct TelemetryBridge {
    endpoint: Box<dyn TelemetryEndpoint>,
    state: TelemetryState,
    range: InputRange,
    poll_interval: u64,
    next_poll: u64,
}

impl std::fmt::Debug for TelemetryBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBridge")
            .field("state", &self.state)
            .field("range", &self.range)
            .field("poll_interval", &self.poll_interval)
            .field("next_poll", &self.next_poll)
            .finish_non_exhaustive()
    }
}

impl TelemetryBridge {
    /// Creates the bridge and registers the channel tables with `endpoint`.
    #[must_use]
    pub fn new(
        mut endpoint: Box<dyn TelemetryEndpoint>,
        range: InputRange,
        poll_interval: u64,
    ) -> Self {
        let state = TelemetryState::new(range);
        endpoint.register_channels(&state.inputs, &state.outputs);
        Self {
            endpoint,
            state,
            range,
            poll_interval: poll_interval.max(1),
            next_poll: 0,
        }
    }

    /// Channel tables and dedup state.
    #[must_use]
    pub const fn state(&self) -> &TelemetryState {
        &self.state
    }

    /// Publishes one byte read from the model's UART.
    pub fn push_stream_byte(&mut self, time: u64, byte: u8) {
        self.endpoint.push_output_change(&OutputChange {
            channel: UART_CHANNEL.to_string(),
            value: u64::from(byte),
            time,
        });
    }

    fn apply_inputs(&self, values: &[u8], pins: &mut dyn PinAccess) {
        let field = (0..self.range.width)
            .filter(|index| values.get(*index as usize).is_some_and(|value| *value != 0))
            .fold(0u64, |field, index| field | (1 << index));
        pins.write_field(PinRole::GpioIn, self.range.lsb, self.range.width, field);
    }

    fn publish_levels(&mut self, time: u64, pins: &dyn PinAccess) {
        let leds = pins.read(PinRole::GpioOut);
        for channel in &self.state.outputs {
            let OutputKind::Level { bit } = channel.kind else {
                continue;
            };
            let level = (leds >> bit) & 1;
            if self.state.last_observed.get(&channel.id) == Some(&level) {
                continue;
            }
            self.state.last_observed.insert(channel.id, level);
            self.endpoint.push_output_change(&OutputChange {
                channel: channel.name.clone(),
                value: level,
                time,
            });
        }
    }
}

impl Bridge for TelemetryBridge {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    fn tick(&mut self, ctx: &SimulationContext, pins: &mut dyn PinAccess) -> BridgeOutcome {
        let now = ctx.virtual_time;
        if now >= self.next_poll {
            self.next_poll = now.saturating_add(self.poll_interval);
            if let Some(values) = self.endpoint.poll_inputs() {
                debug!(time = now, ?values, "telemetry inputs");
                self.apply_inputs(&values, pins);
            }
        }
        self.publish_levels(now, pins);
        BridgeOutcome::Continue
    }

    fn shutdown(&mut self) {
        self.endpoint.close();
    }
}
