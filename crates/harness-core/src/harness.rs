//! The driver loop: reset sequencing, clocking, bridge scheduling,
//! termination and shutdown.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::gpio::{ChannelAllocation, GpioStimulus, InputOwner, InputRange, OutputMonitor};
use crate::jtag::{JtagBridge, JtagBridgeAdapter, JtagGate};
use crate::pins::{HardwareModel, PinAccess, PinInterface, PinRole};
use crate::telemetry::{TcpTelemetryEndpoint, TelemetryBridge};
use crate::time::SimulationContext;
use crate::trace::TraceRecorder;
use crate::uart::UartBridge;

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationCause {
    /// The model reported completion.
    ModelFinished,
    /// Virtual time reached the configured limit.
    Timeout,
    /// The stop flag was raised, normally by SIGINT.
    Interrupted,
    /// The JTAG client went away.
    JtagDisconnected,
    /// The JTAG client sent a malformed request.
    JtagProtocolError,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ModelFinished => "model finished",
            Self::Timeout => "timeout",
            Self::Interrupted => "interrupted",
            Self::JtagDisconnected => "JTAG client disconnected",
            Self::JtagProtocolError => "JTAG protocol error",
        };
        f.write_str(text)
    }
}

/// Result of one bridge tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Keep simulating.
    Continue,
    /// End the run with the given cause.
    Terminate(TerminationCause),
}

/// A component that exchanges pin values with the model once per iteration.
pub trait Bridge {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Drives initial levels before the first iteration.
    fn attach(&mut self, _pins: &mut dyn PinAccess) {}

    /// Runs one iteration at `ctx.virtual_time`.
    fn tick(&mut self, ctx: &SimulationContext, pins: &mut dyn PinAccess) -> BridgeOutcome;

    /// Releases external resources when the harness shuts down.
    fn shutdown(&mut self);
}

/// Summary returned by [`Harness::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Termination trigger.
    pub cause: TerminationCause,
    /// Virtual time of the iteration that terminated.
    pub final_time: u64,
    /// Every byte decoded from the model's UART.
    pub uart_received: Vec<u8>,
}

/// Cycle-accurate harness around one pin-level model.
pub struct Harness<M: HardwareModel> {
    config: HarnessConfig,
    pins: PinInterface<M>,
    ctx: SimulationContext,
    uart: Option<UartBridge>,
    jtag: Option<JtagBridgeAdapter>,
    telemetry: Option<TelemetryBridge>,
    telemetry_addr: Option<SocketAddr>,
    trace: Option<TraceRecorder>,
    stimulus: Option<GpioStimulus>,
    monitor: OutputMonitor,
    reset_released: bool,
    shut_down: bool,
}

impl<M: HardwareModel> fmt::Debug for Harness<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("ctx", &self.ctx)
            .field("uart", &self.uart.is_some())
            .field("jtag", &self.jtag.is_some())
            .field("telemetry", &self.telemetry.is_some())
            .field("trace", &self.trace.is_some())
            .field("reset_released", &self.reset_released)
            .finish_non_exhaustive()
    }
}

impl<M: HardwareModel> Harness<M> {
    /// Builds a harness with the default GPIO input split.
    ///
    /// # Errors
    ///
    /// See [`with_allocation`](Self::with_allocation).
    pub fn new(config: HarnessConfig, pins: PinInterface<M>) -> Result<Self, HarnessError> {
        Self::with_allocation(config, pins, ChannelAllocation::default())
    }

    /// Validates pins, opens the trace and binds the enabled listeners.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError`] when a required role is unbound, a listener
    /// cannot bind or the trace file cannot be created.
    pub fn with_allocation(
        config: HarnessConfig,
        mut pins: PinInterface<M>,
        allocation: ChannelAllocation,
    ) -> Result<Self, HarnessError> {
        pins.require(PinRole::Clock)?;
        pins.require(PinRole::Reset)?;

        let uart_bound = pins.is_bound(PinRole::UartRx) && pins.is_bound(PinRole::UartTx);
        if !config.uart.tx_script.is_empty() {
            pins.require(PinRole::UartRx)?;
            pins.require(PinRole::UartTx)?;
        }
        let uart =
            uart_bound.then(|| UartBridge::new(config.uart.baud_rate, &config.uart.tx_script));

        let jtag = if config.jtag.enabled {
            for role in [
                PinRole::JtagTck,
                PinRole::JtagTms,
                PinRole::JtagTdi,
                PinRole::JtagTdo,
            ] {
                pins.require(role)?;
            }
            let bridge = JtagBridge::initialize(config.jtag.port, config.jtag.loopback_only)?;
            let gate = JtagGate::new(config.jtag.divisor, config.clock.time_step);
            Some(JtagBridgeAdapter::new(bridge, gate))
        } else {
            None
        };

        let (telemetry, telemetry_addr) = if config.telemetry.enabled {
            pins.require(PinRole::GpioIn)?;
            pins.require(PinRole::GpioOut)?;
            let endpoint = TcpTelemetryEndpoint::bind(config.telemetry.port)?;
            let addr = endpoint.local_addr().ok();
            let range = allocation
                .range(InputOwner::Telemetry)
                .unwrap_or(InputRange::new(InputOwner::Telemetry, 0, 0));
            let bridge =
                TelemetryBridge::new(Box::new(endpoint), range, config.telemetry.poll_interval);
            (Some(bridge), addr)
        } else {
            (None, None)
        };

        let stimulus = if config.stimulus.enabled && pins.is_bound(PinRole::GpioIn) {
            allocation
                .range(InputOwner::Stimulus)
                .map(|range| GpioStimulus::new(range, config.stimulus.interval))
        } else {
            None
        };

        let trace = if config.trace.enabled {
            Some(TraceRecorder::open(
                &config.trace.path,
                config.trace.depth,
                pins.model().signals(),
            )?)
        } else {
            None
        };

        let ctx = SimulationContext::new(config.clock.starts_high);
        pins.write(PinRole::Clock, u64::from(ctx.clock_level));
        pins.write(PinRole::Reset, config.reset.asserted_level());
        pins.write(PinRole::JtagTrst, 0);
        pins.write(PinRole::GpioIn, 0);

        let mut harness = Self {
            config,
            pins,
            ctx,
            uart,
            jtag,
            telemetry,
            telemetry_addr,
            trace,
            stimulus,
            monitor: OutputMonitor::new(),
            reset_released: false,
            shut_down: false,
        };
        harness.attach_bridges();
        Ok(harness)
    }

    /// Current simulation state.
    #[must_use]
    pub const fn context(&self) -> &SimulationContext {
        &self.ctx
    }

    /// Bound model pins.
    #[must_use]
    pub const fn pins(&self) -> &PinInterface<M> {
        &self.pins
    }

    /// Address of the JTAG listener, when enabled.
    #[must_use]
    pub fn jtag_addr(&self) -> Option<SocketAddr> {
        self.jtag
            .as_ref()
            .and_then(|adapter| adapter.bridge().local_addr().ok())
    }

    /// Address of the telemetry listener, when enabled.
    #[must_use]
    pub const fn telemetry_addr(&self) -> Option<SocketAddr> {
        self.telemetry_addr
    }

    /// Returns true while the waveform file is open.
    #[must_use]
    pub fn trace_open(&self) -> bool {
        self.trace.as_ref().is_some_and(TraceRecorder::is_open)
    }

    /// Runs until a termination trigger fires, then shuts everything down.
    ///
    /// `stop` is polled once per iteration.
    pub fn run(&mut self, stop: &AtomicBool) -> RunReport {
        let time_step = self.config.clock.time_step.max(1);
        let cause = loop {
            let now = self.ctx.virtual_time;
            if !self.reset_released && now >= self.config.reset.release_time {
                info!(time = now, "releasing reset");
                self.pins
                    .write(PinRole::Reset, self.config.reset.released_level());
                self.pins.write(PinRole::JtagTrst, 1);
                self.reset_released = true;
            }

            self.pins.eval();
            if let Some(trace) = self.trace.as_mut() {
                trace.sample(now, self.pins.model());
            }

            let fatal = self.tick_bridges();
            self.monitor.tick(now, &self.pins);

            if let Some(cause) = self.termination(stop, fatal) {
                self.ctx.request_termination();
                break cause;
            }

            self.ctx.toggle_clock();
            self.pins
                .write(PinRole::Clock, u64::from(self.ctx.clock_level));
            self.ctx.advance(time_step);
            if let Some(stimulus) = self.stimulus.as_mut() {
                stimulus.tick(self.ctx.virtual_time, &mut self.pins);
            }
        };

        let final_time = self.ctx.virtual_time;
        match cause {
            TerminationCause::Timeout => info!(time = final_time, "timeout: exiting"),
            TerminationCause::Interrupted => info!(time = final_time, "caught interrupt"),
            _ => info!(time = final_time, %cause, "simulation finished"),
        }
        let uart_received = self
            .uart
            .as_ref()
            .map(|uart| uart.received().to_vec())
            .unwrap_or_default();
        self.shutdown();
        RunReport {
            cause,
            final_time,
            uart_received,
        }
    }

    /// Closes sockets and the waveform file. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for bridge in self.bridges() {
            debug!(bridge = bridge.name(), "shutting down");
            bridge.shutdown();
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.close();
        }
    }

    fn attach_bridges(&mut self) {
        let Self {
            pins,
            uart,
            jtag,
            telemetry,
            ..
        } = self;
        let bridges: [Option<&mut dyn Bridge>; 3] = [
            uart.as_mut().map(|bridge| bridge as &mut dyn Bridge),
            jtag.as_mut().map(|bridge| bridge as &mut dyn Bridge),
            telemetry.as_mut().map(|bridge| bridge as &mut dyn Bridge),
        ];
        for bridge in bridges.into_iter().flatten() {
            bridge.attach(&mut *pins);
        }
    }

    fn bridges(&mut self) -> impl Iterator<Item = &mut dyn Bridge> {
        [
            self.uart.as_mut().map(|bridge| bridge as &mut dyn Bridge),
            self.jtag.as_mut().map(|bridge| bridge as &mut dyn Bridge),
            self.telemetry.as_mut().map(|bridge| bridge as &mut dyn Bridge),
        ]
        .into_iter()
        .flatten()
    }

    fn tick_bridges(&mut self) -> Option<TerminationCause> {
        let mut fatal = None;
        let mut uart_byte = None;
        if let Some(uart) = self.uart.as_mut() {
            fatal = fatal.or(terminal(uart.tick(&self.ctx, &mut self.pins)));
            uart_byte = uart.last_received();
        }
        if self.reset_released {
            if let Some(jtag) = self.jtag.as_mut() {
                fatal = fatal.or(terminal(jtag.tick(&self.ctx, &mut self.pins)));
            }
        }
        if let Some(telemetry) = self.telemetry.as_mut() {
            if let Some(byte) = uart_byte {
                telemetry.push_stream_byte(self.ctx.virtual_time, byte);
            }
            fatal = fatal.or(terminal(telemetry.tick(&self.ctx, &mut self.pins)));
        }
        fatal
    }

    fn termination(
        &self,
        stop: &AtomicBool,
        fatal: Option<TerminationCause>,
    ) -> Option<TerminationCause> {
        if self.pins.finished() {
            Some(TerminationCause::ModelFinished)
        } else if self.ctx.timed_out(self.config.timeout) {
            Some(TerminationCause::Timeout)
        } else if stop.load(Ordering::Relaxed) {
            Some(TerminationCause::Interrupted)
        } else {
            if let Some(cause) = fatal {
                warn!(time = self.ctx.virtual_time, %cause, "bridge requested termination");
            }
            fatal
        }
    }
}

impl<M: HardwareModel> Drop for Harness<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

const fn terminal(outcome: BridgeOutcome) -> Option<TerminationCause> {
    match outcome {
        BridgeOutcome::Continue => None,
        BridgeOutcome::Terminate(cause) => Some(cause),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use rstest::rstest;

    use super::{Harness, TerminationCause};
    use crate::config::HarnessConfig;
    use crate::model::ReferenceSoc;
    use crate::pins::{PinAccess, PinError, PinInterface, PinMap, PinRole};
    use crate::HarnessError;

    fn build(config: HarnessConfig) -> Harness<ReferenceSoc> {
        let pins = PinInterface::bind(ReferenceSoc::default(), &PinMap::default()).expect("bind");
        Harness::new(config, pins).expect("harness")
    }

    #[rstest]
    #[case(TerminationCause::ModelFinished, "model finished")]
    #[case(TerminationCause::Timeout, "timeout")]
    #[case(TerminationCause::Interrupted, "interrupted")]
    #[case(TerminationCause::JtagDisconnected, "JTAG client disconnected")]
    #[case(TerminationCause::JtagProtocolError, "JTAG protocol error")]
    fn causes_display_as_text(#[case] cause: TerminationCause, #[case] text: &str) {
        assert_eq!(cause.to_string(), text);
    }

    #[test]
    fn timeout_stops_at_first_iteration_at_or_past_limit() {
        let mut harness = build(HarnessConfig {
            timeout: 1_005,
            ..HarnessConfig::default()
        });
        let report = harness.run(&AtomicBool::new(false));
        assert_eq!(report.cause, TerminationCause::Timeout);
        assert_eq!(report.final_time, 1_010);
        assert!(harness.context().termination_requested);
    }

    #[test]
    fn raised_stop_flag_interrupts_first_iteration() {
        let mut harness = build(HarnessConfig::default());
        let report = harness.run(&AtomicBool::new(true));
        assert_eq!(report.cause, TerminationCause::Interrupted);
        assert_eq!(report.final_time, 0);
    }

    #[test]
    fn reset_is_released_at_configured_time() {
        let mut harness = build(HarnessConfig {
            timeout: 90,
            ..HarnessConfig::default()
        });
        harness.run(&AtomicBool::new(false));
        assert_eq!(harness.pins().read(PinRole::Reset), 1);

        let mut harness = build(HarnessConfig {
            timeout: 100,
            ..HarnessConfig::default()
        });
        harness.run(&AtomicBool::new(false));
        assert_eq!(harness.pins().read(PinRole::Reset), 0);
        assert_eq!(harness.pins().read(PinRole::JtagTrst), 1);
    }

    #[test]
    fn jtag_requires_its_pins() {
        let map = PinMap::default().without(PinRole::JtagTdo);
        let pins = PinInterface::bind(ReferenceSoc::default(), &map).expect("bind");
        let mut config = HarnessConfig::default();
        config.jtag.enabled = true;
        config.jtag.port = 0;
        let error = Harness::new(config, pins).expect_err("tdo is missing");
        assert!(matches!(
            error,
            HarnessError::Pin(PinError::MissingRole {
                role: PinRole::JtagTdo
            })
        ));
    }

    #[test]
    fn clock_toggles_every_iteration() {
        let mut harness = build(HarnessConfig {
            timeout: 30,
            ..HarnessConfig::default()
        });
        harness.run(&AtomicBool::new(false));
        // Three toggles from a high start: high, low, high, low.
        assert!(!harness.context().clock_level);
    }
}
