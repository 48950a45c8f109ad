//! Harness configuration and Verilator-style plusarg parsing.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::uart::DEFAULT_BAUD_RATE;

/// Default TCP port of the JTAG VPI listener.
pub const DEFAULT_JTAG_PORT: u16 = 5555;

/// Default TCP port of the telemetry listener.
pub const DEFAULT_TELEMETRY_PORT: u16 = 8081;

/// Default depth limit for waveform scopes.
pub const DEFAULT_TRACE_DEPTH: u32 = 99;

/// Default waveform file name.
pub const DEFAULT_TRACE_FILE: &str = "trace.vcd";

/// Clock generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Virtual time advanced per loop iteration (one half clock period).
    pub time_step: u64,
    /// Level of the clock line at time zero.
    pub starts_high: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            time_step: 10,
            starts_high: true,
        }
    }
}

/// Reset sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    /// Virtual time at which reset is released.
    pub release_time: u64,
    /// True when the reset line is asserted high.
    pub active_high: bool,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            release_time: 100,
            active_high: true,
        }
    }
}

impl ResetConfig {
    /// Line level while reset is asserted.
    #[must_use]
    pub const fn asserted_level(&self) -> u64 {
        if self.active_high {
            1
        } else {
            0
        }
    }

    /// Line level once reset is released.
    #[must_use]
    pub const fn released_level(&self) -> u64 {
        if self.active_high {
            0
        } else {
            1
        }
    }
}

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UartConfig {
    /// Line rate in bits per second.
    pub baud_rate: u32,
    /// Bytes queued toward the model at startup.
    pub tx_script: Vec<u8>,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            tx_script: Vec::new(),
        }
    }
}

/// JTAG VPI transport settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JtagConfig {
    /// Starts the listener when true.
    pub enabled: bool,
    /// Listener port; zero picks an ephemeral port.
    pub port: u16,
    /// Loop iterations per TCK phase.
    pub divisor: u64,
    /// Binds to the loopback interface only.
    pub loopback_only: bool,
}

impl Default for JtagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_JTAG_PORT,
            divisor: 1,
            loopback_only: true,
        }
    }
}

/// Telemetry transport settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Starts the listener when true.
    pub enabled: bool,
    /// Listener port; zero picks an ephemeral port.
    pub port: u16,
    /// Virtual time between input polls.
    pub poll_interval: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_TELEMETRY_PORT,
            poll_interval: 10_000,
        }
    }
}

/// Waveform recording settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Records a waveform when true.
    pub enabled: bool,
    /// Output file.
    pub path: PathBuf,
    /// Deepest scope level recorded.
    pub depth: u32,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from(DEFAULT_TRACE_FILE),
            depth: DEFAULT_TRACE_DEPTH,
        }
    }
}

/// Periodic GPIO input stimulus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioStimulusConfig {
    /// Runs the counter when true.
    pub enabled: bool,
    /// Virtual time between increments.
    pub interval: u64,
}

impl Default for GpioStimulusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 10_000_000,
        }
    }
}

/// Complete harness configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Clock generation.
    pub clock: ClockConfig,
    /// Reset sequencing.
    pub reset: ResetConfig,
    /// Serial line.
    pub uart: UartConfig,
    /// JTAG VPI transport.
    pub jtag: JtagConfig,
    /// Telemetry transport.
    pub telemetry: TelemetryConfig,
    /// Waveform recording.
    pub trace: TraceConfig,
    /// GPIO input stimulus.
    pub stimulus: GpioStimulusConfig,
    /// Virtual time limit; zero runs until another trigger fires.
    pub timeout: u64,
    /// Requests debug-level logging.
    pub verbose: bool,
}

impl HarnessConfig {
    /// Builds a configuration from `+key[=value]` arguments.
    ///
    /// Arguments without a leading `+` and unrecognized keys are ignored. A
    /// malformed number, or zero where a positive value is required, is logged
    /// and leaves the default in place.
    pub fn from_plusargs<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        for arg in args {
            let Some(plusarg) = arg.as_ref().strip_prefix('+') else {
                continue;
            };
            let (key, value) = match plusarg.split_once('=') {
                Some((key, value)) => (key, value),
                None => (plusarg, ""),
            };
            match key {
                "timeout" => set_number(&mut config.timeout, key, value),
                "vcd" => config.trace.enabled = true,
                "trace_depth" => set_number(&mut config.trace.depth, key, value),
                "jtag_vpi_enable" => config.jtag.enabled = true,
                "jtag_port" => set_number(&mut config.jtag.port, key, value),
                "jtag_divisor" => set_positive(&mut config.jtag.divisor, key, value),
                "telemetry_enable" => config.telemetry.enabled = true,
                "telemetry_port" => set_number(&mut config.telemetry.port, key, value),
                "uart_send" => config.uart.tx_script.extend(unescape(value)),
                "baud" => set_positive(&mut config.uart.baud_rate, key, value),
                "verbose" => config.verbose = true,
                _ => {}
            }
        }
        config
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.parse().ok();
    if parsed.is_none() {
        warn!(key, value, "plusarg expects a number; keeping default");
    }
    parsed
}

fn set_number<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    if let Some(number) = parse_number(key, value) {
        *slot = number;
    }
}

fn set_positive<T>(slot: &mut T, key: &str, value: &str)
where
    T: std::str::FromStr + Default + PartialEq,
{
    match parse_number::<T>(key, value) {
        Some(number) if number == T::default() => {
            warn!(key, "plusarg must be greater than zero; keeping default");
        }
        Some(number) => *slot = number,
        None => {}
    }
}

/// Expands `\n`, `\r`, `\t`, `\\` and `\xHH`; anything else is kept verbatim.
fn unescape(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let byte = bytes[index];
        if byte != b'\\' || index + 1 >= bytes.len() {
            out.push(byte);
            index += 1;
            continue;
        }
        let (expanded, consumed) = match bytes[index + 1] {
            b'n' => (b'\n', 2),
            b'r' => (b'\r', 2),
            b't' => (b'\t', 2),
            b'\\' => (b'\\', 2),
            b'x' => match text
                .get(index + 2..index + 4)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                Some(value) => (value, 4),
                None => (b'\\', 1),
            },
            _ => (b'\\', 1),
        };
        out.push(expanded);
        index += consumed;
    }
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{unescape, HarnessConfig, DEFAULT_JTAG_PORT, DEFAULT_TELEMETRY_PORT};

    #[test]
    fn defaults_follow_reference_testbench() {
        let config = HarnessConfig::default();
        assert_eq!(config.clock.time_step, 10);
        assert!(config.clock.starts_high);
        assert_eq!(config.reset.release_time, 100);
        assert_eq!(config.uart.baud_rate, 115_200);
        assert_eq!(config.jtag.port, DEFAULT_JTAG_PORT);
        assert_eq!(config.telemetry.port, DEFAULT_TELEMETRY_PORT);
        assert_eq!(config.telemetry.poll_interval, 10_000);
        assert_eq!(config.stimulus.interval, 10_000_000);
        assert_eq!(config.timeout, 0);
        assert!(!config.trace.enabled);
        assert!(!config.jtag.enabled);
    }

    #[test]
    fn plusargs_enable_features_and_set_values() {
        let config = HarnessConfig::from_plusargs([
            "+timeout=1000",
            "+vcd",
            "+jtag_vpi_enable",
            "+jtag_port=6000",
            "+jtag_divisor=4",
            "+telemetry_enable=1",
            "+baud=9600",
            "+trace_depth=2",
        ]);
        assert_eq!(config.timeout, 1000);
        assert!(config.trace.enabled);
        assert!(config.jtag.enabled);
        assert_eq!(config.jtag.port, 6000);
        assert_eq!(config.jtag.divisor, 4);
        assert!(config.telemetry.enabled);
        assert_eq!(config.uart.baud_rate, 9600);
        assert_eq!(config.trace.depth, 2);
    }

    #[test]
    fn unknown_and_non_plus_arguments_are_ignored() {
        let config = HarnessConfig::from_plusargs(["soc.elf", "+nope=3", "-x"]);
        assert_eq!(config, HarnessConfig::default());
    }

    #[rstest]
    #[case("+timeout=soon")]
    #[case("+timeout")]
    #[case("+jtag_port=70000")]
    #[case("+baud=0")]
    #[case("+jtag_divisor=0")]
    #[case("+trace_depth=-1")]
    fn invalid_values_keep_the_default(#[case] arg: &str) {
        assert_eq!(HarnessConfig::from_plusargs([arg]), HarnessConfig::default());
    }

    #[test]
    fn later_valid_value_overrides_an_earlier_invalid_one() {
        let config = HarnessConfig::from_plusargs(["+baud=fast", "+timeout=7", "+baud=9600"]);
        assert_eq!(config.uart.baud_rate, 9600);
        assert_eq!(config.timeout, 7);
    }

    #[test]
    fn uart_script_expands_escapes() {
        let config = HarnessConfig::from_plusargs([r"+uart_send=hi\n\x04"]);
        assert_eq!(config.uart.tx_script, b"hi\n\x04");
    }

    #[rstest]
    #[case(r"a\tb", b"a\tb".to_vec())]
    #[case(r"\\", b"\\".to_vec())]
    #[case(r"\q", b"\\q".to_vec())]
    #[case(r"\x4", b"\\x4".to_vec())]
    #[case(r"end\", b"end\\".to_vec())]
    fn unescape_handles_edge_cases(#[case] text: &str, #[case] expected: Vec<u8>) {
        assert_eq!(unescape(text), expected);
    }

    #[test]
    fn config_loads_from_partial_json() {
        let config: HarnessConfig =
            serde_json::from_str(r#"{"timeout": 500, "jtag": {"enabled": true}}"#)
                .expect("json config");
        assert_eq!(config.timeout, 500);
        assert!(config.jtag.enabled);
        assert_eq!(config.jtag.port, DEFAULT_JTAG_PORT);
    }
}
