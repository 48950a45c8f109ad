//! CLI entry point for the SoC hardware-in-the-loop harness.

use std::env;
use std::ffi::OsString;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use harness_core::{
    Harness, HarnessConfig, PinInterface, PinMap, ReferenceSoc, RunReport,
};
use signal_hook::consts::SIGINT;
#[cfg(test)]
use tempfile as _;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const USAGE_TEXT: &str = "\
Usage: soc-harness [+plusargs...] [options]

Plusargs:
  +timeout=<n>          Stop at virtual time n (0 runs until another trigger)
  +vcd                  Record every signal to trace.vcd
  +trace_depth=<n>      Maximum scope depth recorded (default 99)
  +jtag_vpi_enable      Accept a jtag_vpi debug client
  +jtag_port=<port>     JTAG listener port (default 5555)
  +jtag_divisor=<n>     Harness steps per JTAG phase (default 1)
  +telemetry_enable     Accept a telemetry observer
  +telemetry_port=<port> Telemetry listener port (default 8081)
  +uart_send=<text>     Bytes to send to the model; accepts \\n \\r \\t \\\\ \\xHH
  +baud=<n>             UART baud rate (default 115200)
  +verbose              Same as --verbose

Options:
  -v, --verbose         Log at debug level (RUST_LOG overrides)
  -h, --help            Show this help message

Examples:
  soc-harness +timeout=50000000 +vcd
  soc-harness +jtag_vpi_enable +jtag_port=5555
  soc-harness +uart_send='hello\\x04'
";

#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    plusargs: Vec<String>,
    verbose: bool,
    unknown: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum ParseResult {
    Run(CliArgs),
    Help,
}

fn parse_args(args: impl Iterator<Item = OsString>) -> ParseResult {
    let mut plusargs = Vec::new();
    let mut verbose = false;
    let mut unknown = Vec::new();

    for arg in args {
        if arg == "--help" || arg == "-h" {
            return ParseResult::Help;
        }

        if arg == "--verbose" || arg == "-v" {
            verbose = true;
            continue;
        }

        let text = arg.to_string_lossy();
        if text.starts_with('-') {
            unknown.push(text.into_owned());
        } else if text.starts_with('+') {
            if text == "+verbose" || text.starts_with("+verbose=") {
                verbose = true;
            }
            plusargs.push(text.into_owned());
        }
    }

    ParseResult::Run(CliArgs {
        plusargs,
        verbose,
        unknown,
    })
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &CliArgs) -> Result<RunReport, String> {
    init_logging(args.verbose);
    for option in &args.unknown {
        warn!(%option, "ignoring unknown option");
    }
    let config = HarnessConfig::from_plusargs(&args.plusargs);
    debug!(?config, "harness configuration");

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))
        .map_err(|e| format!("failed to install SIGINT handler: {e}"))?;

    let clock_period = config.clock.time_step.saturating_mul(2).max(1);
    let model = ReferenceSoc::new(config.uart.baud_rate, clock_period);
    let pins = PinInterface::bind(model, &PinMap::default()).map_err(|e| e.to_string())?;
    let mut harness = Harness::new(config, pins).map_err(|e| e.to_string())?;
    Ok(harness.run(&stop))
}

fn main() {
    let exit_code = match parse_args(env::args_os().skip(1)) {
        ParseResult::Help => {
            println!("{USAGE_TEXT}");
            0
        }
        ParseResult::Run(args) => match run(&args) {
            Ok(report) => {
                println!(
                    "Simulation ended: {} at time {}",
                    report.cause, report.final_time
                );
                0
            }
            Err(error) => {
                eprintln!("error: {error}");
                1
            }
        },
    };

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn parse(args: &[&str]) -> ParseResult {
        parse_args(args.iter().map(OsString::from))
    }

    #[test]
    fn collects_plusargs_in_order() {
        assert_eq!(
            parse(&["+timeout=100", "+vcd"]),
            ParseResult::Run(CliArgs {
                plusargs: vec!["+timeout=100".to_string(), "+vcd".to_string()],
                verbose: false,
                unknown: Vec::new(),
            })
        );
    }

    #[test]
    fn parses_help_flag() {
        assert_eq!(parse(&["+vcd", "-h"]), ParseResult::Help);
    }

    #[test]
    fn parses_verbose_flags() {
        for flag in ["-v", "--verbose", "+verbose"] {
            let ParseResult::Run(args) = parse(&[flag]) else {
                panic!("{flag} should parse");
            };
            assert!(args.verbose);
        }
    }

    #[test]
    fn ignores_bare_arguments() {
        let ParseResult::Run(args) = parse(&["model.bin", "+timeout=5"]) else {
            panic!("bare arguments should be ignored");
        };
        assert_eq!(args.plusargs, vec!["+timeout=5".to_string()]);
    }

    #[test]
    fn unknown_options_are_collected_not_fatal() {
        let ParseResult::Run(args) = parse(&["--fast", "+timeout=5", "-q"]) else {
            panic!("unknown options should not stop the run");
        };
        assert_eq!(args.unknown, vec!["--fast".to_string(), "-q".to_string()]);
        assert_eq!(args.plusargs, vec!["+timeout=5".to_string()]);
    }

    #[test]
    fn usage_lists_every_plusarg() {
        for key in [
            "+timeout",
            "+vcd",
            "+trace_depth",
            "+jtag_vpi_enable",
            "+jtag_port",
            "+jtag_divisor",
            "+telemetry_enable",
            "+telemetry_port",
            "+uart_send",
            "+baud",
            "+verbose",
        ] {
            assert!(USAGE_TEXT.contains(key), "{key} missing from usage");
        }
    }
}
