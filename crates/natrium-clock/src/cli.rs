#![forbid(unsafe_code)]

//! Command-line argument parsing for the clock demo.
//!
//! Parses args manually to keep the binary lean. Environment variables with
//! the `NATRIUM_CLOCK_*` prefix override the defaults; explicit flags
//! override both.

use std::env;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HELP_TEXT: &str = "\
natrium-clock: a wall clock built from an FRP timer loop

USAGE:
    natrium-clock [OPTIONS]

OPTIONS:
    --period-ms=N   Milliseconds between ticks, at least 1 (default: 1000)
    --ticks=N       Stop after N ticks; 0 runs until interrupted (default: 0)
    --help, -h      Show this help message
    --version, -V   Show version

ENVIRONMENT VARIABLES:
    NATRIUM_CLOCK_PERIOD_MS   Override --period-ms
    NATRIUM_CLOCK_TICKS       Override --ticks
    RUST_LOG                  Log filter (default: warn)";

const ENV_PERIOD_MS: &str = "NATRIUM_CLOCK_PERIOD_MS";
const ENV_TICKS: &str = "NATRIUM_CLOCK_TICKS";

/// Parsed command-line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opts {
    /// Milliseconds between ticks.
    pub period_ms: u64,
    /// Number of ticks to print before exiting (0 = unlimited).
    pub ticks: u64,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            ticks: 0,
        }
    }
}

/// What the binary should do after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run(Opts),
    Help,
    Version,
}

impl Opts {
    /// Parse the process arguments and environment.
    pub fn parse() -> Result<Command, String> {
        Self::parse_from(env::args().skip(1), |key| env::var(key).ok())
    }

    /// Parse `args` (without the program name), reading environment
    /// overrides through `var`.
    pub fn parse_from(
        args: impl IntoIterator<Item = String>,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Command, String> {
        let mut opts = Self::default();

        // Apply environment variable defaults first
        if let Some(val) = var(ENV_PERIOD_MS)
            && let Ok(n) = val.trim().parse()
        {
            opts.period_ms = n;
        }
        if let Some(val) = var(ENV_TICKS)
            && let Ok(n) = val.trim().parse()
        {
            opts.ticks = n;
        }

        for arg in args {
            match arg.as_str() {
                "--help" | "-h" => return Ok(Command::Help),
                "--version" | "-V" => return Ok(Command::Version),
                other => {
                    if let Some(val) = other.strip_prefix("--period-ms=") {
                        opts.period_ms = val
                            .parse()
                            .map_err(|_| format!("Invalid --period-ms value: {val}"))?;
                    } else if let Some(val) = other.strip_prefix("--ticks=") {
                        opts.ticks = val
                            .parse()
                            .map_err(|_| format!("Invalid --ticks value: {val}"))?;
                    } else {
                        return Err(format!(
                            "Unknown argument: {other}\nRun with --help for usage information."
                        ));
                    }
                }
            }
        }

        if opts.period_ms == 0 {
            return Err("--period-ms must be at least 1".to_string());
        }
        Ok(Command::Run(opts))
    }
}
