#![forbid(unsafe_code)]

//! Wall clock demo.
//!
//! Ticks come from [`timer::periodic`], a feedback loop over
//! [`TimerSystem::at`] that re-arms itself one period after each alarm.
//! Every tick prints the local time as `HH:MM:SS:mmm`.

mod cli;

use std::cell::Cell as StdCell;
use std::process::ExitCode;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeDelta};
use natrium_core::{Clock, MillisecondsClock, RuntimeConfig, TimerSystem, timer};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use cli::{Command, Opts};

/// Local wall time `elapsed_ms` after `start`.
fn render(start: NaiveDateTime, elapsed_ms: u64) -> String {
    let elapsed = TimeDelta::milliseconds(i64::try_from(elapsed_ms).unwrap_or(i64::MAX));
    let at = start.checked_add_signed(elapsed).unwrap_or(start);
    at.format("%H:%M:%S:%3f").to_string()
}

fn run(opts: &Opts) -> natrium_core::Result<()> {
    RuntimeConfig::from_env().install();
    let clock = MillisecondsClock::new();
    let started = Local::now().naive_local();
    let sys = TimerSystem::new(clock.clone());
    let printed = Rc::new(StdCell::new(0_u64));

    let ticks = timer::periodic(&sys, opts.period_ms)?;
    let count = Rc::clone(&printed);
    let _listener = ticks.listen(move |t: &u64| {
        println!("{}", render(started, *t));
        count.set(count.get() + 1);
    })?;
    info!(period_ms = opts.period_ms, ticks = opts.ticks, "clock started");

    while opts.ticks == 0 || printed.get() < opts.ticks {
        if let Some(deadline) = sys.next_deadline() {
            let wait = deadline.saturating_sub(clock.now());
            if wait > 0 {
                thread::sleep(Duration::from_millis(wait));
            }
        }
        let fired = sys.advance();
        debug!(fired, "advanced");
    }
    Ok(())
}

fn main() -> ExitCode {
    let command = match Opts::parse() {
        Ok(command) => command,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };
    let opts = match command {
        Command::Run(opts) => opts,
        Command::Help => {
            println!("{}", cli::HELP_TEXT);
            return ExitCode::SUCCESS;
        }
        Command::Version => {
            println!("natrium-clock {}", cli::VERSION);
            return ExitCode::SUCCESS;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "clock failed");
            eprintln!("natrium-clock: {err}");
            ExitCode::FAILURE
        }
    }
}
