#![forbid(unsafe_code)]

//! Per-thread runtime configuration.
//!
//! The engine is single-threaded, so configuration lives in a thread-local
//! slot next to the graph it governs. Defaults suit production use; the
//! `NATRIUM_*` environment variables override them via
//! [`RuntimeConfig::from_env`].

use std::cell::RefCell;
use std::env;

/// Environment variable toggling listener panic isolation (`0`/`false` to disable).
pub const ENV_ISOLATE_LISTENERS: &str = "NATRIUM_ISOLATE_LISTENERS";
/// Environment variable overriding the per-pass propagation step limit.
pub const ENV_MAX_PROPAGATION_STEPS: &str = "NATRIUM_MAX_PROPAGATION_STEPS";

const DEFAULT_MAX_PROPAGATION_STEPS: u64 = 1_000_000;

thread_local! {
    static CONFIG: RefCell<RuntimeConfig> = RefCell::new(RuntimeConfig::default());
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Catch panics raised by listener callbacks so that the remaining
    /// listeners of the same transaction still run.
    pub isolate_listener_panics: bool,
    /// Upper bound on node updates processed in a single propagation pass.
    /// Exceeding it aborts the pass and records a cyclic-dependency failure.
    pub max_propagation_steps: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            isolate_listener_panics: true,
            max_propagation_steps: DEFAULT_MAX_PROPAGATION_STEPS,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied. Unparseable values are
    /// ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = env::var(ENV_ISOLATE_LISTENERS)
            && let Some(flag) = parse_flag(&val)
        {
            config.isolate_listener_panics = flag;
        }
        if let Ok(val) = env::var(ENV_MAX_PROPAGATION_STEPS)
            && let Ok(n) = val.trim().parse::<u64>()
            && n > 0
        {
            config.max_propagation_steps = n;
        }
        config
    }

    /// Install this configuration for the current thread.
    pub fn install(self) {
        tracing::debug!(config = ?self, "runtime config installed");
        CONFIG.with(|slot| *slot.borrow_mut() = self);
    }

    /// Configuration in effect on the current thread.
    #[must_use]
    pub fn current() -> Self {
        CONFIG.with(|slot| slot.borrow().clone())
    }
}

fn parse_flag(val: &str) -> Option<bool> {
    let val = val.trim();
    if val == "1" || val.eq_ignore_ascii_case("true") || val.eq_ignore_ascii_case("on") {
        Some(true)
    } else if val == "0" || val.eq_ignore_ascii_case("false") || val.eq_ignore_ascii_case("off") {
        Some(false)
    } else {
        None
    }
}
