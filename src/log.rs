//! Logging setup.
//!
//! Library code logs through `tracing` macros with structured fields. The
//! embedding application installs a subscriber; [`init`] installs a
//! formatted one filtered by `RUST_LOG`.
//!
//! Log levels:
//! - ERROR: failures that prevent an operation from completing
//! - WARN: failed attempts, rejected pipelines, release anomalies
//! - INFO: workflow, pipeline and scheduler lifecycle
//! - DEBUG: per-stage and per-task transitions
//! - TRACE: event bus traffic
//!
//! Debug mode can be enabled with `debug = true` in the config file or the
//! `FLOWCORE_DEBUG=1` env var. `RUST_LOG` overrides both.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

/// Env var that turns on debug logging.
pub const DEBUG_ENV: &str = "FLOWCORE_DEBUG";

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging at the default level.
pub fn init() -> bool {
    init_with_debug(false)
}

/// Install a global fmt subscriber.
///
/// Returns `false` when a global subscriber was already installed, in which
/// case the existing one is left alone.
pub fn init_with_debug(debug: bool) -> bool {
    let env_debug = debug_from_env(std::env::var(DEBUG_ENV).ok().as_deref());
    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn debug_from_env(value: Option<&str>) -> bool {
    value.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "flowcore=debug"
    } else {
        "flowcore=info"
    }
}
