//! Wires `LOG_LEVEL`/`LOG_FORMAT`/`NO_COLOR`/`FORCE_COLOR` (§6) onto
//! `tracing-subscriber`'s `fmt` layer. This is the only place in the
//! workspace that installs a global subscriber.

use std::env;
use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

/// Build the filter from `LOG_LEVEL`, defaulting to `info` (mirrors
/// `turbomcp-proxy`'s verbosity-to-level mapping, but driven by an env var
/// instead of `-v` flags since this binary has no subcommands to flag).
fn env_filter() -> EnvFilter {
    let level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn color_enabled() -> bool {
    if env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if env::var_os("FORCE_COLOR").is_some() {
        return true;
    }
    std::io::stderr().is_terminal()
}

/// Install the global tracing subscriber. Must be called exactly once,
/// before any other subsystem emits an event.
pub fn init() {
    let filter = env_filter();
    let json = env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let ansi = color_enabled();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(std::io::stderr);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
