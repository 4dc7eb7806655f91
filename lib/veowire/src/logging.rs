use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::env;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Environment variable selecting the log level for both the client
/// library and the worker binary.
pub const LEVEL_ENV_VAR: &str = "VEO_LOG_LEVEL";

/// Build the stderr terminal logger. The level comes from `VEO_LOG_LEVEL`
/// and defaults to `info`; unrecognized values fall back to the default.
pub fn init() -> Logger {
    let level = env::var(LEVEL_ENV_VAR)
        .ok()
        .and_then(|value| parse_level(&value))
        .unwrap_or(Severity::Info);

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);

    builder.build().expect("Error building terminal logger")
}

fn parse_level(value: &str) -> Option<Severity> {
    match value.to_ascii_lowercase().as_str() {
        "trace" => Some(Severity::Trace),
        "debug" => Some(Severity::Debug),
        "info" => Some(Severity::Info),
        "warning" | "warn" => Some(Severity::Warning),
        "error" => Some(Severity::Error),
        "critical" => Some(Severity::Critical),
        _ => None,
    }
}
