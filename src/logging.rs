//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. `--verbose` CLI flag (if provided)
//! 2. `RAILYARD_LOG` environment variable (e.g. "info", "debug")
//! 3. the given default
//!
//! Controller commands default to `warn` so diagnostics never interleave with
//! task progress lines; the supervisor defaults to `info`.

use tracing_subscriber::fmt;

/// Initialise the global logging subscriber. Call once at startup.
pub fn init_logging(verbose: bool, default: tracing::Level) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        std::env::var("RAILYARD_LOG")
            .ok()
            .and_then(|raw| parse_level_str(&raw))
            .unwrap_or(default)
    };

    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();
}

fn parse_level_str(raw: &str) -> Option<tracing::Level> {
    match raw.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_strings_parse_case_insensitively() {
        assert_eq!(parse_level_str("DEBUG"), Some(tracing::Level::DEBUG));
        assert_eq!(parse_level_str(" warn "), Some(tracing::Level::WARN));
        assert_eq!(parse_level_str("warning"), Some(tracing::Level::WARN));
        assert_eq!(parse_level_str("loud"), None);
    }
}
