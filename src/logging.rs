/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::{PulsarError, Result};

/// Crates whose events pass the level filter
const PULSAR_TARGETS: &[&str] = &[
    "pulsar",
    "pulsar_star",
    "pulsar_connect",
    "pulsar_jobs",
    "pulsar_resilience",
];

/// Directive string enabling `level` for every pulsar crate.
pub fn filter_directives(level: Level) -> String {
    PULSAR_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialize structured logging. `debug` overrides the configured level.
///
/// `RUST_LOG`, when set, takes precedence over both.
pub fn init_logging(config: &LoggingConfig, debug: bool) -> Result<()> {
    let level = if debug {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(level)))
        .map_err(|e| PulsarError::Config(format!("Failed to create log filter: {}", e)))?;

    match config.file {
        Some(ref log_path) => init_file_logging(log_path, env_filter)?,
        None => init_stderr_logging(env_filter),
    }

    Ok(())
}

fn init_stderr_logging(env_filter: EnvFilter) {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// JSON lines, one event per line.
fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::options()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| {
            PulsarError::Config(format!(
                "Failed to open log file {}: {}",
                log_path.display(),
                e
            ))
        })?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}

/// Initialize logging with custom format for testing
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(filter_directives(Level::DEBUG)));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_cover_every_crate() {
        let directives = filter_directives(Level::WARN);
        assert!(directives.contains("pulsar=WARN"));
        assert!(directives.contains("pulsar_star=WARN"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }
}
