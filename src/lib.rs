/*!
 * Pulsar - fleet-wide directory tree copy
 *
 * A client submits "copy this tree" to one Star. That Star walks the source,
 * stripes every directory's files across the fleet, and each Star copies the
 * share it receives. This crate holds the `pulsar` binary's configuration,
 * logging setup and subcommands; the machinery lives in the `pulsar-*` crates.
 */

pub mod commands;
pub mod config;
pub mod error;
pub mod logging;

pub use config::{LogLevel, PulsarConfig};
pub use error::{PulsarError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
