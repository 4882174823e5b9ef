/*!
 * Error types and process exit codes for the pulsar binary
 */

use pulsar_connect::ConnectError;
use pulsar_star::StarError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PulsarError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
/// The Star answered, but refused the request
pub const EXIT_REJECTED: i32 = 1;
/// Nothing was sent: bad config, unreachable server, bind failure
pub const EXIT_FATAL: i32 = 2;

#[derive(Error, Debug)]
pub enum PulsarError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Star(#[from] StarError),

    /// A Star replied with an `Error:` string
    #[error("{0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PulsarError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PulsarError::Rejected(_) => EXIT_REJECTED,
            PulsarError::Connect(ConnectError::Rejected { .. }) => EXIT_REJECTED,
            PulsarError::Config(_)
            | PulsarError::Connect(_)
            | PulsarError::Star(_)
            | PulsarError::Io(_) => EXIT_FATAL,
        }
    }
}
