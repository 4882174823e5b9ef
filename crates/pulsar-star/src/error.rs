//! Error types for the pulsar-star crate

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StarError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
