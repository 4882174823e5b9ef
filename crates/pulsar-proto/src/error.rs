//! Error types for the wire protocol

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}
