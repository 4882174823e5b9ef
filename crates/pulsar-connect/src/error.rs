//! Error types for the pulsar-connect crate

use pulsar_proto::ProtoError;
use pulsar_resilience::ResilienceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Timed out talking to {address}")]
    Timeout { address: String },

    #[error("Protocol error talking to {address}: {source}")]
    Protocol {
        address: String,
        #[source]
        source: ProtoError,
    },

    #[error("{address} rejected the request: {message}")]
    Rejected { address: String, message: String },

    #[error("Unexpected response from {address} to {op}")]
    UnexpectedResponse { address: String, op: &'static str },

    #[error("Dispatch to {address} failed: {source}")]
    Dispatch {
        address: String,
        #[source]
        source: ResilienceError,
    },

    #[error("No peers configured")]
    NoPeers,
}

impl ConnectError {
    /// Whether retrying the same call may succeed.
    ///
    /// A frame the codec refuses to encode fails the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectError::ConnectionFailed { .. } | ConnectError::Timeout { .. } => true,
            ConnectError::Protocol { source, .. } => {
                matches!(source, ProtoError::Io(_) | ProtoError::Closed)
            }
            _ => false,
        }
    }

    pub(crate) fn into_resilience(self) -> ResilienceError {
        if self.is_transient() {
            ResilienceError::Transient(self.to_string())
        } else {
            ResilienceError::Permanent(self.to_string())
        }
    }
}
