//! Error classification for retried operations

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// Failure worth retrying (connection refused, reset, timeout)
    #[error("transient failure: {0}")]
    Transient(String),

    /// Failure that will not go away by retrying (peer rejected the request)
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The breaker is open and the call was not attempted
    #[error("circuit open, peer considered unhealthy")]
    CircuitOpen,

    /// Every retry failed
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: String },
}

impl ResilienceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ResilienceError::Transient(_))
    }

    /// Whether this failure counts against the breaker.
    ///
    /// Permanent errors mean the peer answered, so the peer itself is healthy.
    pub fn should_trip_breaker(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_) | ResilienceError::RetriesExhausted { .. }
        )
    }
}
