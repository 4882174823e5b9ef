//! Pulsar Resilience: fault tolerance for peer dispatch
//!
//! A [`CircuitBreaker`] guards every peer a distributor talks to. Transient
//! failures (refused or reset connections) are retried with exponential
//! backoff according to a [`RetryPolicy`]; repeated failures open the circuit
//! so later calls to the same peer fail fast instead of piling up delays.
//!
//! ```text
//! Distributor ──► CircuitBreaker(peer) ──► submit_batch
//!                   │  transient error?
//!                   ├── retry after backoff(1), backoff(2), ...
//!                   └── exhausted → RetriesExhausted (job fails)
//! ```

pub mod circuit_breaker;
pub mod error;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};
pub use error::ResilienceError;
