//! Pulsar Connect: client-side connectivity to Stars
//!
//! Used by the `pulsar` command line client and by every Star's distributor.
//!
//! # Architecture
//!
//! - **PeerClient**: one framed TCP connection to a Star, with typed calls for
//!   every remote operation and transparent reconnect
//! - **PeerManager**: the ordered peer set from configuration, one circuit
//!   breaker per peer, and `connect_all` for distributors
//!
//! # Example
//!
//! ```rust,no_run
//! use pulsar_connect::PeerClient;
//! use std::time::Duration;
//!
//! async fn example() -> Result<(), pulsar_connect::ConnectError> {
//!     let star = PeerClient::connect("127.0.0.1:1234", Duration::from_secs(5)).await?;
//!     let report = star.job_status(1).await?;
//!     println!("{} {}", report.job_id, report.state);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod manager;
pub mod peer;

pub use error::ConnectError;
pub use manager::{DispatchConfig, PeerManager, PeerRecord};
pub use peer::PeerClient;
