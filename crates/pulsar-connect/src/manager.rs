//! PeerManager: the configured peer set and the health of each peer

use crate::error::ConnectError;
use crate::peer::PeerClient;
use futures::future::try_join_all;
use pulsar_proto::MAX_FRAME_LEN;
use pulsar_resilience::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Dispatch tuning, read from the `[dispatch]` section of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Timeout for establishing a TCP connection to a peer
    pub connect_timeout_ms: u64,
    /// Time allowed for a peer to answer one request
    pub request_timeout_ms: u64,
    /// Largest frame a peer client will send
    pub max_frame_len: usize,
    /// Paths per `submit_batch` call; larger partitions are split
    pub max_batch_paths: usize,
    /// Path bytes per `submit_batch` call; larger partitions are split
    pub max_batch_bytes: usize,
    /// Consecutive failures before a peer's circuit opens
    pub failure_threshold: usize,
    /// Seconds an open circuit waits before probing the peer again
    pub cooldown_secs: u64,
    #[serde(flatten)]
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            max_frame_len: MAX_FRAME_LEN,
            max_batch_paths: 10_000,
            max_batch_bytes: 8 * 1024 * 1024,
            failure_threshold: 5,
            cooldown_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: 1,
            cooldown: Duration::from_secs(self.cooldown_secs),
            retry: self.retry.clone(),
        }
    }
}

/// One configured peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// `host:port`
    pub address: String,
    /// Shared by every client talking to this peer
    pub breaker: CircuitBreaker,
}

/// The ordered peer set of a Star.
///
/// Order matters: partition `i` of every batch goes to peer `i`.
///
/// ```rust,no_run
/// use pulsar_connect::{DispatchConfig, PeerManager};
///
/// # async fn example() -> Result<(), pulsar_connect::ConnectError> {
/// let peers = PeerManager::new(
///     vec!["10.0.0.1:1234".to_string(), "10.0.0.2:1234".to_string()],
///     DispatchConfig::default(),
/// );
/// let clients = peers.connect_all().await?;
/// assert_eq!(clients.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PeerManager {
    peers: Vec<PeerRecord>,
    config: DispatchConfig,
}

impl PeerManager {
    pub fn new(addresses: Vec<String>, config: DispatchConfig) -> Self {
        let breaker_config = config.breaker_config();
        let peers = addresses
            .into_iter()
            .map(|address| PeerRecord {
                breaker: CircuitBreaker::new(address.clone(), breaker_config.clone()),
                address,
            })
            .collect();
        Self { peers, config }
    }

    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn addresses(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.address.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Opens a fresh connection to every peer, in configured order.
    ///
    /// Each connection attempt is retried per the dispatch policy; if any
    /// peer stays unreachable the whole call fails, so callers never work
    /// with a partial peer set.
    pub async fn connect_all(&self) -> Result<Vec<PeerClient>, ConnectError> {
        if self.peers.is_empty() {
            return Err(ConnectError::NoPeers);
        }

        let clients = try_join_all(self.peers.iter().map(|peer| self.connect_record(peer))).await?;
        info!(peers = clients.len(), "Connected to peer set");
        Ok(clients)
    }

    async fn connect_record(&self, peer: &PeerRecord) -> Result<PeerClient, ConnectError> {
        let client = PeerClient::new(
            peer.address.clone(),
            self.config.connect_timeout(),
            peer.breaker.clone(),
        )
        .with_request_timeout(self.config.request_timeout())
        .with_max_frame_len(self.config.max_frame_len);
        peer.breaker
            .execute(|| async {
                client
                    .ensure_connected()
                    .await
                    .map_err(ConnectError::into_resilience)
            })
            .await
            .map_err(|source| ConnectError::Dispatch {
                address: peer.address.clone(),
                source,
            })?;
        Ok(client)
    }
}
