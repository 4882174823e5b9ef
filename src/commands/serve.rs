/*!
 * `pulsar serve`: run a Star until Ctrl-C
 */

use pulsar_connect::PeerManager;
use pulsar_star::{StarImpl, StarServer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PulsarConfig;
use crate::error::Result;

/// Binds, serves and returns once `shutdown` fires or Ctrl-C is received.
///
/// Before returning, running jobs are cancelled and the drain loop finishes
/// the batch it is copying.
pub async fn run_star(config: &PulsarConfig, shutdown: CancellationToken) -> Result<()> {
    let address = config.server.listen_address();
    let server = StarServer::bind(&address).await?;
    let origin = server.local_addr()?.to_string();

    info!("Pulsar Star v{}", env!("CARGO_PKG_VERSION"));
    info!(
        peers = config.client.servers.len(),
        copy_concurrency = config.server.copy_concurrency,
        dry_run = config.server.dry_run,
        "Peer set: {}",
        config.client.servers.join(", ")
    );
    if !config.client.servers.iter().any(|s| s.ends_with(&format!(":{}", config.server.port))) {
        warn!(port = config.server.port, "No configured peer uses this Star's port; it will not receive batches");
    }

    let peers = PeerManager::new(config.client.servers.clone(), config.dispatch.clone());
    let star = StarImpl::new(
        origin,
        config.server.clone(),
        peers,
        config.server.copier(),
        shutdown.clone(),
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C; stop the Star another way"),
        }
    });

    let served = server.serve(star.clone(), shutdown).await;
    star.shutdown().await;
    served?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_star_returns_after_shutdown() {
        crate::logging::init_test_logging();
        let mut config = PulsarConfig::from_toml("[client]\nservers = [\"127.0.0.1:1\"]\n").unwrap();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = 0;

        let shutdown = CancellationToken::new();
        let running = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { run_star(&config, shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("run_star should return once shut down")
            .unwrap();
        assert!(result.is_ok());
    }
}
