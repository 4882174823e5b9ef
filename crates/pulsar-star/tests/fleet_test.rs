//! End-to-end tests for a fleet of Stars
//!
//! Every Star runs in-process on an ephemeral port with a real copier, so a
//! job's files end up in a scratch destination tree.
//!
//! # Test Topology
//!
//! ```text
//! client ──submit_job──► Star 0 ──submit_batch──► Star 0, Star 1, ...
//! ```

use futures::{SinkExt, StreamExt};
use pulsar_connect::{DispatchConfig, PeerClient, PeerManager};
use pulsar_proto::{parse_job_reply, JobReport, Request, Response, ServerCodec, BATCH_ACK};
use pulsar_resilience::RetryPolicy;
use pulsar_star::{LocalCopier, StarConfig, StarImpl, StarServer};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

struct Fleet {
    addresses: Vec<String>,
    stars: Vec<Arc<StarImpl>>,
    shutdown: CancellationToken,
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn fast_dispatch() -> DispatchConfig {
    DispatchConfig {
        connect_timeout_ms: 500,
        retry: RetryPolicy {
            max_retries: 1,
            initial_backoff_ms: 5,
            max_backoff_ms: 10,
            backoff_multiplier: 2.0,
        },
        ..Default::default()
    }
}

/// Starts `count` Stars. Each one uses `extra_peers` after the fleet itself.
async fn start_fleet(count: usize, extra_peers: &[String]) -> Fleet {
    start_fleet_with(count, extra_peers, fast_dispatch()).await
}

async fn start_fleet_with(
    count: usize,
    extra_peers: &[String],
    dispatch: DispatchConfig,
) -> Fleet {
    let shutdown = CancellationToken::new();
    let mut servers = Vec::new();
    let mut addresses = Vec::new();
    for _ in 0..count {
        let server = StarServer::bind("127.0.0.1:0").await.unwrap();
        addresses.push(server.local_addr().unwrap().to_string());
        servers.push(server);
    }

    let mut peers = addresses.clone();
    peers.extend_from_slice(extra_peers);

    let mut stars = Vec::new();
    for (server, origin) in servers.into_iter().zip(&addresses) {
        let star = StarImpl::new(
            origin.clone(),
            StarConfig {
                walk_channel_capacity: 4,
                copy_concurrency: 2,
                ..Default::default()
            },
            PeerManager::new(peers.clone(), dispatch.clone()),
            Arc::new(LocalCopier),
            shutdown.clone(),
        );
        stars.push(star.clone());
        tokio::spawn(server.serve(star, shutdown.clone()));
    }

    Fleet {
        addresses,
        stars,
        shutdown,
    }
}

async fn client(address: &str) -> PeerClient {
    PeerClient::connect(address, Duration::from_secs(1)).await.unwrap()
}

/// Polls a job until it reaches a terminal state.
async fn wait_terminal(client: &PeerClient, job_id: u64) -> JobReport {
    for _ in 0..300 {
        let report = client.job_status(job_id).await.unwrap();
        if matches!(report.state.as_str(), "completed" | "failed" | "cancelled") {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not finish");
}

/// Waits until the fleet has drained `batches` batches in total.
async fn wait_drained(fleet: &Fleet, batches: u64) {
    for _ in 0..300 {
        let drained: u64 = fleet.stars.iter().map(|s| s.ingest().stats().batches).sum();
        if drained >= batches {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("fleet did not drain {batches} batches");
}

/// Waits until the fleet has copied `files` files in total.
async fn wait_copied(fleet: &Fleet, files: u64) {
    for _ in 0..300 {
        let copied: u64 = fleet
            .stars
            .iter()
            .map(|s| s.ingest().stats().files_copied)
            .sum();
        if copied >= files {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("fleet did not copy {files} files");
}

fn write(path: &Path, len: usize) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, vec![b'p'; len]).unwrap();
}

/// A peer that acknowledges `acks` batches, then hangs up and stops listening.
///
/// Returns its address and the number of batches it acknowledged.
async fn start_failing_peer(acks: usize) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let acked = Arc::new(AtomicUsize::new(0));
    let gone = CancellationToken::new();

    let counter = acked.clone();
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                biased;
                _ = gone.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(_) => break,
                },
            };
            let (acked, gone) = (counter.clone(), gone.clone());
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, ServerCodec::new());
                while let Some(Ok(request)) = framed.next().await {
                    assert!(matches!(request, Request::SubmitBatch { .. }));
                    if gone.is_cancelled() || acked.load(Ordering::SeqCst) >= acks {
                        gone.cancel();
                        return;
                    }
                    acked.fetch_add(1, Ordering::SeqCst);
                    let ack = Response::Ack {
                        reply: BATCH_ACK.into(),
                    };
                    if framed.send(ack).await.is_err() {
                        return;
                    }
                }
            });
        }
        // Dropping the listener refuses every later connection
    });

    (address, acked)
}

async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_star_tree_copy() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    write(&src.path().join("a"), 10);
    write(&src.path().join("b"), 20);
    write(&src.path().join("sub/c"), 5);

    let fleet = start_fleet(2, &[]).await;
    let origin = client(&fleet.addresses[0]).await;

    let reply = origin
        .submit_job(
            "alice",
            src.path().to_str().unwrap(),
            dst.path().to_str().unwrap(),
        )
        .await
        .unwrap();
    let job_id = parse_job_reply(&reply).unwrap();
    assert_eq!(job_id, 1);

    let report = wait_terminal(&origin, job_id).await;
    assert_eq!(report.state, "completed");
    assert_eq!(report.bytes_done, 35);
    assert_eq!(report.files_done, 3);
    assert_eq!(report.total_files, Some(3));
    assert!(report.started_at.is_some());
    assert!(report.finished_at.is_some());

    wait_drained(&fleet, 3).await;

    // Root batch is split across both Stars, the subdirectory's single file
    // goes to the first one
    let batches: Vec<u64> = fleet
        .stars
        .iter()
        .map(|s| s.ingest().stats().batches)
        .collect();
    assert_eq!(batches, vec![2, 1]);

    assert_eq!(std::fs::read(dst.path().join("a")).unwrap().len(), 10);
    assert_eq!(std::fs::read(dst.path().join("b")).unwrap().len(), 20);
    assert_eq!(std::fs::read(dst.path().join("sub/c")).unwrap().len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_file_copied_exactly_once() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    let mut expected = 0u64;
    for d in 0..5 {
        for f in 0..(d * 3 + 1) {
            write(&src.path().join(format!("d{d}/nested/f{f}")), f + 1);
            expected += 1;
        }
        write(&src.path().join(format!("top{d}")), 3);
        expected += 1;
    }

    let fleet = start_fleet(3, &[]).await;
    let origin = client(&fleet.addresses[1]).await;
    let reply = origin
        .submit_job("bob", src.path().to_str().unwrap(), dst.path().to_str().unwrap())
        .await
        .unwrap();
    let report = wait_terminal(&origin, parse_job_reply(&reply).unwrap()).await;
    assert_eq!(report.state, "completed");
    assert_eq!(report.files_done, expected);

    wait_copied(&fleet, expected).await;
    let failed: u64 = fleet
        .stars
        .iter()
        .map(|s| s.ingest().stats().files_failed)
        .sum();
    assert_eq!(failed, 0);
    let copied: u64 = fleet
        .stars
        .iter()
        .map(|s| s.ingest().stats().files_copied)
        .sum();
    assert_eq!(copied, expected);
    assert_eq!(std::fs::read(dst.path().join("d4/nested/f12")).unwrap().len(), 13);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_source_is_rejected() {
    let fleet = start_fleet(1, &[]).await;
    let origin = client(&fleet.addresses[0]).await;

    let reply = origin
        .submit_job("carol", "/definitely/not/a/dir", "/tmp/out")
        .await
        .unwrap();
    assert!(reply.starts_with("Error:"), "{reply}");
    assert!(fleet.stars[0].registry().is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_peer_fails_only_its_job() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    write(&src.path().join("a"), 4);
    write(&src.path().join("b"), 4);

    let dead = dead_address().await;
    let broken = start_fleet(1, &[dead]).await;
    let healthy = start_fleet(1, &[]).await;
    let broken_client = client(&broken.addresses[0]).await;
    let healthy_client = client(&healthy.addresses[0]).await;

    let (src_str, dst_str) = (src.path().to_str().unwrap(), dst.path().to_str().unwrap());
    let (bad, good) = tokio::join!(
        broken_client.submit_job("u", src_str, dst_str),
        healthy_client.submit_job("u", src_str, dst_str),
    );

    let bad = wait_terminal(&broken_client, parse_job_reply(&bad.unwrap()).unwrap()).await;
    assert_eq!(bad.state, "failed");
    assert!(bad.error.is_some());
    assert_eq!(bad.files_done, 0);

    let good = wait_terminal(&healthy_client, parse_job_reply(&good.unwrap()).unwrap()).await;
    assert_eq!(good.state, "completed");
    assert_eq!(good.bytes_done, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_stalled_job() {
    // A peer that accepts connections and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stalled = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let src = tempdir().unwrap();
    write(&src.path().join("a"), 1);

    let shutdown = CancellationToken::new();
    let star = StarServer::bind("127.0.0.1:0").await.unwrap();
    let address = star.local_addr().unwrap().to_string();
    let star_impl = StarImpl::new(
        address.clone(),
        StarConfig::default(),
        PeerManager::new(vec![stalled], fast_dispatch()),
        Arc::new(LocalCopier),
        shutdown.clone(),
    );
    tokio::spawn(star.serve(star_impl, shutdown.clone()));

    let origin = client(&address).await;
    let reply = origin
        .submit_job("dave", src.path().to_str().unwrap(), "/tmp/never")
        .await
        .unwrap();
    let job_id = parse_job_reply(&reply).unwrap();

    // Running once the first file is seen; the batch is then stuck in dispatch
    for _ in 0..300 {
        if origin.job_status(job_id).await.unwrap().state == "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(origin.cancel_job(job_id).await.unwrap(), format!("Job {job_id} cancelled"));
    let report = origin.job_status(job_id).await.unwrap();
    assert_eq!(report.state, "cancelled");
    assert!(report.finished_at.is_some());

    // Cancelling again reports the settled state
    assert_eq!(
        origin.cancel_job(job_id).await.unwrap(),
        format!("Job {job_id} cancelled")
    );
    assert!(origin.cancel_job(999).await.is_err());
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peer_lost_mid_job_stops_dispatch() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    // Ten directories of two files each; the root holds none
    for d in 0..10 {
        write(&src.path().join(format!("d{d}/f0")), 1);
        write(&src.path().join(format!("d{d}/f1")), 1);
    }

    let (failing, acked) = start_failing_peer(2).await;
    let fleet = start_fleet(1, &[failing]).await;
    let origin = client(&fleet.addresses[0]).await;

    let reply = origin
        .submit_job(
            "erin",
            src.path().to_str().unwrap(),
            dst.path().to_str().unwrap(),
        )
        .await
        .unwrap();
    let report = wait_terminal(&origin, parse_job_reply(&reply).unwrap()).await;

    assert_eq!(report.state, "failed");
    assert!(report.error.is_some());
    // Two acknowledged directories plus the one whose dispatch failed
    assert_eq!(report.files_done, 6);
    assert!(report.total_files.is_none());
    assert_eq!(acked.load(Ordering::SeqCst), 2);

    // The healthy peer got at most its share of those three directories, and
    // nothing arrives afterwards
    let healthy = &fleet.stars[0];
    tokio::time::sleep(Duration::from_millis(100)).await;
    let received = healthy.ingest().stats().batches + healthy.ingest().len().await as u64;
    assert!((2..=3).contains(&received), "received {received}");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let later = healthy.ingest().stats().batches + healthy.ingest().len().await as u64;
    assert_eq!(later, received);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_partitions_are_split_per_peer() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    for f in 0..7 {
        write(&src.path().join(format!("f{f}")), f + 1);
    }

    let dispatch = DispatchConfig {
        max_batch_paths: 2,
        ..fast_dispatch()
    };
    let fleet = start_fleet_with(2, &[], dispatch).await;
    let origin = client(&fleet.addresses[0]).await;

    let reply = origin
        .submit_job(
            "frank",
            src.path().to_str().unwrap(),
            dst.path().to_str().unwrap(),
        )
        .await
        .unwrap();
    let report = wait_terminal(&origin, parse_job_reply(&reply).unwrap()).await;
    assert_eq!(report.state, "completed");
    assert_eq!(report.files_done, 7);

    // Four paths for the first Star, three for the second, two per call
    wait_drained(&fleet, 4).await;
    let batches: Vec<u64> = fleet
        .stars
        .iter()
        .map(|s| s.ingest().stats().batches)
        .collect();
    assert_eq!(batches, vec![2, 2]);

    wait_copied(&fleet, 7).await;
    for f in 0..7 {
        let copied = std::fs::read(dst.path().join(format!("f{f}"))).unwrap();
        assert_eq!(copied.len(), f + 1);
    }
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_utf8_name_is_skipped_not_counted() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    write(&src.path().join("good"), 4);
    std::fs::write(src.path().join(OsStr::from_bytes(b"bad\xffname")), [0u8; 10]).unwrap();

    let fleet = start_fleet(1, &[]).await;
    let origin = client(&fleet.addresses[0]).await;
    let reply = origin
        .submit_job(
            "gina",
            src.path().to_str().unwrap(),
            dst.path().to_str().unwrap(),
        )
        .await
        .unwrap();
    let report = wait_terminal(&origin, parse_job_reply(&reply).unwrap()).await;

    assert_eq!(report.state, "completed");
    assert_eq!(report.files_done, 1);
    assert_eq!(report.bytes_done, 4);
    assert_eq!(report.files_skipped, 1);

    wait_copied(&fleet, 1).await;
    assert_eq!(fleet.stars[0].ingest().stats().files_failed, 0);
    assert_eq!(std::fs::read(dst.path().join("good")).unwrap().len(), 4);
}
