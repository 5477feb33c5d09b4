//! Integration tests for connect budgets and idle eviction

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;

use sigfleet::resolve::{DnsResolver, StaticResolver};
use sigfleet::{Config, ConnError, Fleet, Peer};

fn test_config(workers: usize) -> Config {
    let mut config = Config::default();
    config.fleet.workers = workers;
    config.listen.addrs = vec!["127.0.0.1:0".parse().unwrap()];
    config.timeouts.connect = Duration::from_secs(2);
    config.timeouts.resolve = Duration::from_secs(1);
    config.timeouts.shutdown = Duration::from_secs(5);
    config
}

#[tokio::test]
async fn connect_failure_reports_within_the_budget() {
    let config = test_config(1);
    let resolver = Arc::new(DnsResolver::new(config.timeouts.resolve));
    let mut fleet = Fleet::new(config, resolver);
    fleet.start().unwrap();
    let worker = fleet.worker(0).unwrap();

    // Non-routable test address: either the connect times out against the
    // budget or the network stack refuses it outright. It must not hang.
    let peer = Peer::tcp("10.255.255.1:5060".parse().unwrap());
    let start = Instant::now();
    let err = worker
        .acquire_with_timeout(peer, Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            ConnError::ConnectTimeout { .. } | ConnError::UnreachableDestination(_)
        ),
        "unexpected error: {err:?}"
    );
    assert!(start.elapsed() < Duration::from_secs(5));

    // Nothing leaked into the table.
    assert!(worker.snapshot().await.unwrap().is_empty());

    fleet.shutdown().await;
}

#[tokio::test]
async fn resolution_failure_surfaces_to_the_acquirer() {
    let config = test_config(1);
    // Empty static table: every destination is unknown.
    let resolver = Arc::new(StaticResolver::new());
    let mut fleet = Fleet::new(config, resolver);
    fleet.start().unwrap();
    let worker = fleet.worker(0).unwrap();

    let peer = Peer::tcp("192.0.2.7:5060".parse().unwrap());
    let err = worker.acquire_for_destination(peer).await.unwrap_err();
    assert!(matches!(err, ConnError::ResolutionFailed(_)));

    fleet.shutdown().await;
}

#[tokio::test]
async fn idle_connections_are_evicted_but_referenced_ones_survive() {
    let mut config = test_config(1);
    config.timeouts.eviction_interval = Duration::from_millis(100);
    config.timeouts.idle = Duration::from_millis(100);
    let resolver = Arc::new(DnsResolver::new(config.timeouts.resolve));
    let mut fleet = Fleet::new(config, resolver);
    fleet.start().unwrap();
    let worker = fleet.worker(0).unwrap();

    // Two destinations so the held connection cannot mask the released one.
    let mut addrs = Vec::new();
    for _ in 0..2 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        addrs.push(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
    }

    let released = worker
        .acquire_for_destination(Peer::tcp(addrs[0]))
        .await
        .unwrap();
    worker.release(released, false).await.unwrap();

    let held = worker
        .acquire_for_destination(Peer::tcp(addrs[1]))
        .await
        .unwrap();
    assert_ne!(released, held);

    // Several eviction windows later the unreferenced connection is gone
    // and the referenced one is untouched.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let snapshots = worker.snapshot().await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].id, held);
    assert_eq!(snapshots[0].refcount, 1);

    worker.release(held, false).await.unwrap();
    fleet.shutdown().await;
}
