//! Integration tests for fleet startup, connection acquisition, and handoff

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use sigfleet::resolve::DnsResolver;
use sigfleet::{Config, Fleet, Peer};

fn test_config(workers: usize) -> Config {
    let mut config = Config::default();
    config.fleet.workers = workers;
    config.listen.addrs = vec!["127.0.0.1:0".parse().unwrap()];
    config.timeouts.connect = Duration::from_secs(2);
    config.timeouts.resolve = Duration::from_secs(1);
    config.timeouts.shutdown = Duration::from_secs(5);
    config
}

fn start_fleet(config: Config) -> Fleet {
    let resolver = Arc::new(DnsResolver::new(config.timeouts.resolve));
    let mut fleet = Fleet::new(config, resolver);
    fleet.start().unwrap();
    fleet
}

/// Accepts one connection and reports everything read from it, as one
/// contiguous byte string, once `expected` bytes have arrived. The accepted
/// stream is held open for the lifetime of the task so the connection under
/// test never sees an EOF.
async fn start_sink(expected: usize) -> (std::net::SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut collected = Vec::with_capacity(expected);
        let mut buf = [0u8; 1024];
        let mut report = Some(tx);
        loop {
            if collected.len() >= expected {
                if let Some(tx) = report.take() {
                    let _ = tx.send(collected.clone());
                }
            }
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
            }
        }
    });
    (addr, rx)
}

#[tokio::test]
async fn acquire_send_and_wire_order() {
    let fleet = start_fleet(test_config(2));
    let (addr, received) = start_sink(22).await;
    let peer = Peer::tcp(addr);
    let worker = fleet.worker(0).unwrap();

    let id = worker.acquire_for_destination(peer).await.unwrap();
    worker.send(id, "first message ".into()).await.unwrap();
    worker.send(id, "second".into()).await.unwrap();
    worker.send(id, " !".into()).await.unwrap();

    let bytes = received.await.unwrap();
    assert_eq!(&bytes[..22], b"first message second !");

    worker.release(id, false).await.unwrap();
    fleet.shutdown().await;
}

#[tokio::test]
async fn same_worker_reuses_its_connection() {
    let fleet = start_fleet(test_config(2));
    let (addr, _received) = start_sink(0).await;
    let peer = Peer::tcp(addr);
    let worker = fleet.worker(0).unwrap();

    let first = worker.acquire_for_destination(peer).await.unwrap();
    let second = worker.acquire_for_destination(peer).await.unwrap();
    assert_eq!(first, second);

    worker.release(first, false).await.unwrap();
    worker.release(second, false).await.unwrap();

    // Released but still live: the next acquire is a local hit too.
    let third = worker.acquire_for_destination(peer).await.unwrap();
    assert_eq!(first, third);

    fleet.shutdown().await;
}

#[tokio::test]
async fn released_connection_rehomes_to_requesting_worker() {
    let fleet = start_fleet(test_config(2));
    let (addr, _received) = start_sink(0).await;
    let peer = Peer::tcp(addr);
    let a = fleet.worker(0).unwrap();
    let b = fleet.worker(1).unwrap();

    let id = a.acquire_for_destination(peer).await.unwrap();
    a.release(id, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // B asks for the same destination; the fleet moves A's connection
    // instead of opening a second one.
    let rehomed = b.acquire_for_destination(peer).await.unwrap();
    assert_eq!(rehomed, id);

    assert_eq!(b.query_owner(id).await.unwrap(), Some(b.id()));
    assert!(a.snapshot().await.unwrap().is_empty());

    b.release(id, false).await.unwrap();
    fleet.shutdown().await;
}

#[tokio::test]
async fn referenced_connection_refuses_rehoming_and_a_second_is_opened() {
    let fleet = start_fleet(test_config(2));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            held.push(stream);
        }
    });
    let peer = Peer::tcp(addr);
    let a = fleet.worker(0).unwrap();
    let b = fleet.worker(1).unwrap();

    // A holds its reference, so the surrender is refused and B gets a
    // fresh connection to the same destination.
    let held = a.acquire_for_destination(peer).await.unwrap();
    let fresh = b.acquire_for_destination(peer).await.unwrap();
    assert_ne!(held, fresh);

    // A's connection survived the refused surrender.
    let snaps = a.snapshot().await.unwrap();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].id, held);
    assert_eq!(snaps[0].refcount, 1);

    a.release(held, false).await.unwrap();
    b.release(fresh, false).await.unwrap();
    fleet.shutdown().await;
}

#[tokio::test]
async fn inbound_connections_are_distributed_across_workers() {
    let mut fleet = start_fleet(test_config(2));
    let bound = fleet.start_listeners().await.unwrap();
    assert_eq!(bound.len(), 1);

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(TcpStream::connect(bound[0]).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshots = fleet.list_connections().await;
    assert_eq!(snapshots.len(), 4);
    let owners: std::collections::HashSet<_> =
        snapshots.iter().map(|s| s.owner.unwrap()).collect();
    assert_eq!(owners.len(), 2, "round robin should use both workers");

    // Inbound payloads surface on the collaborator stream with the id of
    // the connection they arrived on.
    use tokio::io::AsyncWriteExt;
    let mut inbound = fleet.take_inbound().unwrap();
    clients[0].write_all(b"REGISTER").await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&msg.bytes[..], b"REGISTER");
    assert!(snapshots.iter().any(|s| s.id == msg.conn));

    fleet.shutdown().await;
}

#[tokio::test]
async fn send_on_unknown_connection_is_an_invalid_state_error() {
    let fleet = start_fleet(test_config(1));
    let (addr, _received) = start_sink(0).await;
    let worker = fleet.worker(0).unwrap();

    let id = worker
        .acquire_for_destination(Peer::tcp(addr))
        .await
        .unwrap();
    worker.release(id, false).await.unwrap();
    worker.destroy(id).await.unwrap();

    let err = worker.send(id, "late".into()).await.unwrap_err();
    assert!(matches!(err, sigfleet::ConnError::InvalidState { .. }));

    fleet.shutdown().await;
}

#[tokio::test]
async fn destroy_refuses_while_another_acquirer_holds_the_connection() {
    let fleet = start_fleet(test_config(1));
    let (addr, _received) = start_sink(0).await;
    let peer = Peer::tcp(addr);
    let worker = fleet.worker(0).unwrap();

    let id = worker.acquire_for_destination(peer).await.unwrap();
    let again = worker.acquire_for_destination(peer).await.unwrap();
    assert_eq!(id, again);

    let err = worker.destroy(id).await.unwrap_err();
    assert_eq!(err, sigfleet::ConnError::StillReferenced(id));

    worker.release(id, false).await.unwrap();
    worker.destroy(id).await.unwrap();

    fleet.shutdown().await;
}
