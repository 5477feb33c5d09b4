//! Dedicated connect path
//!
//! Outbound connects are isolated in their own task so an unreachable
//! destination never stalls the Manager's broker loop. Each job gets its
//! own spawned attempt; outcomes flow back over a channel and carry the
//! job so the broker can correlate them without bookkeeping of its own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::connection::Peer;
use crate::error::ConnError;
use crate::handoff::{ReqId, WorkerId};
use crate::resolve::Resolver;

/// What to do with the resolved candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    /// Connect here and hand the socket back for delivery.
    Connect,
    /// Resolve only; the requesting worker originates the connect itself.
    Resolve,
}

/// One outstanding acquire that needs resolution and possibly a connect.
#[derive(Debug)]
pub(crate) struct ConnectJob {
    pub req_id: ReqId,
    pub requester: WorkerId,
    pub peer: Peer,
    pub timeout: Duration,
    pub kind: JobKind,
}

#[derive(Debug)]
pub(crate) enum ConnectOutcome {
    Connected {
        job: ConnectJob,
        stream: TcpStream,
        addr: SocketAddr,
    },
    Resolved {
        job: ConnectJob,
        candidates: Vec<SocketAddr>,
    },
    Failed {
        job: ConnectJob,
        error: ConnError,
    },
}

/// Runs connect jobs off the broker loop's critical path.
pub(crate) struct Connector {
    jobs: mpsc::Receiver<ConnectJob>,
    outcomes: mpsc::Sender<ConnectOutcome>,
    resolver: Arc<dyn Resolver>,
}

impl Connector {
    pub(crate) fn new(
        jobs: mpsc::Receiver<ConnectJob>,
        outcomes: mpsc::Sender<ConnectOutcome>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            jobs,
            outcomes,
            resolver,
        }
    }

    /// Accept jobs until the Manager drops the sending half. Jobs run
    /// concurrently; a stuck connect holds up nothing but itself.
    pub(crate) async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            let resolver = Arc::clone(&self.resolver);
            let outcomes = self.outcomes.clone();
            tokio::spawn(async move {
                let outcome = perform(job, resolver).await;
                // Broker gone means shutdown; the socket just drops.
                let _ = outcomes.send(outcome).await;
            });
        }
        debug!("connector draining; no more jobs");
    }
}

async fn perform(job: ConnectJob, resolver: Arc<dyn Resolver>) -> ConnectOutcome {
    let host = job.peer.addr.ip().to_string();
    let candidates = match resolver
        .resolve(&host, job.peer.addr.port(), job.peer.proto)
        .await
    {
        Ok(candidates) => candidates,
        Err(error) => return ConnectOutcome::Failed { job, error },
    };
    match job.kind {
        JobKind::Resolve => ConnectOutcome::Resolved { job, candidates },
        JobKind::Connect => match connect_candidates(&candidates, job.timeout).await {
            Ok((stream, addr)) => ConnectOutcome::Connected { job, stream, addr },
            Err(error) => ConnectOutcome::Failed { job, error },
        },
    }
}

/// Try each candidate address in order under one shared deadline. The
/// budget covers the whole list: a timeout mid-list fails the acquire
/// rather than starting over on the next candidate.
pub(crate) async fn connect_candidates(
    candidates: &[SocketAddr],
    budget: Duration,
) -> Result<(TcpStream, SocketAddr), ConnError> {
    let peer = match candidates.first() {
        Some(addr) => Peer::tcp(*addr),
        None => return Err(ConnError::ResolutionFailed("empty candidate list".into())),
    };
    let deadline = Instant::now() + budget;
    for &addr in candidates {
        match timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!(%addr, "outbound connect succeeded");
                return Ok((stream, addr));
            }
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "connect candidate failed");
            }
            Err(_) => {
                warn!(%addr, ?budget, "connect budget exhausted");
                return Err(ConnError::ConnectTimeout {
                    peer,
                    timeout: budget,
                });
            }
        }
    }
    Err(ConnError::UnreachableDestination(peer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_candidate_list_is_a_resolution_failure() {
        let err = connect_candidates(&[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnError::ResolutionFailed(_)));
    }

    #[tokio::test]
    async fn falls_through_to_a_reachable_candidate() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good = listener.local_addr().unwrap();
        // A bound-then-dropped port refuses quickly.
        let dead = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let (_, addr) = connect_candidates(&[dead, good], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(addr, good);
    }

    #[tokio::test]
    async fn exhausted_candidates_report_unreachable() {
        let dead = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let err = connect_candidates(&[dead], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, ConnError::UnreachableDestination(Peer::tcp(dead)));
    }
}
