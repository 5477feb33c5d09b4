//! Collaborator-facing surface of a worker
//!
//! The protocol layer never touches sockets or tables directly; it drives a
//! worker through this handle. Commands are serviced by the worker's event
//! loop in arrival order, which is what gives two `send` calls on the same
//! connection their FIFO wire order.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::connection::{ConnId, Peer};
use crate::error::ConnError;
use crate::handoff::WorkerId;
use crate::introspect::ConnSnapshot;

/// Payload handed to the protocol-layer collaborator on read-ready events.
#[derive(Debug)]
pub struct Inbound {
    pub conn: ConnId,
    pub bytes: Bytes,
}

/// Counters a worker keeps about its own traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStats {
    pub bytes_in: u64,
    pub reuse_hits: u64,
    pub manager_requests: u64,
    pub handoffs_in: u64,
    pub handoffs_out: u64,
    pub evicted: u64,
}

#[derive(Debug)]
pub(crate) enum Command {
    Acquire {
        peer: Peer,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<ConnId, ConnError>>,
    },
    Send {
        id: ConnId,
        bytes: Bytes,
        reply: oneshot::Sender<Result<(), ConnError>>,
    },
    Release {
        id: ConnId,
        has_pending_writes: bool,
    },
    Destroy {
        id: ConnId,
        reply: oneshot::Sender<Result<(), ConnError>>,
    },
    QueryOwner {
        id: ConnId,
        reply: oneshot::Sender<Result<Option<WorkerId>, ConnError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<ConnSnapshot>>,
    },
    Stats {
        reply: oneshot::Sender<WorkerStats>,
    },
}

/// Cloneable handle to one worker's event loop.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    tx: mpsc::Sender<Command>,
}

impl WorkerHandle {
    pub(crate) fn new(id: WorkerId, tx: mpsc::Sender<Command>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    async fn dispatch<T>(
        &self,
        cmd: Command,
        rx: oneshot::Receiver<Result<T, ConnError>>,
    ) -> Result<T, ConnError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| ConnError::HandoffFailed(format!("{} is gone", self.id)))?;
        rx.await
            .map_err(|_| ConnError::HandoffFailed(format!("{} dropped the request", self.id)))?
    }

    /// Reuse a locally owned connection to `peer` or have one created or
    /// re-homed on demand. Returns with the connection acquired: the caller
    /// holds one reference until it calls [`release`](Self::release).
    ///
    /// A local cache hit returns immediately; a miss suspends the calling
    /// task for one request/reply round trip with the Manager.
    pub async fn acquire_for_destination(&self, peer: Peer) -> Result<ConnId, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            Command::Acquire {
                peer,
                timeout: None,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Like [`acquire_for_destination`](Self::acquire_for_destination) with
    /// an explicit connect budget instead of the configured default.
    pub async fn acquire_with_timeout(
        &self,
        peer: Peer,
        timeout: Duration,
    ) -> Result<ConnId, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            Command::Acquire {
                peer,
                timeout: Some(timeout),
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Queue `bytes` for transmission. Never blocks on socket I/O: whatever
    /// the socket buffer cannot absorb right now is queued and flushed on
    /// the next writable event, in submission order.
    pub async fn send(&self, id: ConnId, bytes: Bytes) -> Result<(), ConnError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            Command::Send {
                id,
                bytes,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Drop one acquirer reference. `has_pending_writes` marks the
    /// connection as active so idle eviction does not tear it down merely
    /// because the caller stopped referencing it mid-write.
    pub async fn release(&self, id: ConnId, has_pending_writes: bool) -> Result<(), ConnError> {
        self.tx
            .send(Command::Release {
                id,
                has_pending_writes,
            })
            .await
            .map_err(|_| ConnError::HandoffFailed(format!("{} is gone", self.id)))
    }

    /// Forced teardown, bypassing normal refcount draining. Used on
    /// protocol-layer fatal errors. Fails with `StillReferenced` when other
    /// acquirers remain; this layer never forces them out.
    pub async fn destroy(&self, id: ConnId) -> Result<(), ConnError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::Destroy { id, reply: tx }, rx).await
    }

    /// Ask the Manager which worker currently owns connection `id`.
    pub async fn query_owner(&self, id: ConnId) -> Result<Option<WorkerId>, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::QueryOwner { id, reply: tx }, rx).await
    }

    /// Point-in-time view of every connection this worker owns.
    pub async fn snapshot(&self) -> Result<Vec<ConnSnapshot>, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply: tx })
            .await
            .map_err(|_| ConnError::HandoffFailed(format!("{} is gone", self.id)))?;
        rx.await
            .map_err(|_| ConnError::HandoffFailed(format!("{} dropped the request", self.id)))
    }

    pub async fn stats(&self) -> Result<WorkerStats, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Stats { reply: tx })
            .await
            .map_err(|_| ConnError::HandoffFailed(format!("{} is gone", self.id)))?;
        rx.await
            .map_err(|_| ConnError::HandoffFailed(format!("{} dropped the request", self.id)))
    }
}
