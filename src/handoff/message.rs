//! Control-plane messages between workers and the Manager
//!
//! Two classes: ownership transfers (which carry the socket itself) and
//! small requests/queries. Protocol payload never travels here. Messages on
//! one channel arrive in send order; a request and its reply are correlated
//! by a `ReqId` chosen by the requester.

use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

use crate::connection::{ConnId, Peer};
use crate::error::ConnError;

use super::SocketTransfer;

/// Request identifier, unique per requesting endpoint.
pub type ReqId = u64;

/// Index of a worker within the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Messages a worker sends to the Manager.
#[derive(Debug)]
pub enum WorkerRequest {
    /// "Give me a connection to `peer`." The Manager re-homes an existing
    /// one, connects on the worker's behalf within `timeout`, or redirects.
    AcquireConnection {
        req_id: ReqId,
        peer: Peer,
        timeout: Duration,
    },
    /// "Who owns connection `id`?"
    QueryOwner { req_id: ReqId, id: ConnId },
    /// Answer to a `Surrender` instruction: the socket, or why not.
    SurrenderReply {
        req_id: ReqId,
        result: Result<SocketTransfer, ConnError>,
    },
    /// After a redirect the worker connected itself; the fleet index is
    /// updated only now that the handoff actually completed.
    RegisterOwnership {
        id: ConnId,
        correlation_id: Uuid,
        peer: Peer,
    },
    /// A locally owned connection was destroyed; keeps the fleet index
    /// accurate.
    ConnectionClosed { id: ConnId },
}

/// Messages the Manager sends to a worker.
#[derive(Debug)]
pub enum ManagerMessage {
    /// Fulfils an `AcquireConnection`: here is your connection.
    Deliver { req_id: ReqId, transfer: SocketTransfer },
    /// Fulfils an `AcquireConnection`: originate the connection yourself,
    /// trying `candidates` in order. Id and correlation id are assigned
    /// centrally so they stay fleet-unique.
    Redirect {
        req_id: ReqId,
        id: ConnId,
        correlation_id: Uuid,
        candidates: Vec<SocketAddr>,
        timeout: Duration,
    },
    /// Fulfils an `AcquireConnection` or `QueryOwner` with an error.
    Failed { req_id: ReqId, error: ConnError },
    /// Answer to `QueryOwner`.
    Owner {
        req_id: ReqId,
        owner: Option<WorkerId>,
    },
    /// Instructs the worker to give up connection `id` so it can be
    /// re-homed. The worker answers with `SurrenderReply`.
    Surrender { req_id: ReqId, id: ConnId },
    /// Pushes a freshly accepted inbound connection to the worker.
    TakeInbound { transfer: SocketTransfer },
}
