//! Socket ownership transfer object
//!
//! The one place socket ownership crosses a unit boundary. The transfer is
//! a plain move: once a `SocketTransfer` is sent down a handoff channel the
//! sender has nothing left to misuse, and `into_record` consumes it on the
//! receiving side. Exactly-once by construction.

use bytes::Bytes;
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::connection::{ConnId, ConnRecord, ConnState, Peer};

/// One open socket plus the record metadata it travels with.
///
/// Deliberately not `Clone`.
#[derive(Debug)]
pub struct SocketTransfer {
    id: ConnId,
    correlation_id: Uuid,
    peer: Peer,
    state: ConnState,
    stream: TcpStream,
    pending: Vec<Bytes>,
}

impl SocketTransfer {
    pub(crate) fn new(
        id: ConnId,
        correlation_id: Uuid,
        peer: Peer,
        state: ConnState,
        stream: TcpStream,
        pending: Vec<Bytes>,
    ) -> Self {
        Self {
            id,
            correlation_id,
            peer,
            state,
            stream,
            pending,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Reconstitute the record on the receiving side, carrying over any
    /// writes the sender had queued but not flushed.
    pub fn into_record(self) -> ConnRecord {
        ConnRecord::from_transfer(
            self.id,
            self.correlation_id,
            self.peer,
            self.state,
            self.stream,
            self.pending,
        )
    }
}
