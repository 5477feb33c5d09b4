//! Read-only introspection over live connections
//!
//! Snapshots are plain copies taken without holding any lock across I/O;
//! operational tooling and protocol-layer helpers consume them without being
//! able to touch connection state.

use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

use crate::connection::{ConnId, ConnRecord, ConnState, Peer};
use crate::handoff::WorkerId;

/// Point-in-time view of one live connection.
#[derive(Debug, Clone)]
pub struct ConnSnapshot {
    pub id: ConnId,
    pub correlation_id: Uuid,
    pub peer: Peer,
    pub local_addr: Option<SocketAddr>,
    pub state: ConnState,
    pub refcount: u32,
    pub age: Duration,
    /// Worker currently holding the socket, filled in by fleet-level
    /// aggregation.
    pub owner: Option<WorkerId>,
}

impl ConnSnapshot {
    pub(crate) fn of(record: &ConnRecord) -> Self {
        Self {
            id: record.id(),
            correlation_id: record.correlation_id(),
            peer: record.peer(),
            local_addr: record.local_addr(),
            state: record.state(),
            refcount: record.refcount(),
            age: record.age(),
            owner: None,
        }
    }
}

/// Format a connection's local bind address for use in protocol logic, e.g.
/// when a signaling message must advertise the socket it was sent from.
/// Returns `None` when the local address is not known (connect still in
/// flight, or the socket was handed off).
pub fn format_local_addr(snapshot: &ConnSnapshot, with_port: bool) -> Option<String> {
    let addr = snapshot.local_addr?;
    if with_port {
        Some(addr.to_string())
    } else {
        Some(addr.ip().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Transport;

    fn snapshot(local: Option<SocketAddr>) -> ConnSnapshot {
        ConnSnapshot {
            id: ConnId(3),
            correlation_id: Uuid::new_v4(),
            peer: Peer::tcp("10.0.0.5:5060".parse().unwrap()),
            local_addr: local,
            state: ConnState::Established,
            refcount: 0,
            age: Duration::from_secs(1),
            owner: None,
        }
    }

    #[test]
    fn formats_address_with_and_without_port() {
        let snap = snapshot(Some("192.168.1.10:45060".parse().unwrap()));
        assert_eq!(
            format_local_addr(&snap, true).as_deref(),
            Some("192.168.1.10:45060")
        );
        assert_eq!(
            format_local_addr(&snap, false).as_deref(),
            Some("192.168.1.10")
        );
        assert_eq!(snap.peer.proto, Transport::Tcp);
    }

    #[test]
    fn unknown_local_addr_formats_as_none() {
        let snap = snapshot(None);
        assert!(format_local_addr(&snap, true).is_none());
    }
}
