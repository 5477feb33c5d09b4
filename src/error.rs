//! Typed errors for the connection layer
//!
//! Local, recoverable conditions (a write that would block, an empty read)
//! are handled inside the layer and never surface here. Everything a
//! collaborator can observe is one of these kinds.

use std::time::Duration;

use crate::connection::{ConnId, ConnState, Peer};

/// Errors surfaced by the connection-management layer.
///
/// The layer never retries on its own; retry policy belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnError {
    /// The resolution collaborator could not produce any candidate address.
    #[error("destination resolution failed: {0}")]
    ResolutionFailed(String),

    /// The blocking connect did not complete within the caller's budget.
    #[error("connect to {peer} timed out after {timeout:?}")]
    ConnectTimeout { peer: Peer, timeout: Duration },

    /// Every resolved candidate address was tried and refused.
    #[error("destination {0} unreachable")]
    UnreachableDestination(Peer),

    /// The control link to the peer process is broken or spoke garbage.
    /// Fatal to every request outstanding on that channel.
    #[error("handoff failed: {0}")]
    HandoffFailed(String),

    /// A record with this id is already present in the table.
    #[error("duplicate connection id {0}")]
    DuplicateId(ConnId),

    /// The operation needs refcount == 0 but acquirers are outstanding.
    #[error("connection {0} is still referenced")]
    StillReferenced(ConnId),

    /// The operation is not legal in the record's current lifecycle state,
    /// e.g. using a handle after its socket was handed off.
    #[error("invalid operation on connection {id} in state {state:?}")]
    InvalidState { id: ConnId, state: ConnState },
}

impl ConnError {
    pub(crate) fn invalid_state(id: ConnId, state: ConnState) -> Self {
        ConnError::InvalidState { id, state }
    }
}
