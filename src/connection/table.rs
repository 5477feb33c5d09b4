//! Process-local connection table
//!
//! Each fleet unit indexes only the connections it currently owns; there is
//! no cross-unit shared memory. Lookups have acquire semantics: a hit bumps
//! the refcount and the caller must balance it with a release.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ConnError;
use crate::introspect::ConnSnapshot;

use super::record::{ConnId, ConnRecord, ConnState, Peer};

/// Index over the connection records owned by one unit.
#[derive(Debug, Default)]
pub struct ConnTable {
    records: HashMap<ConnId, ConnRecord>,
    by_peer: HashMap<Peer, Vec<ConnId>>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.records.contains_key(&id)
    }

    /// Insert a record. Fails with `DuplicateId` if the id is already
    /// present; ids are never reused, so a duplicate is a protocol fault.
    pub fn insert(&mut self, record: ConnRecord) -> Result<(), ConnError> {
        let id = record.id();
        if self.records.contains_key(&id) {
            return Err(ConnError::DuplicateId(id));
        }
        self.by_peer.entry(record.peer()).or_default().push(id);
        self.records.insert(id, record);
        Ok(())
    }

    /// Non-acquiring access, for the owning event loop only.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut ConnRecord> {
        self.records.get_mut(&id)
    }

    fn is_live(record: &ConnRecord) -> bool {
        !matches!(record.state(), ConnState::Closing | ConnState::Destroyed)
    }

    /// Look up by id with acquire semantics. Closing and destroyed records
    /// never match.
    pub fn acquire_by_id(&mut self, id: ConnId) -> Option<&mut ConnRecord> {
        let record = self.records.get_mut(&id).filter(|r| Self::is_live(r))?;
        record.acquire().ok()?;
        Some(record)
    }

    /// Look up a live connection to `peer` with acquire semantics, used to
    /// reuse an outbound connection instead of opening a new one. When
    /// several live connections to the peer exist the most recently used
    /// one wins, maximizing locality.
    pub fn acquire_by_destination(&mut self, peer: Peer) -> Option<&mut ConnRecord> {
        let best = self
            .by_peer
            .get(&peer)?
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| Self::is_live(r))
            .max_by_key(|r| r.last_activity())
            .map(|r| r.id())?;
        self.acquire_by_id(best)
    }

    /// Drop one acquirer reference. Returns true when the record is in
    /// Closing and just lost its last reference, i.e. the caller should now
    /// destroy it.
    pub fn release(&mut self, id: ConnId, has_pending_writes: bool) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.release(has_pending_writes);
                record.state() == ConnState::Closing && record.refcount() == 0
            }
            None => false,
        }
    }

    /// Remove a record. Only legal once the refcount has drained.
    pub fn remove(&mut self, id: ConnId) -> Result<ConnRecord, ConnError> {
        match self.records.get(&id) {
            None => Err(ConnError::invalid_state(id, ConnState::Destroyed)),
            Some(record) if record.refcount() > 0 => Err(ConnError::StillReferenced(id)),
            Some(_) => Ok(self.take(id)),
        }
    }

    /// Remove regardless of references. Reserved for forced teardown after
    /// the caller has decided the refcount no longer matters.
    pub fn force_remove(&mut self, id: ConnId) -> Option<ConnRecord> {
        if self.records.contains_key(&id) {
            Some(self.take(id))
        } else {
            None
        }
    }

    fn take(&mut self, id: ConnId) -> ConnRecord {
        let record = self.records.remove(&id).expect("checked presence");
        if let Some(ids) = self.by_peer.get_mut(&record.peer()) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.by_peer.remove(&record.peer());
            }
        }
        record
    }

    /// One idle-eviction pass. Unreferenced records quiet past `window`
    /// first become Idle, then get destroyed on a later pass; unreferenced
    /// Closing records are collected as well. Returns the destroyed ids.
    /// Never touches a record with outstanding acquirers.
    pub fn evict_idle(&mut self, window: Duration) -> Vec<ConnId> {
        let mut to_idle = Vec::new();
        let mut to_destroy = Vec::new();
        for record in self.records.values() {
            match record.state() {
                ConnState::Established | ConnState::WritePending if record.is_idle(window) => {
                    to_idle.push(record.id());
                }
                ConnState::Idle if record.is_idle(window) => to_destroy.push(record.id()),
                ConnState::Closing if record.refcount() == 0 => to_destroy.push(record.id()),
                _ => {}
            }
        }
        for id in to_idle {
            if let Some(record) = self.records.get_mut(&id) {
                if record.transition(ConnState::Idle).is_ok() {
                    debug!(conn = %id, "connection marked idle");
                }
            }
        }
        for &id in &to_destroy {
            let mut record = self.take(id);
            record.destroy();
            debug!(conn = %id, "idle connection evicted");
        }
        to_destroy
    }

    /// Consistent point-in-time copy of every record; pure in-memory, no
    /// lock held across I/O.
    pub fn snapshot(&self) -> Vec<ConnSnapshot> {
        self.records.values().map(ConnSnapshot::of).collect()
    }

    /// Streams to poll for readiness, with the interest each state wants.
    pub fn iter_ready(&self) -> impl Iterator<Item = (ConnId, &TcpStream, Interest)> {
        self.records.values().filter_map(|record| {
            let interest = match record.state() {
                ConnState::Established | ConnState::Idle => Interest::READABLE,
                ConnState::WritePending => Interest::READABLE | Interest::WRITABLE,
                _ => return None,
            };
            record.stream().map(|s| (record.id(), s, interest))
        })
    }
}
