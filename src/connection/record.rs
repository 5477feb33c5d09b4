//! Connection Record and lifecycle state machine
//!
//! One `ConnRecord` is the unit of state for one TCP socket: identity, peer,
//! refcount, buffered writes, lifecycle state. Exactly one fleet unit holds
//! the socket at any instant; the handoff protocol is the only legal way to
//! change the holder.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::error;
use uuid::Uuid;

use crate::error::ConnError;
use crate::handoff::SocketTransfer;

use super::write_queue::WriteQueue;

/// Process-wide unique connection identifier. Monotonically increasing,
/// never reused while any reference is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) u64);

impl ConnId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Issues fresh connection ids. Owned by the single unit that creates
/// records (the Manager), so no global mutable counter exists.
#[derive(Debug)]
pub struct ConnIdAllocator {
    next: u64,
}

impl ConnIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next(&mut self) -> ConnId {
        let id = ConnId(self.next);
        self.next += 1;
        id
    }
}

impl Default for ConnIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport protocol of a peer. TCP only today; the tuple stays tagged so
/// further transports slot in without reshaping the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
        }
    }
}

/// Resolved destination: address, port, transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub addr: SocketAddr,
    pub proto: Transport,
}

impl Peer {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            addr,
            proto: Transport::Tcp,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.proto)
    }
}

/// Lifecycle state of a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Outbound connect in flight.
    Connecting,
    /// Connected, write queue empty.
    Established,
    /// Connected, unflushed bytes queued; flushed on the next writable event.
    WritePending,
    /// No activity past the idle window with no acquirers; eviction candidate.
    Idle,
    /// Peer reset/EOF seen or close requested while still referenced;
    /// destroyed once the refcount drains.
    Closing,
    /// Terminal. A destroyed record is never looked up again.
    Destroyed,
}

impl ConnState {
    fn can_transition(self, to: ConnState) -> bool {
        use ConnState::*;
        match (self, to) {
            (Connecting, Established) | (Connecting, Destroyed) | (Connecting, Closing) => true,
            (Established, WritePending) | (Established, Idle) => true,
            (WritePending, Established) | (WritePending, Idle) => true,
            // An idle connection revives on new traffic or a new acquirer.
            (Idle, Established) => true,
            (Established, Closing) | (WritePending, Closing) | (Idle, Closing) => true,
            (Established, Destroyed) | (WritePending, Destroyed) => true,
            (Idle, Destroyed) | (Closing, Destroyed) => true,
            _ => false,
        }
    }
}

/// The per-socket unit of state.
///
/// The embedded `TcpStream` is present exactly while this unit owns the
/// socket; surrendering the record for handoff takes the stream out and the
/// local copy becomes unusable.
#[derive(Debug)]
pub struct ConnRecord {
    id: ConnId,
    correlation_id: Uuid,
    peer: Peer,
    stream: Option<TcpStream>,
    local_addr: Option<SocketAddr>,
    state: ConnState,
    refcount: u32,
    write_queue: WriteQueue,
    created_at: Instant,
    last_activity: Instant,
}

impl ConnRecord {
    /// Record for a socket connected by `accept`; already established.
    pub fn inbound(id: ConnId, correlation_id: Uuid, peer: Peer, stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let now = Instant::now();
        Self {
            id,
            correlation_id,
            peer,
            stream: Some(stream),
            local_addr,
            state: ConnState::Established,
            refcount: 0,
            write_queue: WriteQueue::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Record for an outbound connect that has not completed yet.
    pub fn outbound(id: ConnId, correlation_id: Uuid, peer: Peer) -> Self {
        let now = Instant::now();
        Self {
            id,
            correlation_id,
            peer,
            stream: None,
            local_addr: None,
            state: ConnState::Connecting,
            refcount: 0,
            write_queue: WriteQueue::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub(crate) fn from_transfer(
        id: ConnId,
        correlation_id: Uuid,
        peer: Peer,
        state: ConnState,
        stream: TcpStream,
        pending: Vec<bytes::Bytes>,
    ) -> Self {
        let local_addr = stream.local_addr().ok();
        let now = Instant::now();
        let mut write_queue = WriteQueue::new();
        for buf in pending {
            write_queue.push(buf);
        }
        Self {
            id,
            correlation_id,
            peer,
            stream: Some(stream),
            local_addr,
            state,
            refcount: 0,
            write_queue,
            created_at: now,
            last_activity: now,
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

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    pub fn write_queue(&mut self) -> &mut WriteQueue {
        &mut self.write_queue
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Flush queued writes into the socket without blocking. Returns
    /// `Ok(true)` once the queue is empty.
    pub fn flush(&mut self) -> std::io::Result<bool> {
        let stream = match &self.stream {
            Some(stream) => stream,
            None => return Ok(true),
        };
        self.write_queue.flush_with(|buf| stream.try_write(buf))
    }

    /// Refresh the activity timestamp; revives an idle record.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        if self.state == ConnState::Idle {
            self.state = ConnState::Established;
        }
    }

    /// Move to `to`, or fail with `InvalidState` if the lifecycle does not
    /// allow it.
    pub fn transition(&mut self, to: ConnState) -> Result<(), ConnError> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition(to) {
            return Err(ConnError::invalid_state(self.id, self.state));
        }
        self.state = to;
        Ok(())
    }

    /// Complete a non-blocking connect: attach the connected stream and move
    /// from Connecting to Established.
    pub fn complete_connect(&mut self, stream: TcpStream) -> Result<(), ConnError> {
        if self.state != ConnState::Connecting {
            return Err(ConnError::invalid_state(self.id, self.state));
        }
        self.local_addr = stream.local_addr().ok();
        self.stream = Some(stream);
        self.transition(ConnState::Established)?;
        self.touch();
        Ok(())
    }

    /// Register one more acquirer. A destroyed record cannot be acquired.
    pub fn acquire(&mut self) -> Result<(), ConnError> {
        if self.state == ConnState::Destroyed {
            return Err(ConnError::invalid_state(self.id, self.state));
        }
        self.refcount += 1;
        self.touch();
        Ok(())
    }

    /// Drop one acquirer. `has_pending_writes` keeps idle eviction from
    /// tearing the connection down mid-write by refreshing activity.
    ///
    /// Decrementing below zero is a violated ownership invariant, not a
    /// recoverable condition: it traps in testing builds and saturates with
    /// an error log in release.
    pub fn release(&mut self, has_pending_writes: bool) {
        debug_assert!(self.refcount > 0, "release of unreferenced connection {}", self.id);
        if self.refcount == 0 {
            error!(conn = %self.id, "refcount underflow; release without matching acquire");
            return;
        }
        self.refcount -= 1;
        if has_pending_writes || self.has_pending_writes() {
            self.last_activity = Instant::now();
        }
    }

    /// True when the record has no acquirers and has been quiet longer than
    /// `window`.
    pub fn is_idle(&self, window: Duration) -> bool {
        self.refcount == 0 && self.last_activity.elapsed() >= window
    }

    /// Give up socket ownership for handoff. Consumes the stream and the
    /// queued writes into a transfer object and marks this copy Destroyed:
    /// the sender must not, and afterwards cannot, use the socket again.
    pub fn surrender(&mut self) -> Result<SocketTransfer, ConnError> {
        let stream = match self.stream.take() {
            Some(s) if self.state != ConnState::Destroyed => s,
            _ => return Err(ConnError::invalid_state(self.id, self.state)),
        };
        let transfer = SocketTransfer::new(
            self.id,
            self.correlation_id,
            self.peer,
            self.state,
            stream,
            self.write_queue.take_all(),
        );
        self.state = ConnState::Destroyed;
        Ok(transfer)
    }

    /// Tear the record down, closing the socket if still held.
    pub fn destroy(&mut self) {
        self.stream = None;
        self.state = ConnState::Destroyed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::tcp("10.0.0.5:5060".parse().unwrap())
    }

    fn record() -> ConnRecord {
        ConnRecord::outbound(ConnId(7), Uuid::new_v4(), peer())
    }

    #[test]
    fn id_allocator_is_monotonic() {
        let mut alloc = ConnIdAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        assert!(b > a);
    }

    #[test]
    fn outbound_record_starts_connecting() {
        let rec = record();
        assert_eq!(rec.state(), ConnState::Connecting);
        assert!(rec.stream().is_none());
    }

    #[test]
    fn balanced_acquire_release_restores_refcount() {
        let mut rec = record();
        rec.state = ConnState::Established;

        let before = rec.refcount();
        for _ in 0..5 {
            rec.acquire().unwrap();
        }
        assert_eq!(rec.refcount(), before + 5);
        for _ in 0..5 {
            rec.release(false);
        }
        assert_eq!(rec.refcount(), before);
    }

    #[test]
    fn destroyed_record_rejects_acquire() {
        let mut rec = record();
        rec.destroy();
        assert!(matches!(
            rec.acquire(),
            Err(ConnError::InvalidState { .. })
        ));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut rec = record();
        // Connecting -> WritePending is not in the lifecycle.
        assert!(rec.transition(ConnState::WritePending).is_err());
        rec.transition(ConnState::Destroyed).unwrap();
        // Destroyed is terminal.
        assert!(rec.transition(ConnState::Established).is_err());
    }

    #[test]
    fn touch_revives_idle_record() {
        let mut rec = record();
        rec.state = ConnState::Idle;
        rec.touch();
        assert_eq!(rec.state(), ConnState::Established);
    }

    #[test]
    fn idle_check_respects_refcount() {
        let mut rec = record();
        rec.state = ConnState::Established;
        rec.last_activity = Instant::now() - Duration::from_secs(600);
        assert!(rec.is_idle(Duration::from_secs(60)));

        rec.acquire().unwrap();
        rec.last_activity = Instant::now() - Duration::from_secs(600);
        assert!(!rec.is_idle(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn surrender_is_exactly_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _server) = tokio::join!(
            tokio::net::TcpStream::connect(addr),
            async { listener.accept().await.unwrap() }
        );
        let stream = client.unwrap();

        let mut rec = ConnRecord::inbound(ConnId(1), Uuid::new_v4(), peer(), stream);
        let transfer = rec.surrender().unwrap();
        assert_eq!(transfer.id(), ConnId(1));

        // Sender-side handle is dead: destroyed, no stream, no re-surrender.
        assert_eq!(rec.state(), ConnState::Destroyed);
        assert!(rec.stream().is_none());
        assert!(matches!(
            rec.surrender(),
            Err(ConnError::InvalidState { .. })
        ));
        assert!(matches!(rec.acquire(), Err(ConnError::InvalidState { .. })));

        // Receiver-side handle works.
        let rec2 = transfer.into_record();
        assert_eq!(rec2.state(), ConnState::Established);
        assert!(rec2.stream().is_some());
    }
}
