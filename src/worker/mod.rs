//! Worker event loop
//!
//! Each worker owns a subset of the fleet's connections outright: it is the
//! only unit that reads, writes, or mutates them. The loop multiplexes
//! collaborator commands, Manager control messages, socket readiness, and
//! the idle-eviction tick; it never blocks on socket I/O, and it suspends
//! only inside `select!`.

pub mod handle;

pub use handle::{Inbound, WorkerHandle, WorkerStats};

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::Ready;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::{ConnId, ConnRecord, ConnState, ConnTable, Peer};
use crate::error::ConnError;
use crate::handoff::{ManagerMessage, ReqId, WorkerEndpoint, WorkerId, WorkerRequest};
use crate::manager::connector;
use handle::Command;

/// Result of a redirect-mode connect the worker performed itself.
#[derive(Debug)]
struct ConnectOutcome {
    req_id: ReqId,
    id: ConnId,
    correlation_id: Uuid,
    result: Result<(TcpStream, SocketAddr), ConnError>,
}

enum Event {
    Command(Command),
    CommandsClosed,
    Manager(ManagerMessage),
    LinkDown,
    Connected(ConnectOutcome),
    Io(ConnId, io::Result<Ready>),
    EvictTick,
}

/// One worker unit: a connection table plus the event loop driving it.
pub struct Worker {
    id: WorkerId,
    config: Arc<Config>,
    table: ConnTable,
    endpoint: WorkerEndpoint,
    commands: mpsc::Receiver<Command>,
    commands_closed: bool,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    connect_tx: mpsc::Sender<ConnectOutcome>,
    connect_rx: mpsc::Receiver<ConnectOutcome>,
    pending_acquires: HashMap<ReqId, oneshot::Sender<Result<ConnId, ConnError>>>,
    pending_queries: HashMap<ReqId, oneshot::Sender<Result<Option<WorkerId>, ConnError>>>,
    next_req: ReqId,
    stats: WorkerStats,
}

impl Worker {
    /// Build a worker around its pre-created handoff endpoint. The handle
    /// is what collaborators use; the worker itself is consumed by `run`.
    pub fn new(
        id: WorkerId,
        config: Arc<Config>,
        endpoint: WorkerEndpoint,
        inbound_tx: mpsc::UnboundedSender<Inbound>,
    ) -> (Self, WorkerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.fleet.channel_capacity);
        let (connect_tx, connect_rx) = mpsc::channel(16);
        let worker = Self {
            id,
            config,
            table: ConnTable::new(),
            endpoint,
            commands: cmd_rx,
            commands_closed: false,
            inbound_tx,
            connect_tx,
            connect_rx,
            pending_acquires: HashMap::new(),
            pending_queries: HashMap::new(),
            next_req: 1,
            stats: WorkerStats::default(),
        };
        (worker, WorkerHandle::new(id, cmd_tx))
    }

    fn next_req(&mut self) -> ReqId {
        let req = self.next_req;
        self.next_req += 1;
        req
    }

    /// Drive the worker until both the collaborator side and the control
    /// link are gone. Dropping the table closes every owned socket.
    pub async fn run(mut self) {
        info!(worker = %self.id, "worker event loop started");
        let mut evict = tokio::time::interval(self.config.timeouts.eviction_interval);
        evict.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let link_up = !self.endpoint.is_broken();
            if self.commands_closed && !link_up {
                break;
            }
            let event = tokio::select! {
                cmd = self.commands.recv(), if !self.commands_closed => match cmd {
                    Some(cmd) => Event::Command(cmd),
                    None => Event::CommandsClosed,
                },
                msg = self.endpoint.recv(), if link_up => match msg {
                    Some(msg) => Event::Manager(msg),
                    None => Event::LinkDown,
                },
                Some(outcome) = self.connect_rx.recv() => Event::Connected(outcome),
                _ = evict.tick() => Event::EvictTick,
                (id, ready) = next_ready(&self.table) => Event::Io(id, ready),
            };

            match event {
                Event::Command(cmd) => self.handle_command(cmd).await,
                Event::CommandsClosed => self.commands_closed = true,
                Event::Manager(msg) => self.handle_manager(msg).await,
                Event::LinkDown => self.fail_pending_requests(),
                Event::Connected(outcome) => self.handle_connected(outcome).await,
                Event::Io(id, ready) => self.handle_io(id, ready).await,
                Event::EvictTick => self.run_eviction().await,
            }
        }
        info!(worker = %self.id, conns = self.table.len(), "worker event loop stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Acquire {
                peer,
                timeout,
                reply,
            } => {
                if let Some(record) = self.table.acquire_by_destination(peer) {
                    let id = record.id();
                    debug!(worker = %self.id, conn = %id, %peer, "destination served from local table");
                    self.stats.reuse_hits += 1;
                    if reply.send(Ok(id)).is_err() {
                        // Acquirer cancelled; give the reference back.
                        self.release_unclaimed(id).await;
                    }
                    return;
                }
                let timeout = timeout.unwrap_or(self.config.timeouts.connect);
                let req_id = self.next_req();
                self.stats.manager_requests += 1;
                match self
                    .endpoint
                    .send(WorkerRequest::AcquireConnection {
                        req_id,
                        peer,
                        timeout,
                    })
                    .await
                {
                    Ok(()) => {
                        self.pending_acquires.insert(req_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Send { id, bytes, reply } => {
                let result = self.send_bytes(id, bytes).await;
                let _ = reply.send(result);
            }
            Command::Release {
                id,
                has_pending_writes,
            } => {
                if self.table.release(id, has_pending_writes) {
                    // Last reference on a closing connection.
                    self.destroy_local(id).await;
                }
            }
            Command::Destroy { id, reply } => {
                let result = match self.table.get_mut(id) {
                    None => Err(ConnError::InvalidState {
                        id,
                        state: ConnState::Destroyed,
                    }),
                    // The caller's own reference does not block a forced
                    // teardown; anyone else's does.
                    Some(record) if record.refcount() > 1 => Err(ConnError::StillReferenced(id)),
                    Some(_) => Ok(()),
                };
                if result.is_ok() {
                    warn!(worker = %self.id, conn = %id, "forced teardown requested");
                    self.destroy_local(id).await;
                }
                let _ = reply.send(result);
            }
            Command::QueryOwner { id, reply } => {
                let req_id = self.next_req();
                match self
                    .endpoint
                    .send(WorkerRequest::QueryOwner { req_id, id })
                    .await
                {
                    Ok(()) => {
                        self.pending_queries.insert(req_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.table.snapshot());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats);
            }
        }
    }

    async fn handle_manager(&mut self, msg: ManagerMessage) {
        match msg {
            ManagerMessage::Deliver { req_id, transfer } => {
                let mut record = transfer.into_record();
                let id = record.id();
                self.stats.handoffs_in += 1;
                let result = record.acquire().and_then(|()| self.table.insert(record));
                let adopted = result.is_ok();
                let outcome = result.map(|()| id);
                let claimed = match self.pending_acquires.remove(&req_id) {
                    Some(reply) => reply.send(outcome).is_ok(),
                    None => {
                        if let Err(e) = outcome {
                            error!(worker = %self.id, conn = %id, error = %e, "unsolicited delivery failed");
                        }
                        false
                    }
                };
                if adopted && !claimed {
                    // Acquirer cancelled mid-handoff; keep the connection
                    // but drop the reference taken on its behalf.
                    debug!(worker = %self.id, conn = %id, "delivery went unclaimed; releasing");
                    self.release_unclaimed(id).await;
                }
            }
            ManagerMessage::Redirect {
                req_id,
                id,
                correlation_id,
                candidates,
                timeout,
            } => {
                debug!(worker = %self.id, conn = %id, "redirected to originate outbound connect");
                let tx = self.connect_tx.clone();
                tokio::spawn(async move {
                    let result = connector::connect_candidates(&candidates, timeout).await;
                    let _ = tx
                        .send(ConnectOutcome {
                            req_id,
                            id,
                            correlation_id,
                            result,
                        })
                        .await;
                });
            }
            ManagerMessage::Failed { req_id, error } => {
                if let Some(reply) = self.pending_acquires.remove(&req_id) {
                    let _ = reply.send(Err(error));
                } else if let Some(reply) = self.pending_queries.remove(&req_id) {
                    let _ = reply.send(Err(error));
                }
            }
            ManagerMessage::Owner { req_id, owner } => {
                if let Some(reply) = self.pending_queries.remove(&req_id) {
                    let _ = reply.send(Ok(owner));
                }
            }
            ManagerMessage::Surrender { req_id, id } => {
                let result = match self.table.remove(id) {
                    Ok(mut record) => {
                        self.stats.handoffs_out += 1;
                        record.surrender()
                    }
                    Err(e) => Err(e),
                };
                if let Ok(ref transfer) = result {
                    debug!(worker = %self.id, conn = %transfer.id(), "surrendered connection for re-homing");
                }
                if let Err(e) = self
                    .endpoint
                    .send(WorkerRequest::SurrenderReply { req_id, result })
                    .await
                {
                    error!(worker = %self.id, error = %e, "failed to answer surrender");
                }
            }
            ManagerMessage::TakeInbound { transfer } => {
                let id = transfer.id();
                let peer = transfer.peer();
                self.stats.handoffs_in += 1;
                match self.table.insert(transfer.into_record()) {
                    Ok(()) => {
                        debug!(worker = %self.id, conn = %id, %peer, "inbound connection adopted")
                    }
                    Err(e) => error!(worker = %self.id, conn = %id, error = %e, "inbound adoption failed"),
                }
            }
        }
    }

    async fn handle_connected(&mut self, outcome: ConnectOutcome) {
        let reply = self.pending_acquires.remove(&outcome.req_id);
        match outcome.result {
            Ok((stream, addr)) => {
                let peer = Peer::tcp(addr);
                let mut record = ConnRecord::outbound(outcome.id, outcome.correlation_id, peer);
                let id = record.id();
                let result = record
                    .complete_connect(stream)
                    .and_then(|()| record.acquire())
                    .and_then(|()| self.table.insert(record));
                match result {
                    Ok(()) => {
                        if self
                            .endpoint
                            .send(WorkerRequest::RegisterOwnership {
                                id,
                                correlation_id: outcome.correlation_id,
                                peer,
                            })
                            .await
                            .is_err()
                        {
                            warn!(worker = %self.id, conn = %id, "ownership registration lost; control link down");
                        }
                        let claimed = match reply {
                            Some(reply) => reply.send(Ok(id)).is_ok(),
                            None => false,
                        };
                        if !claimed {
                            debug!(worker = %self.id, conn = %id, "connect went unclaimed; releasing");
                            self.release_unclaimed(id).await;
                        }
                    }
                    Err(e) => {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
            }
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    /// A broken control link fails every outstanding request routed
    /// through it; the worker keeps serving the connections it owns.
    fn fail_pending_requests(&mut self) {
        warn!(worker = %self.id, "handoff channel broken; failing outstanding requests");
        for (_, reply) in self.pending_acquires.drain() {
            let _ = reply.send(Err(ConnError::HandoffFailed("control link broken".into())));
        }
        for (_, reply) in self.pending_queries.drain() {
            let _ = reply.send(Err(ConnError::HandoffFailed("control link broken".into())));
        }
    }

    async fn send_bytes(&mut self, id: ConnId, bytes: Bytes) -> Result<(), ConnError> {
        let max_queued = self.config.io.max_queued_bytes;
        let record = match self.table.get_mut(id) {
            Some(record) => record,
            None => {
                return Err(ConnError::InvalidState {
                    id,
                    state: ConnState::Destroyed,
                })
            }
        };
        match record.state() {
            ConnState::Established | ConnState::Idle => {
                record.touch();
                let (written, io_err) = {
                    let stream = match record.stream() {
                        Some(stream) => stream,
                        None => return Err(ConnError::invalid_state(id, record.state())),
                    };
                    let mut written = 0;
                    let mut io_err = None;
                    while written < bytes.len() {
                        match stream.try_write(&bytes[written..]) {
                            Ok(0) => break,
                            Ok(n) => written += n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) => {
                                io_err = Some(e);
                                break;
                            }
                        }
                    }
                    (written, io_err)
                };
                if let Some(e) = io_err {
                    warn!(worker = %self.id, conn = %id, error = %e, "write failed; closing");
                    self.close_conn(id).await;
                    return Err(ConnError::invalid_state(id, ConnState::Closing));
                }
                if written < bytes.len() {
                    record.write_queue().push(bytes.slice(written..));
                    record.transition(ConnState::WritePending)?;
                }
                Ok(())
            }
            ConnState::WritePending => {
                if record.write_queue().queued_bytes() + bytes.len() > max_queued {
                    warn!(worker = %self.id, conn = %id, "write queue overflow; closing stuck connection");
                    self.close_conn(id).await;
                    return Err(ConnError::invalid_state(id, ConnState::Closing));
                }
                record.touch();
                record.write_queue().push(bytes);
                Ok(())
            }
            state => Err(ConnError::invalid_state(id, state)),
        }
    }

    async fn handle_io(&mut self, id: ConnId, ready: io::Result<Ready>) {
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => {
                warn!(worker = %self.id, conn = %id, error = %e, "readiness poll failed");
                self.close_conn(id).await;
                return;
            }
        };
        if ready.is_readable() || ready.is_read_closed() {
            self.read_ready(id).await;
        }
        if ready.is_writable() {
            self.write_ready(id).await;
        }
    }

    async fn read_ready(&mut self, id: ConnId) {
        let buf_size = self.config.io.read_buffer_size;
        let mut close = false;
        if let Some(record) = self.table.get_mut(id) {
            let mut received = None;
            if let Some(stream) = record.stream() {
                let mut buf = vec![0u8; buf_size];
                match stream.try_read(&mut buf) {
                    Ok(0) => close = true,
                    Ok(n) => {
                        buf.truncate(n);
                        received = Some(Bytes::from(buf));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!(worker = %self.id, conn = %id, error = %e, "read failed");
                        close = true;
                    }
                }
            }
            if let Some(bytes) = received {
                record.touch();
                self.stats.bytes_in += bytes.len() as u64;
                if self.inbound_tx.send(Inbound { conn: id, bytes }).is_err() {
                    // Protocol collaborator is gone; received bytes have
                    // nowhere to go.
                    debug!(worker = %self.id, conn = %id, "inbound sink closed; dropping payload");
                }
            }
        }
        if close {
            self.close_conn(id).await;
        }
    }

    async fn write_ready(&mut self, id: ConnId) {
        let mut close = false;
        if let Some(record) = self.table.get_mut(id) {
            if record.state() != ConnState::WritePending {
                return;
            }
            match record.flush() {
                Ok(true) => {
                    record.touch();
                    if let Err(e) = record.transition(ConnState::Established) {
                        error!(worker = %self.id, conn = %id, error = %e, "flush left record in bad state");
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(worker = %self.id, conn = %id, error = %e, "flush failed; closing");
                    close = true;
                }
            }
        }
        if close {
            self.close_conn(id).await;
        }
    }

    /// Drop a reference that was taken for an acquirer who is no longer
    /// listening. The connection stays available for reuse and becomes
    /// eligible for idle eviction like any other unreferenced record.
    async fn release_unclaimed(&mut self, id: ConnId) {
        if self.table.release(id, false) {
            self.destroy_local(id).await;
        }
    }

    /// Peer reset, EOF, or fatal I/O error: stop using the socket, destroy
    /// now if unreferenced, otherwise once the refcount drains.
    async fn close_conn(&mut self, id: ConnId) {
        let destroy_now = match self.table.get_mut(id) {
            Some(record) => {
                let _ = record.transition(ConnState::Closing);
                record.refcount() == 0
            }
            None => false,
        };
        if destroy_now {
            self.destroy_local(id).await;
        }
    }

    async fn destroy_local(&mut self, id: ConnId) {
        if let Some(mut record) = self.table.force_remove(id) {
            record.destroy();
            debug!(worker = %self.id, conn = %id, "connection destroyed");
        }
        if !self.endpoint.is_broken() {
            if self
                .endpoint
                .send(WorkerRequest::ConnectionClosed { id })
                .await
                .is_err()
            {
                self.fail_pending_requests();
            }
        }
    }

    async fn run_eviction(&mut self) {
        let evicted = self.table.evict_idle(self.config.timeouts.idle);
        for id in evicted {
            self.stats.evicted += 1;
            if !self.endpoint.is_broken() {
                let _ = self
                    .endpoint
                    .send(WorkerRequest::ConnectionClosed { id })
                    .await;
            }
        }
    }
}


/// Resolve readiness across every pollable connection in the table. Pends
/// forever when the table has nothing to poll, letting the other event
/// sources drive the loop.
async fn next_ready(table: &ConnTable) -> (ConnId, io::Result<Ready>) {
    let futures: Vec<_> = table
        .iter_ready()
        .map(|(id, stream, interest)| Box::pin(async move { (id, stream.ready(interest).await) }))
        .collect();
    if futures.is_empty() {
        return std::future::pending().await;
    }
    let ((id, ready), _, _) = futures::future::select_all(futures).await;
    (id, ready)
}
