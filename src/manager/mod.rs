//! Connection Manager
//!
//! The fleet's broker unit. It accepts inbound connections and assigns them
//! to workers, arbitrates acquire requests it cannot satisfy locally
//! (re-home an existing connection, connect on the worker's behalf, or
//! redirect the worker to connect itself), allocates fleet-unique
//! connection ids, and keeps the authoritative ownership index. It never
//! performs protocol I/O and never holds a socket longer than one handoff.

pub(crate) mod connector;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::{ConnId, ConnIdAllocator, ConnRecord, ConnState, Peer};
use crate::error::ConnError;
use crate::handoff::{ManagerEndpoint, ManagerMessage, ReqId, SocketTransfer, WorkerId, WorkerRequest};
use crate::resolve::Resolver;

use connector::{ConnectJob, ConnectOutcome, Connector, JobKind};

/// Control surface the fleet bootstrap drives the Manager with.
#[derive(Debug)]
pub enum ManagerCommand {
    /// Bind the configured listen addresses and start accepting. Replies
    /// with the actual bound addresses.
    StartListeners {
        reply: oneshot::Sender<anyhow::Result<Vec<SocketAddr>>>,
    },
    /// Snapshot of the fleet ownership index, for introspection.
    Owners {
        reply: oneshot::Sender<HashMap<ConnId, WorkerId>>,
    },
    Shutdown,
}

enum LinkEvent {
    Request(WorkerRequest),
    Closed,
}

type WorkerStream = Pin<Box<dyn Stream<Item = LinkEvent> + Send>>;

/// An acquire being satisfied by re-homing: who asked, who is giving up
/// the connection, and what to fall back to if they refuse.
struct SurrenderCtx {
    requester: WorkerId,
    requester_req: ReqId,
    owner: WorkerId,
    peer: Peer,
    timeout: Duration,
}

enum Event {
    Worker(usize, LinkEvent),
    Outcome(ConnectOutcome),
    Accepted(TcpStream, SocketAddr),
    Command(ManagerCommand),
    CommandsClosed,
}

pub struct Manager {
    config: Arc<Config>,
    alloc: ConnIdAllocator,
    links: Vec<ManagerEndpoint>,
    inbox: StreamMap<usize, WorkerStream>,
    owners: HashMap<ConnId, WorkerId>,
    by_peer: HashMap<Peer, Vec<ConnId>>,
    pending_surrenders: HashMap<ReqId, SurrenderCtx>,
    next_req: ReqId,
    connector: Option<Connector>,
    jobs_tx: mpsc::Sender<ConnectJob>,
    outcomes_rx: mpsc::Receiver<ConnectOutcome>,
    accepted_tx: mpsc::Sender<(TcpStream, SocketAddr)>,
    accepted_rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    commands: mpsc::Receiver<ManagerCommand>,
    next_worker: usize,
    listener_tasks: Vec<JoinHandle<()>>,
}

impl Manager {
    /// Build the Manager around the pre-created handoff endpoints, one per
    /// worker, indexed by worker id. Returns the command handle the fleet
    /// bootstrap keeps.
    pub fn new(
        config: Arc<Config>,
        resolver: Arc<dyn Resolver>,
        endpoints: Vec<ManagerEndpoint>,
    ) -> (Self, mpsc::Sender<ManagerCommand>) {
        let capacity = config.fleet.channel_capacity;
        let (jobs_tx, jobs_rx) = mpsc::channel(capacity);
        let (outcomes_tx, outcomes_rx) = mpsc::channel(capacity);
        let (accepted_tx, accepted_rx) = mpsc::channel(capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let mut inbox = StreamMap::new();
        let mut links = Vec::with_capacity(endpoints.len());
        for (idx, mut endpoint) in endpoints.into_iter().enumerate() {
            if let Some(rx) = endpoint.take_rx() {
                let stream = ReceiverStream::new(rx)
                    .map(LinkEvent::Request)
                    .chain(tokio_stream::once(LinkEvent::Closed));
                inbox.insert(idx, Box::pin(stream) as WorkerStream);
            }
            links.push(endpoint);
        }

        let manager = Self {
            config,
            alloc: ConnIdAllocator::new(),
            links,
            inbox,
            owners: HashMap::new(),
            by_peer: HashMap::new(),
            pending_surrenders: HashMap::new(),
            next_req: 1,
            connector: Some(Connector::new(jobs_rx, outcomes_tx, resolver)),
            jobs_tx,
            outcomes_rx,
            accepted_tx,
            accepted_rx,
            commands: cmd_rx,
            next_worker: 0,
            listener_tasks: Vec::new(),
        };
        (manager, cmd_tx)
    }

    fn next_req(&mut self) -> ReqId {
        let req = self.next_req;
        self.next_req += 1;
        req
    }

    /// Drive the broker loop until told to shut down. Workers talk to it
    /// over their handoff channels; listeners and the connector feed it
    /// over internal channels.
    pub async fn run(mut self) {
        info!(workers = self.links.len(), "manager started");
        if let Some(connector) = self.connector.take() {
            tokio::spawn(connector.run());
        }

        loop {
            let event = tokio::select! {
                Some((idx, ev)) = self.inbox.next() => Event::Worker(idx, ev),
                Some(outcome) = self.outcomes_rx.recv() => Event::Outcome(outcome),
                Some((stream, addr)) = self.accepted_rx.recv() => Event::Accepted(stream, addr),
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => Event::Command(cmd),
                    None => Event::CommandsClosed,
                },
            };

            match event {
                Event::Worker(idx, LinkEvent::Request(req)) => {
                    self.handle_request(WorkerId(idx), req).await
                }
                Event::Worker(idx, LinkEvent::Closed) => self.worker_gone(WorkerId(idx)).await,
                Event::Outcome(outcome) => self.handle_outcome(outcome).await,
                Event::Accepted(stream, addr) => self.handle_accept(stream, addr).await,
                Event::Command(ManagerCommand::StartListeners { reply }) => {
                    let _ = reply.send(self.start_listeners().await);
                }
                Event::Command(ManagerCommand::Owners { reply }) => {
                    let _ = reply.send(self.owners.clone());
                }
                Event::Command(ManagerCommand::Shutdown) | Event::CommandsClosed => break,
            }
        }

        for task in &self.listener_tasks {
            task.abort();
        }
        info!(tracked = self.owners.len(), "manager stopped");
    }

    async fn handle_request(&mut self, from: WorkerId, req: WorkerRequest) {
        match req {
            WorkerRequest::AcquireConnection {
                req_id,
                peer,
                timeout,
            } => {
                // Prefer re-homing an existing connection over opening a
                // second one to the same destination.
                if let Some((owner, id)) = self.find_remote_owner(peer, from) {
                    let mgr_req = self.next_req();
                    self.pending_surrenders.insert(
                        mgr_req,
                        SurrenderCtx {
                            requester: from,
                            requester_req: req_id,
                            owner,
                            peer,
                            timeout,
                        },
                    );
                    debug!(conn = %id, %owner, requester = %from, "re-homing existing connection");
                    if self.links[owner.0]
                        .send(ManagerMessage::Surrender { req_id: mgr_req, id })
                        .await
                        .is_ok()
                    {
                        return;
                    }
                    // Owner unreachable; its index entries are purged when
                    // the link closure event arrives.
                    self.pending_surrenders.remove(&mgr_req);
                }
                self.dispatch_job(from, req_id, peer, timeout).await;
            }
            WorkerRequest::QueryOwner { req_id, id } => {
                let owner = self.owners.get(&id).copied();
                let _ = self.links[from.0]
                    .send(ManagerMessage::Owner { req_id, owner })
                    .await;
            }
            WorkerRequest::SurrenderReply { req_id, result } => {
                self.handle_surrender_reply(req_id, result).await;
            }
            WorkerRequest::RegisterOwnership {
                id,
                correlation_id,
                peer,
            } => {
                debug!(conn = %id, %correlation_id, %peer, owner = %from, "ownership registered");
                self.owners.insert(id, from);
                self.by_peer.entry(peer).or_default().push(id);
            }
            WorkerRequest::ConnectionClosed { id } => {
                if self.owners.get(&id) == Some(&from) {
                    self.forget(id);
                }
            }
        }
    }

    async fn handle_surrender_reply(
        &mut self,
        req_id: ReqId,
        result: Result<SocketTransfer, ConnError>,
    ) {
        let ctx = match self.pending_surrenders.remove(&req_id) {
            Some(ctx) => ctx,
            None => {
                // Requester vanished before the owner answered. The owner's
                // copy is already gone, so the socket closes here and the
                // index must forget the id.
                if let Ok(transfer) = result {
                    warn!(conn = %transfer.id(), "orphaned surrender; closing socket");
                    self.forget(transfer.id());
                }
                return;
            }
        };
        match result {
            Ok(transfer) => {
                let id = transfer.id();
                let delivered = self.links[ctx.requester.0]
                    .send_returning(ManagerMessage::Deliver {
                        req_id: ctx.requester_req,
                        transfer,
                    })
                    .await;
                match delivered {
                    Ok(()) => {
                        // The handoff completed; only now does ownership move.
                        self.owners.insert(id, ctx.requester);
                        debug!(conn = %id, from = %ctx.owner, to = %ctx.requester, "connection re-homed");
                    }
                    Err(undelivered) => {
                        warn!(conn = %id, requester = %ctx.requester, "requester gone; closing surrendered socket");
                        drop(undelivered);
                        self.forget(id);
                    }
                }
            }
            Err(error) => {
                // The owner could not give it up (already closing, still
                // referenced); fall back to a fresh connect.
                debug!(%error, requester = %ctx.requester, "surrender refused; connecting instead");
                self.dispatch_job(ctx.requester, ctx.requester_req, ctx.peer, ctx.timeout)
                    .await;
            }
        }
    }

    async fn handle_outcome(&mut self, outcome: ConnectOutcome) {
        match outcome {
            ConnectOutcome::Connected { job, stream, addr } => {
                let id = self.alloc.next();
                let correlation_id = Uuid::new_v4();
                let peer = Peer::tcp(addr);
                let transfer = SocketTransfer::new(
                    id,
                    correlation_id,
                    peer,
                    ConnState::Established,
                    stream,
                    Vec::new(),
                );
                debug!(conn = %id, %peer, %correlation_id, requester = %job.requester, "outbound connection established");
                let delivered = self.links[job.requester.0]
                    .send_returning(ManagerMessage::Deliver {
                        req_id: job.req_id,
                        transfer,
                    })
                    .await;
                match delivered {
                    Ok(()) => {
                        self.owners.insert(id, job.requester);
                        self.by_peer.entry(peer).or_default().push(id);
                    }
                    Err(_) => {
                        warn!(conn = %id, requester = %job.requester, "requester gone; dropping fresh connection");
                    }
                }
            }
            ConnectOutcome::Resolved { job, candidates } => {
                let id = self.alloc.next();
                let correlation_id = Uuid::new_v4();
                debug!(conn = %id, requester = %job.requester, count = candidates.len(), "redirecting worker to connect");
                let _ = self.links[job.requester.0]
                    .send(ManagerMessage::Redirect {
                        req_id: job.req_id,
                        id,
                        correlation_id,
                        candidates,
                        timeout: job.timeout,
                    })
                    .await;
            }
            ConnectOutcome::Failed { job, error } => {
                let _ = self.links[job.requester.0]
                    .send(ManagerMessage::Failed {
                        req_id: job.req_id,
                        error,
                    })
                    .await;
            }
        }
    }

    /// Assign a freshly accepted connection to a worker, round robin over
    /// the live links.
    async fn handle_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = self.alloc.next();
        let correlation_id = Uuid::new_v4();
        let peer = Peer::tcp(addr);
        info!(conn = %id, %peer, %correlation_id, "inbound connection accepted");
        let mut record = ConnRecord::inbound(id, correlation_id, peer, stream);
        let mut transfer = match record.surrender() {
            Ok(transfer) => transfer,
            Err(e) => {
                error!(conn = %id, error = %e, "accepted socket unusable");
                return;
            }
        };
        for _ in 0..self.links.len() {
            let w = self.next_worker % self.links.len();
            self.next_worker = self.next_worker.wrapping_add(1);
            if self.links[w].is_broken() {
                continue;
            }
            match self.links[w]
                .send_returning(ManagerMessage::TakeInbound { transfer })
                .await
            {
                Ok(()) => {
                    self.owners.insert(id, WorkerId(w));
                    self.by_peer.entry(peer).or_default().push(id);
                    return;
                }
                Err(ManagerMessage::TakeInbound { transfer: back }) => transfer = back,
                Err(_) => return,
            }
        }
        error!(%peer, "no live worker to adopt inbound connection");
    }

    async fn dispatch_job(
        &mut self,
        requester: WorkerId,
        req_id: ReqId,
        peer: Peer,
        timeout: Duration,
    ) {
        let kind = if self.config.fleet.redirect_outbound {
            JobKind::Resolve
        } else {
            JobKind::Connect
        };
        let job = ConnectJob {
            req_id,
            requester,
            peer,
            timeout,
            kind,
        };
        if self.jobs_tx.send(job).await.is_err() {
            let _ = self.links[requester.0]
                .send(ManagerMessage::Failed {
                    req_id,
                    error: ConnError::HandoffFailed("connector unavailable".into()),
                })
                .await;
        }
    }

    /// Newest registration wins when several remote workers hold a
    /// connection to the same destination.
    fn find_remote_owner(&self, peer: Peer, requester: WorkerId) -> Option<(WorkerId, ConnId)> {
        let ids = self.by_peer.get(&peer)?;
        ids.iter().rev().find_map(|id| {
            self.owners
                .get(id)
                .filter(|owner| **owner != requester && !self.links[owner.0].is_broken())
                .map(|owner| (*owner, *id))
        })
    }

    fn forget(&mut self, id: ConnId) {
        if let Some(owner) = self.owners.remove(&id) {
            debug!(conn = %id, %owner, "connection dropped from fleet index");
        }
        self.by_peer.retain(|_, ids| {
            ids.retain(|c| *c != id);
            !ids.is_empty()
        });
    }

    /// A worker's handoff channel closed. Its connections are gone with it;
    /// acquires waiting on one of them fall back to fresh connects.
    async fn worker_gone(&mut self, worker: WorkerId) {
        warn!(%worker, "worker link closed; purging its connections");
        self.links[worker.0].mark_broken();

        let orphaned: Vec<ConnId> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == worker)
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            self.forget(id);
        }

        let stalled: Vec<ReqId> = self
            .pending_surrenders
            .iter()
            .filter(|(_, ctx)| ctx.owner == worker || ctx.requester == worker)
            .map(|(req, _)| *req)
            .collect();
        for req in stalled {
            if let Some(ctx) = self.pending_surrenders.remove(&req) {
                if ctx.owner == worker && ctx.requester != worker {
                    self.dispatch_job(ctx.requester, ctx.requester_req, ctx.peer, ctx.timeout)
                        .await;
                }
            }
        }
    }

    async fn start_listeners(&mut self) -> anyhow::Result<Vec<SocketAddr>> {
        let addrs = self.config.listen.addrs.clone();
        let mut bound = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind listener on {addr}"))?;
            let local = listener
                .local_addr()
                .context("listener has no local address")?;
            info!(%local, "listening for inbound connections");
            bound.push(local);
            let tx = self.accepted_tx.clone();
            self.listener_tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            if tx.send((stream, peer)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(%local, error = %e, "accept failed"),
                    }
                }
            }));
        }
        Ok(bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::StaticResolver;

    #[tokio::test]
    async fn orphaned_surrender_purges_the_fleet_index() {
        let config = Arc::new(Config::default());
        let resolver = Arc::new(StaticResolver::new());
        let (mgr_ep, _wrk_ep) = crate::handoff::channel(8);
        let (mut manager, _cmd) = Manager::new(config, resolver, vec![mgr_ep]);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let id = ConnId(11);
        let peer = Peer::tcp(addr);
        manager.owners.insert(id, WorkerId(0));
        manager.by_peer.entry(peer).or_default().push(id);

        let transfer = SocketTransfer::new(
            id,
            Uuid::new_v4(),
            peer,
            ConnState::Established,
            server,
            Vec::new(),
        );
        // No surrender context is pending: the requester vanished before
        // the owner answered.
        manager.handle_surrender_reply(99, Ok(transfer)).await;

        assert!(manager.owners.is_empty());
        assert!(manager.by_peer.is_empty());
    }
}
