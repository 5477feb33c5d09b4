//! Fleet bootstrap
//!
//! Wires the units together and starts them in the required order: every
//! handoff channel exists before any unit runs, so no early message can be
//! lost. One worker task per configured worker plus the Manager.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::handoff::{self, WorkerId};
use crate::introspect::ConnSnapshot;
use crate::manager::{Manager, ManagerCommand};
use crate::resolve::Resolver;
use crate::worker::{Inbound, Worker, WorkerHandle};

pub struct Fleet {
    config: Arc<Config>,
    resolver: Arc<dyn Resolver>,
    handles: Vec<WorkerHandle>,
    manager_cmd: Option<mpsc::Sender<ManagerCommand>>,
    inbound_rx: Option<mpsc::UnboundedReceiver<Inbound>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Fleet {
    pub fn new(config: Config, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            config: Arc::new(config),
            resolver,
            handles: Vec::new(),
            manager_cmd: None,
            inbound_rx: None,
            tasks: Vec::new(),
        }
    }

    /// Units this fleet will run once started: the configured workers plus
    /// the Manager. Known before anything is spawned.
    pub fn unit_count(&self) -> usize {
        self.config.fleet.workers + 1
    }

    /// Spawn the whole fleet. Channels are created for every unit first,
    /// then the units start; listeners stay down until
    /// [`start_listeners`](Self::start_listeners).
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.manager_cmd.is_some() {
            anyhow::bail!("fleet already started");
        }
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut endpoints = Vec::with_capacity(self.config.fleet.workers);
        let mut workers = Vec::with_capacity(self.config.fleet.workers);
        for idx in 0..self.config.fleet.workers {
            let (mgr_ep, wrk_ep) = handoff::channel(self.config.fleet.channel_capacity);
            endpoints.push(mgr_ep);
            let (worker, handle) = Worker::new(
                WorkerId(idx),
                Arc::clone(&self.config),
                wrk_ep,
                inbound_tx.clone(),
            );
            self.handles.push(handle);
            workers.push(worker);
        }
        let (manager, cmd_tx) =
            Manager::new(Arc::clone(&self.config), Arc::clone(&self.resolver), endpoints);

        for worker in workers {
            self.tasks.push(tokio::spawn(worker.run()));
        }
        self.tasks.push(tokio::spawn(manager.run()));
        self.manager_cmd = Some(cmd_tx);
        self.inbound_rx = Some(inbound_rx);
        info!(units = self.unit_count(), "fleet started");
        Ok(())
    }

    /// Bind the configured listen addresses and start accepting inbound
    /// connections. Returns the actual bound addresses.
    pub async fn start_listeners(&self) -> anyhow::Result<Vec<SocketAddr>> {
        let cmd = self.manager_cmd.as_ref().context("fleet not started")?;
        let (tx, rx) = oneshot::channel();
        cmd.send(ManagerCommand::StartListeners { reply: tx })
            .await
            .context("manager is gone")?;
        rx.await.context("manager dropped the request")?
    }

    pub fn worker(&self, idx: usize) -> Option<&WorkerHandle> {
        self.handles.get(idx)
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.handles
    }

    /// The stream of inbound payloads for the protocol-layer collaborator.
    /// May be taken once.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.inbound_rx.take()
    }

    /// Aggregate every worker's snapshot into one fleet-wide view, with the
    /// ownership index folded in.
    pub async fn list_connections(&self) -> Vec<ConnSnapshot> {
        let owners = match &self.manager_cmd {
            Some(cmd) => {
                let (tx, rx) = oneshot::channel();
                if cmd.send(ManagerCommand::Owners { reply: tx }).await.is_ok() {
                    rx.await.unwrap_or_default()
                } else {
                    HashMap::new()
                }
            }
            None => HashMap::new(),
        };
        let mut all = Vec::new();
        for handle in &self.handles {
            match handle.snapshot().await {
                Ok(snapshots) => {
                    for mut snap in snapshots {
                        snap.owner = owners.get(&snap.id).copied().or(Some(handle.id()));
                        all.push(snap);
                    }
                }
                Err(e) => warn!(worker = %handle.id(), error = %e, "snapshot unavailable"),
            }
        }
        all.sort_by_key(|s| s.id.raw());
        all
    }

    /// Graceful stop: tell the Manager to shut down, drop the worker
    /// handles, and wait for the units to drain within the configured
    /// budget before aborting stragglers.
    pub async fn shutdown(mut self) {
        info!("fleet shutting down");
        if let Some(cmd) = self.manager_cmd.take() {
            let _ = cmd.send(ManagerCommand::Shutdown).await;
        }
        self.handles.clear();
        self.inbound_rx = None;
        let drain = futures::future::join_all(self.tasks.iter_mut());
        if tokio::time::timeout(self.config.timeouts.shutdown, drain)
            .await
            .is_err()
        {
            warn!("shutdown drain timed out; aborting remaining units");
            for task in &self.tasks {
                task.abort();
            }
        }
        info!("fleet stopped");
    }
}
