//! Handoff channel endpoints
//!
//! One bidirectional control link per worker, created before the fleet
//! units are spawned; each side keeps its endpoint for the life of the
//! unit. Delivery is FIFO per channel (no ordering across channels). A
//! broken channel is fatal to every request routed through it: the
//! endpoint is poisoned and every send or receive afterwards reports
//! `HandoffFailed` until the unit is restarted.

use tokio::sync::mpsc;

use crate::error::ConnError;

use super::message::{ManagerMessage, WorkerRequest};

/// Worker-side endpoint of the control link.
#[derive(Debug)]
pub struct WorkerEndpoint {
    tx: mpsc::Sender<WorkerRequest>,
    rx: mpsc::Receiver<ManagerMessage>,
    broken: bool,
}

/// Manager-side endpoint of the control link.
#[derive(Debug)]
pub struct ManagerEndpoint {
    tx: mpsc::Sender<ManagerMessage>,
    rx: Option<mpsc::Receiver<WorkerRequest>>,
    broken: bool,
}

/// Create one worker/manager endpoint pair. Must happen before the units
/// start so neither side can miss early traffic.
pub fn channel(capacity: usize) -> (ManagerEndpoint, WorkerEndpoint) {
    let (to_worker, from_manager) = mpsc::channel(capacity);
    let (to_manager, from_worker) = mpsc::channel(capacity);
    (
        ManagerEndpoint {
            tx: to_worker,
            rx: Some(from_worker),
            broken: false,
        },
        WorkerEndpoint {
            tx: to_manager,
            rx: from_manager,
            broken: false,
        },
    )
}

impl WorkerEndpoint {
    pub async fn send(&mut self, msg: WorkerRequest) -> Result<(), ConnError> {
        if self.broken {
            return Err(ConnError::HandoffFailed("control link is down".into()));
        }
        self.tx.send(msg).await.map_err(|_| {
            self.broken = true;
            ConnError::HandoffFailed("manager endpoint closed".into())
        })
    }

    /// Receive the next manager message. Returns `None` exactly once, when
    /// the channel breaks; the endpoint is unusable afterwards.
    pub async fn recv(&mut self) -> Option<ManagerMessage> {
        if self.broken {
            return None;
        }
        match self.rx.recv().await {
            Some(msg) => Some(msg),
            None => {
                self.broken = true;
                None
            }
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl ManagerEndpoint {
    pub async fn send(&mut self, msg: ManagerMessage) -> Result<(), ConnError> {
        if self.broken {
            return Err(ConnError::HandoffFailed("control link is down".into()));
        }
        self.tx.send(msg).await.map_err(|_| {
            self.broken = true;
            ConnError::HandoffFailed("worker endpoint closed".into())
        })
    }

    /// Like `send`, but hands the message back on failure so a transfer it
    /// carries can be recovered instead of silently closing the socket.
    pub async fn send_returning(&mut self, msg: ManagerMessage) -> Result<(), ManagerMessage> {
        if self.broken {
            return Err(msg);
        }
        self.tx.send(msg).await.map_err(|e| {
            self.broken = true;
            e.0
        })
    }

    /// Take the receive half so the Manager can multiplex all worker links
    /// in one stream map. May be taken once.
    pub fn take_rx(&mut self) -> Option<mpsc::Receiver<WorkerRequest>> {
        self.rx.take()
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnId, Peer};
    use std::time::Duration;

    fn peer() -> Peer {
        Peer::tcp("192.0.2.1:5060".parse().unwrap())
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let (mut mgr, mut wrk) = channel(8);
        for req_id in 0..4 {
            wrk.send(WorkerRequest::AcquireConnection {
                req_id,
                peer: peer(),
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();
        }
        let mut rx = mgr.take_rx().unwrap();
        for expect in 0..4 {
            match rx.recv().await.unwrap() {
                WorkerRequest::AcquireConnection { req_id, .. } => assert_eq!(req_id, expect),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn broken_channel_poisons_endpoint() {
        let (mgr, mut wrk) = channel(8);
        drop(mgr);

        let err = wrk
            .send(WorkerRequest::ConnectionClosed { id: ConnId(9) })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnError::HandoffFailed(_)));
        assert!(wrk.is_broken());

        // Still broken on the next attempt, and recv reports closure.
        assert!(wrk
            .send(WorkerRequest::ConnectionClosed { id: ConnId(9) })
            .await
            .is_err());
        assert!(wrk.recv().await.is_none());
    }
}
