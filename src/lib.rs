//! Sigfleet Library
//!
//! Transport connection management for an event-driven signaling server:
//! a fleet of worker units that own stream connections outright, a Manager
//! that accepts, brokers, and re-homes them, and explicit socket-ownership
//! handoff between the two. Protocol parsing and routing live above this
//! layer and drive it through [`WorkerHandle`].

pub mod config;
pub mod connection;
pub mod error;
pub mod fleet;
pub mod handoff;
pub mod introspect;
pub mod manager;
pub mod resolve;
pub mod shutdown;
pub mod worker;

pub use config::Config;
pub use connection::{ConnId, ConnState, Peer, Transport};
pub use error::ConnError;
pub use fleet::Fleet;
pub use shutdown::ShutdownCoordinator;
pub use worker::{Inbound, WorkerHandle};

/// Common error type for the bootstrap and binary paths. The connection
/// layer itself surfaces typed [`ConnError`]s.
pub type Result<T> = anyhow::Result<T>;
