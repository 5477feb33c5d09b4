//! Cross-unit connection handoff
//!
//! The control plane between the Manager and each worker: small request/
//! reply messages plus the one operation that moves socket ownership
//! between units. The transfer object is consuming, so a socket can never
//! end up usable on both sides of a handoff.

pub mod channel;
pub mod message;
pub mod transfer;

pub use channel::{channel, ManagerEndpoint, WorkerEndpoint};
pub use message::{ManagerMessage, ReqId, WorkerId, WorkerRequest};
pub use transfer::SocketTransfer;
