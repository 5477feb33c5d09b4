//! Connection records, lifecycle, and the per-unit table

pub mod record;
pub mod table;
pub mod write_queue;

pub use record::{ConnId, ConnIdAllocator, ConnRecord, ConnState, Peer, Transport};
pub use table::ConnTable;
pub use write_queue::WriteQueue;
