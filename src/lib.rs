//! blockhouse — the leader-side storage engine and coordination server of a
//! clustered filesystem whose mounts share one block device.
//!
//! One mount is elected leader and runs the [`server`]; the other mounts
//! connect as clients with [`net::Client`] to obtain allocators, log trees,
//! transaction sequence numbers and the stable tree roots.  Persistence is
//! built from 4 KiB checksummed metadata blocks ([`block`]) organized into
//! copy-on-write btrees ([`btree`]) fed by dual-pool delayed-reuse
//! allocators ([`alloc`]), all made durable by the server's batching commit
//! coordinator.

pub mod alloc;
pub mod block;
pub mod btree;
pub mod error;
pub mod format;
pub mod net;
pub mod server;
pub mod srch;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
