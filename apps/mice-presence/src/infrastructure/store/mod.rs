//! Peer Store Adapters
//!
//! Implementations of the `PeerStore` port.
//!
//! - `MemoryBackend`: process-local stand-in for the replicated store, shared
//!   by any number of `MemoryConnection`s (one per client)

mod memory;

pub use memory::{MemoryBackend, MemoryConnection};
