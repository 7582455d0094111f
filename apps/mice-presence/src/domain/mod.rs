//! Domain Layer - Peer records and presence rules.
//!
//! This layer contains the core types of the presence protocol with no
//! dependency on the store, the runtime or the clock. All types here are
//! plain Rust with serialization support.

/// Replicated peer records, the peer set and the local identity.
pub mod peer;

/// Presence lifecycle and abandonment policy.
pub mod presence;
