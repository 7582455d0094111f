//! Peer Store Port (Driven Port)
//!
//! Interface to the replicated store that holds the shared collection of
//! mouse records. The store owns conflict resolution, durability and its own
//! reconnection; this port only exposes idempotent mutations, a push-based
//! snapshot subscription and a polled connectivity flag.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::domain::peer::{MICE_COLLECTION, PeerFields, PeerId, PeerRecord};

/// Stream of full collection snapshots, one item per change.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Vec<PeerRecord>> + Send>>;

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionQuery {
    /// Collection name.
    pub collection: String,
    /// Maximum number of records listed per snapshot (`None` = all).
    pub limit: Option<usize>,
}

impl SubscriptionQuery {
    /// Subscribe to every record of `collection`.
    #[must_use]
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            limit: None,
        }
    }

    /// Subscribe to the shared mice collection.
    #[must_use]
    pub fn mice() -> Self {
        Self::collection(MICE_COLLECTION)
    }

    /// Cap the number of records per snapshot.
    #[must_use]
    pub const fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

/// Peer store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The connection is closed.
    #[error("store connection is closed")]
    Disconnected,

    /// Subscription could not be established.
    #[error("subscription failed: {message}")]
    Subscription {
        /// Error details.
        message: String,
    },

    /// One-shot query failed.
    #[error("query failed: {message}")]
    Query {
        /// Error details.
        message: String,
    },

    /// Mutation was rejected.
    #[error("write failed: {message}")]
    Write {
        /// Error details.
        message: String,
    },
}

/// Port for the replicated peer store.
///
/// Every mutation is idempotent: adding a present member, removing an absent
/// one or re-setting identical fields all succeed. Success only means the
/// store accepted the write; it becomes visible through `subscribe` later.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Subscribe to full snapshots of a collection.
    async fn subscribe(&self, query: SubscriptionQuery) -> Result<SnapshotStream, StoreError>;

    /// Add `id` to `collection`.
    async fn add(&self, collection: &str, id: &PeerId) -> Result<(), StoreError>;

    /// Remove `id` from `collection`. Removing an absent id is a no-op.
    async fn remove(&self, collection: &str, id: &PeerId) -> Result<(), StoreError>;

    /// Write fields of a record, creating it if needed.
    async fn set(&self, id: &PeerId, fields: PeerFields) -> Result<(), StoreError>;

    /// Read a record once.
    async fn query_once(&self, id: &PeerId) -> Result<Option<PeerRecord>, StoreError>;

    /// Current connectivity, polled by the presence manager.
    fn is_connected(&self) -> bool;

    /// Open (or reopen) the upstream connection.
    async fn open(&self) -> Result<(), StoreError>;

    /// Close the upstream connection.
    async fn close(&self);
}
