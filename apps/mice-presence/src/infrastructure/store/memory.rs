//! In-memory peer store.
//!
//! Every client gets its own `MemoryConnection` onto one shared
//! `MemoryBackend`, so several presence managers in one process see each
//! other exactly as they would through a replicated store: membership in
//! named collections, per-record field writes, and full-snapshot
//! subscriptions. Writes apply immediately; there is no merge logic.
//!
//! Record stamps are monotonic per id: a write whose clock reading is not
//! later than the previous stamp lands one millisecond after it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::application::ports::{
    Clock, PeerStore, SnapshotStream, StoreError, SubscriptionQuery,
};
use crate::domain::peer::{PeerFields, PeerId, PeerRecord};

#[derive(Default)]
struct BackendState {
    records: HashMap<PeerId, PeerRecord>,
    /// Collection name to members, in insertion order.
    collections: HashMap<String, Vec<PeerId>>,
    watchers: HashMap<String, watch::Sender<Vec<PeerRecord>>>,
}

impl BackendState {
    fn snapshot(&self, collection: &str) -> Vec<PeerRecord> {
        self.collections
            .get(collection)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| self.records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn publish(&self, collection: &str) {
        if let Some(sender) = self.watchers.get(collection) {
            sender.send_replace(self.snapshot(collection));
        }
    }

    fn publish_containing(&self, id: &PeerId) {
        for (name, members) in &self.collections {
            if members.contains(id) {
                self.publish(name);
            }
        }
    }
}

struct BackendInner {
    clock: Arc<dyn Clock>,
    state: RwLock<BackendState>,
}

impl BackendInner {
    fn next_stamp(&self, previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let now = self.clock.now();
        match previous {
            Some(previous) if previous >= now => previous + TimeDelta::milliseconds(1),
            _ => now,
        }
    }
}

/// Shared in-memory store.
///
/// Cheap to clone; clones share the same data.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl MemoryBackend {
    /// Create an empty store stamping writes with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                clock,
                state: RwLock::new(BackendState::default()),
            }),
        }
    }

    /// Open a new, initially closed, client connection.
    #[must_use]
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            backend: self.clone(),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Look up a record regardless of collection membership.
    #[must_use]
    pub fn record(&self, id: &PeerId) -> Option<PeerRecord> {
        self.inner.state.read().records.get(id).cloned()
    }

    /// Members of a collection, in insertion order.
    #[must_use]
    pub fn members(&self, collection: &str) -> Vec<PeerId> {
        self.inner
            .state
            .read()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Current full snapshot of a collection, ignoring any limit.
    #[must_use]
    pub fn snapshot(&self, collection: &str) -> Vec<PeerRecord> {
        self.inner.state.read().snapshot(collection)
    }

    fn subscribe(&self, query: &SubscriptionQuery) -> watch::Receiver<Vec<PeerRecord>> {
        let mut state = self.inner.state.write();
        if let Some(sender) = state.watchers.get(&query.collection) {
            return sender.subscribe();
        }
        let (sender, receiver) = watch::channel(state.snapshot(&query.collection));
        state.watchers.insert(query.collection.clone(), sender);
        receiver
    }

    fn add(&self, collection: &str, id: &PeerId) {
        let mut state = self.inner.state.write();
        if !state.records.contains_key(id) {
            let stamp = self.inner.next_stamp(None);
            state
                .records
                .insert(id.clone(), PeerRecord::new(id.clone(), stamp));
        }

        let members = state.collections.entry(collection.to_string()).or_default();
        if members.contains(id) {
            return;
        }
        members.push(id.clone());
        state.publish(collection);
    }

    fn remove(&self, collection: &str, id: &PeerId) {
        let mut state = self.inner.state.write();
        let Some(members) = state.collections.get_mut(collection) else {
            return;
        };
        let before = members.len();
        members.retain(|member| member != id);
        if members.len() != before {
            state.publish(collection);
        }
    }

    fn set(&self, id: &PeerId, fields: &PeerFields) {
        let mut state = self.inner.state.write();
        let previous = state.records.get(id).map(|record| record.last_update);
        let stamp = self.inner.next_stamp(previous);
        state
            .records
            .entry(id.clone())
            .or_insert_with(|| PeerRecord::new(id.clone(), stamp))
            .apply(fields, stamp);
        state.publish_containing(id);
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("MemoryBackend")
            .field("records", &state.records.len())
            .field("collections", &state.collections.len())
            .finish_non_exhaustive()
    }
}

/// One client's connection to a `MemoryBackend`.
///
/// Calls fail with `StoreError::Disconnected` while the connection is
/// closed. Subscriptions outlive a close, like a local replica cache.
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    backend: MemoryBackend,
    connected: Arc<AtomicBool>,
}

impl MemoryConnection {
    /// The backend this connection talks to.
    #[must_use]
    pub const fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Disconnected)
        }
    }
}

#[async_trait]
impl PeerStore for MemoryConnection {
    async fn subscribe(&self, query: SubscriptionQuery) -> Result<SnapshotStream, StoreError> {
        self.ensure_connected()?;
        let receiver = self.backend.subscribe(&query);
        let limit = query.limit;
        let stream = WatchStream::new(receiver).map(move |mut records| {
            if let Some(limit) = limit {
                records.truncate(limit);
            }
            records
        });
        Ok(Box::pin(stream))
    }

    async fn add(&self, collection: &str, id: &PeerId) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.backend.add(collection, id);
        Ok(())
    }

    async fn remove(&self, collection: &str, id: &PeerId) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.backend.remove(collection, id);
        Ok(())
    }

    async fn set(&self, id: &PeerId, fields: PeerFields) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.backend.set(id, &fields);
        Ok(())
    }

    async fn query_once(&self, id: &PeerId) -> Result<Option<PeerRecord>, StoreError> {
        self.ensure_connected()?;
        Ok(self.backend.record(id))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn open(&self) -> Result<(), StoreError> {
        if !self.connected.swap(true, Ordering::AcqRel) {
            tracing::debug!("Memory store connection opened");
        }
        Ok(())
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::debug!("Memory store connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::assert_ok;

    use super::*;
    use crate::application::ports::ManualClock;
    use crate::domain::peer::MICE_COLLECTION;

    async fn open_connection(clock: &ManualClock) -> (MemoryBackend, MemoryConnection) {
        let backend = MemoryBackend::new(Arc::new(clock.clone()));
        let connection = backend.connect();
        connection.open().await.unwrap();
        (backend, connection)
    }

    #[tokio::test]
    async fn closed_connection_rejects_calls() {
        let backend = MemoryBackend::new(Arc::new(ManualClock::default()));
        let connection = backend.connect();
        let id = PeerId::new("A");

        assert!(!connection.is_connected());
        assert_eq!(
            connection.add(MICE_COLLECTION, &id).await,
            Err(StoreError::Disconnected)
        );
        assert_eq!(
            connection.query_once(&id).await,
            Err(StoreError::Disconnected)
        );
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let (backend, connection) = open_connection(&ManualClock::default()).await;
        let id = PeerId::new("A");

        connection.add(MICE_COLLECTION, &id).await.unwrap();
        connection.add(MICE_COLLECTION, &id).await.unwrap();

        assert_eq!(backend.members(MICE_COLLECTION), vec![id.clone()]);
        assert_eq!(backend.record(&id).unwrap().version, 0);
    }

    #[tokio::test]
    async fn removing_absent_member_succeeds() {
        let (backend, connection) = open_connection(&ManualClock::default()).await;
        let id = PeerId::new("ghost");

        assert_ok!(connection.remove(MICE_COLLECTION, &id).await);
        connection.add(MICE_COLLECTION, &id).await.unwrap();
        assert_ok!(connection.remove(MICE_COLLECTION, &id).await);
        assert_ok!(connection.remove(MICE_COLLECTION, &id).await);

        assert!(backend.members(MICE_COLLECTION).is_empty());
        // Membership goes, the record stays.
        assert!(backend.record(&id).is_some());
    }

    #[tokio::test]
    async fn stamps_increase_when_clock_stalls() {
        let clock = ManualClock::default();
        let (backend, connection) = open_connection(&clock).await;
        let id = PeerId::new("A");

        connection.set(&id, PeerFields::position(1.0, 1.0)).await.unwrap();
        let first = backend.record(&id).unwrap().last_update;
        connection.set(&id, PeerFields::position(2.0, 2.0)).await.unwrap();
        let second = backend.record(&id).unwrap().last_update;

        assert_eq!(second - first, TimeDelta::milliseconds(1));

        clock.advance(Duration::from_secs(5));
        connection.set(&id, PeerFields::position(3.0, 3.0)).await.unwrap();
        let third = backend.record(&id).unwrap();
        assert_eq!(third.last_update, clock.now());
        assert_eq!(third.version, 3);
    }

    #[tokio::test]
    async fn subscription_delivers_current_and_later_snapshots() {
        let (_backend, connection) = open_connection(&ManualClock::default()).await;
        let mut stream = connection.subscribe(SubscriptionQuery::mice()).await.unwrap();

        assert!(stream.next().await.unwrap().is_empty());

        connection.add(MICE_COLLECTION, &PeerId::new("A")).await.unwrap();
        let snapshot = stream.next().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, PeerId::new("A"));
    }

    #[tokio::test]
    async fn field_writes_reach_subscribers() {
        let (_backend, connection) = open_connection(&ManualClock::default()).await;
        let id = PeerId::new("A");
        connection.add(MICE_COLLECTION, &id).await.unwrap();

        let mut stream = connection.subscribe(SubscriptionQuery::mice()).await.unwrap();
        stream.next().await.unwrap();

        connection.set(&id, PeerFields::position(4.0, 2.0)).await.unwrap();
        let snapshot = stream.next().await.unwrap();
        assert_eq!(snapshot[0].x, 4.0);
        assert_eq!(snapshot[0].y, 2.0);
    }

    #[tokio::test]
    async fn subscription_limit_truncates_snapshot() {
        let (backend, connection) = open_connection(&ManualClock::default()).await;
        for i in 0..5 {
            connection
                .add(MICE_COLLECTION, &PeerId::new(format!("m{i}")))
                .await
                .unwrap();
        }

        let mut stream = connection
            .subscribe(SubscriptionQuery::mice().with_limit(Some(3)))
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().len(), 3);
        assert_eq!(backend.snapshot(MICE_COLLECTION).len(), 5);
    }

    #[tokio::test]
    async fn connections_share_one_backend() {
        let (backend, first) = open_connection(&ManualClock::default()).await;
        let second = backend.connect();
        second.open().await.unwrap();

        first.add(MICE_COLLECTION, &PeerId::new("A")).await.unwrap();
        assert!(second.query_once(&PeerId::new("A")).await.unwrap().is_some());

        second.close().await;
        assert!(first.is_connected());
        assert!(!second.is_connected());
    }
}
