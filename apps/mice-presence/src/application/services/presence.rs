//! Presence Manager
//!
//! Owns one local identity in the shared mice collection and keeps it alive:
//!
//! - registers the identity (`join`) and re-announces it after eviction
//! - pushes throttled position writes, coalescing to the latest position
//! - polls store connectivity
//! - sweeps peers whose records went stale, on a randomized schedule
//!
//! Presence is inferred from the recency of each record's `last_update`, not
//! from explicit heartbeats: every write restamps the record in place.
//!
//! # Tasks
//!
//! All background work hangs off two cancellation tokens:
//!
//! ```text
//! shutdown (caller)
//!   └── session    connectivity poll, snapshot subscription, sweep loop
//!         └── writes   throttled position write, debounced join
//! ```
//!
//! Going offline cancels `writes` only; reset and shutdown cancel `session`.
//! Store writes are fire-and-forget: failures are logged and counted, and the
//! store's own conflict resolution decides the final state.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::sweep::SweepSchedule;
use crate::application::ports::{
    Clock, NoopMetrics, PeerStore, PresenceMetrics, SnapshotStream, StoreError, SubscriptionQuery,
    WriteKind,
};
use crate::domain::peer::{
    Glyph, LocalIdentity, MICE_COLLECTION, PeerFields, PeerId, PeerRecord, PeerSet,
};
use crate::domain::presence::{AbandonmentPolicy, PresenceStatus, TransitionError};

// =============================================================================
// Configuration
// =============================================================================

/// Presence manager configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Shared collection the identity registers in.
    pub collection: String,
    /// Minimum spacing between position writes.
    pub write_interval: Duration,
    /// Quiet period before a movement-triggered join check runs.
    pub join_debounce: Duration,
    /// Connectivity poll interval.
    pub status_poll_interval: Duration,
    /// Shortest delay between sweeps.
    pub sweep_min: Duration,
    /// Longest delay between sweeps.
    pub sweep_max: Duration,
    /// Idle time after which a peer may be evicted.
    pub abandonment_threshold: Duration,
    /// Maximum records per snapshot (`None` = all).
    pub snapshot_limit: Option<usize>,
    /// Remove the own record when going offline.
    pub eager_leave: bool,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self::from_settings(&crate::PresenceSettings::default())
    }
}

impl PresenceConfig {
    /// Create configuration from `PresenceSettings`.
    #[must_use]
    pub fn from_settings(settings: &crate::PresenceSettings) -> Self {
        Self {
            collection: MICE_COLLECTION.to_string(),
            write_interval: settings.write_interval,
            join_debounce: settings.join_debounce,
            status_poll_interval: settings.status_poll_interval,
            sweep_min: settings.sweep_min,
            sweep_max: settings.sweep_min.saturating_mul(2),
            abandonment_threshold: settings.abandonment_threshold,
            snapshot_limit: (settings.snapshot_limit > 0).then_some(settings.snapshot_limit),
            eager_leave: settings.eager_leave,
            event_capacity: 256,
        }
    }
}

// =============================================================================
// Events and Errors
// =============================================================================

/// Events emitted by the presence manager.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Lifecycle status changed.
    StatusChanged(PresenceStatus),
    /// Store connectivity flipped.
    ConnectivityChanged {
        /// New connectivity.
        connected: bool,
    },
    /// A new snapshot of the shared collection arrived.
    PeersChanged {
        /// Number of peers in the snapshot, self included.
        count: usize,
    },
    /// Peers were removed from the collection by this client.
    Evicted(Vec<PeerId>),
}

/// Presence manager error.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    /// The operation needs a started manager.
    #[error("presence manager has not been started")]
    NotStarted,

    /// `start` was called twice.
    #[error("presence manager is already started")]
    AlreadyStarted,

    /// There is no local identity (never started, or reset).
    #[error("no local identity")]
    NoIdentity,

    /// The operation needs the client to be online.
    #[error("presence is offline")]
    Offline,

    /// Illegal lifecycle transition.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// The store rejected a call.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// Shared State
// =============================================================================

#[derive(Debug)]
struct SessionState {
    status: PresenceStatus,
    identity: Option<LocalIdentity>,
    peers: PeerSet,
    connected: bool,
    started: bool,
    sweeping: bool,
    subscribed: bool,
    write_armed: bool,
    position_dirty: bool,
    join_deadline: Option<Instant>,
    session: CancellationToken,
    writes: CancellationToken,
}

impl SessionState {
    fn new(shutdown: &CancellationToken) -> Self {
        let session = shutdown.child_token();
        let writes = session.child_token();
        Self {
            status: PresenceStatus::Offline,
            identity: None,
            peers: PeerSet::default(),
            connected: false,
            started: false,
            sweeping: false,
            subscribed: false,
            write_armed: false,
            position_dirty: false,
            join_deadline: None,
            session,
            writes,
        }
    }

    fn client_label(&self) -> String {
        self.identity
            .as_ref()
            .map_or_else(String::new, |identity| identity.id.to_string())
    }
}

struct Inner {
    config: PresenceConfig,
    store: Arc<dyn PeerStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn PresenceMetrics>,
    policy: AbandonmentPolicy,
    schedule: SweepSchedule,
    shutdown: CancellationToken,
    state: RwLock<SessionState>,
    events: broadcast::Sender<PresenceEvent>,
}

// =============================================================================
// Presence Manager
// =============================================================================

/// Manages the local identity's presence in the shared collection.
///
/// Must be driven from inside a Tokio runtime.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use mice_presence::{MemoryBackend, PresenceConfig, PresenceManager, SystemClock};
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let backend = MemoryBackend::new(Arc::new(SystemClock));
///     let manager = PresenceManager::new(
///         PresenceConfig::default(),
///         Arc::new(backend.connect()),
///         Arc::new(SystemClock),
///         CancellationToken::new(),
///     );
///
///     let id = manager.start().await.unwrap();
///     manager.move_to(120.0, 80.0).unwrap();
///     println!("{id} sees {} peers", manager.handle().peers().len());
/// }
/// ```
pub struct PresenceManager {
    inner: Arc<Inner>,
}

impl PresenceManager {
    /// Create a manager that generates its identity on first start.
    #[must_use]
    pub fn new(
        config: PresenceConfig,
        store: Arc<dyn PeerStore>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        Self::build(config, store, clock, shutdown, None)
    }

    /// Create a manager with a fixed identity.
    #[must_use]
    pub fn with_identity(
        config: PresenceConfig,
        store: Arc<dyn PeerStore>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
        identity: LocalIdentity,
    ) -> Self {
        Self::build(config, store, clock, shutdown, Some(identity))
    }

    fn build(
        config: PresenceConfig,
        store: Arc<dyn PeerStore>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
        identity: Option<LocalIdentity>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let mut state = SessionState::new(&shutdown);
        state.identity = identity;

        Self {
            inner: Arc::new(Inner {
                policy: AbandonmentPolicy::new(config.abandonment_threshold),
                schedule: SweepSchedule::with_bounds(config.sweep_min, config.sweep_max),
                config,
                store,
                clock,
                metrics: Arc::new(NoopMetrics),
                shutdown,
                state: RwLock::new(state),
                events,
            }),
        }
    }

    /// Report activity to `metrics` instead of discarding it.
    ///
    /// Must be called before any handle is taken.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn PresenceMetrics>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.metrics = metrics,
            None => tracing::warn!("Metrics sink ignored; presence manager already shared"),
        }
        self
    }

    /// Introspection handle, cheap to clone and pass around.
    #[must_use]
    pub fn handle(&self) -> PresenceHandle {
        PresenceHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Subscribe to presence events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.inner.events.subscribe()
    }

    /// Bring the identity online: register, subscribe, initialize the record.
    ///
    /// Generates a fresh identity if none exists. Failures of the initial
    /// join, subscription or record query are logged and do not fail startup.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` on a second call and `Store` if the
    /// connection cannot be opened.
    pub async fn start(&self) -> Result<PeerId, PresenceError> {
        let inner = &self.inner;
        let (id, session) = {
            let mut state = inner.state.write();
            if state.started {
                return Err(PresenceError::AlreadyStarted);
            }
            if state.session.is_cancelled() {
                state.session = inner.shutdown.child_token();
                state.writes = state.session.child_token();
            }
            state.status = state.status.transition(PresenceStatus::Joining)?;
            state.started = true;
            let id = state
                .identity
                .get_or_insert_with(LocalIdentity::generate)
                .id
                .clone();
            (id, state.session.clone())
        };
        inner.emit(PresenceEvent::StatusChanged(PresenceStatus::Joining));
        tracing::info!(client = %id, "Starting presence");

        if let Err(e) = inner.store.open().await {
            inner.fall_offline();
            {
                let mut state = inner.state.write();
                state.started = false;
            }
            return Err(e.into());
        }
        inner.spawn_status_poll(session.clone());

        if let Err(e) = inner.join().await {
            tracing::warn!(client = %id, error = %e, "Initial join failed; retrying on movement");
        }

        if let Err(e) = inner.subscribe_peers(session).await {
            tracing::error!(client = %id, error = %e, "Peer subscription failed");
        }

        inner.ensure_symbol(&id).await;
        Ok(id)
    }

    /// Register the local identity unless the current snapshot lists it.
    ///
    /// Returns `true` if an add was issued.
    ///
    /// # Errors
    ///
    /// Returns `NoIdentity`, `Offline`, or the store's error.
    pub async fn join(&self) -> Result<bool, PresenceError> {
        self.inner.join().await
    }

    /// Record a new local position.
    ///
    /// Schedules a debounced join and a throttled write; moves arriving
    /// while a write is pending only replace the position it will carry.
    /// While offline the position is kept and written after reconnecting.
    ///
    /// # Errors
    ///
    /// Returns `NoIdentity` if the manager was never started or was reset.
    pub fn move_to(&self, x: f64, y: f64) -> Result<(), PresenceError> {
        let inner = &self.inner;
        let mut state = inner.state.write();
        let identity = state.identity.as_mut().ok_or(PresenceError::NoIdentity)?;
        identity.x = x;
        identity.y = y;
        state.position_dirty = true;

        if !state.status.is_active() {
            return Ok(());
        }
        inner.schedule_join(&mut state);
        if state.status.accepts_writes() {
            inner.arm_write(&mut state);
        }
        Ok(())
    }

    /// Re-announce the identity if the current snapshot no longer lists it.
    ///
    /// Returns `true` if the record was re-created.
    ///
    /// # Errors
    ///
    /// Returns `NoIdentity`, `Offline`, or the store's error.
    pub async fn mark_seen(&self) -> Result<bool, PresenceError> {
        let inner = &self.inner;
        let (id, fields) = {
            let state = inner.state.read();
            let identity = state.identity.as_ref().ok_or(PresenceError::NoIdentity)?;
            if !state.status.is_active() {
                return Err(PresenceError::Offline);
            }
            if state.peers.contains(&identity.id) {
                return Ok(false);
            }
            (identity.id.clone(), identity.fields())
        };

        inner.join().await?;
        inner.write_fields(&id, fields, WriteKind::Position).await?;
        tracing::info!(client = %id, "Re-announced after eviction");
        Ok(true)
    }

    /// Evict every abandoned peer in the current snapshot, never self.
    ///
    /// Returns the ids the store accepted removals for.
    pub async fn sweep_abandoned(&self) -> Vec<PeerId> {
        self.inner.sweep_abandoned().await
    }

    /// Stop writing and close the connection.
    ///
    /// Pending throttled and debounced writes are dropped. The own record is
    /// left for peers to evict unless `eager_leave` is set.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the lifecycle forbids going offline.
    pub async fn go_offline(&self) -> Result<(), PresenceError> {
        let inner = &self.inner;
        let leave = {
            let mut state = inner.state.write();
            if state.status == PresenceStatus::Offline {
                return Ok(());
            }
            state.status = state.status.transition(PresenceStatus::Offline)?;
            state.writes.cancel();
            state.writes = state.session.child_token();
            state.write_armed = false;
            state.join_deadline = None;
            if inner.config.eager_leave {
                state.identity.as_ref().map(|identity| identity.id.clone())
            } else {
                None
            }
        };
        inner.emit(PresenceEvent::StatusChanged(PresenceStatus::Offline));
        tracing::info!("Presence offline");

        if let Some(id) = leave {
            match inner.store.remove(&inner.config.collection, &id).await {
                Ok(()) => inner.metrics.record_write(WriteKind::Remove),
                Err(e) => {
                    inner.metrics.record_write_error(WriteKind::Remove);
                    tracing::warn!(client = %id, error = %e, "Eager leave failed");
                }
            }
        }

        inner.store.close().await;
        Ok(())
    }

    /// Reopen the connection, rejoin, and rewrite the full record.
    ///
    /// The record may have been evicted while offline, and its stamp is at
    /// least as old as the disconnect, so it is always re-added and
    /// restamped. A subscription that ended while offline is renewed.
    ///
    /// # Errors
    ///
    /// Returns `NotStarted`, `NoIdentity`, `InvalidTransition`, or the store's error.
    pub async fn go_online(&self) -> Result<(), PresenceError> {
        let inner = &self.inner;
        let session = {
            let mut state = inner.state.write();
            if !state.started {
                return Err(PresenceError::NotStarted);
            }
            if state.identity.is_none() {
                return Err(PresenceError::NoIdentity);
            }
            state.status = state.status.transition(PresenceStatus::Joining)?;
            state.session.clone()
        };
        inner.emit(PresenceEvent::StatusChanged(PresenceStatus::Joining));

        if let Err(e) = inner.store.open().await {
            inner.fall_offline();
            return Err(e.into());
        }

        let resubscribe = !inner.state.read().subscribed;
        if resubscribe {
            if let Err(e) = inner.subscribe_peers(session).await {
                tracing::error!(error = %e, "Peer subscription renewal failed");
            }
        }

        let (id, fields) = {
            let mut state = inner.state.write();
            let identity = state.identity.as_ref().ok_or(PresenceError::NoIdentity)?;
            let announce = (identity.id.clone(), identity.fields());
            state.position_dirty = false;
            announce
        };
        if let Err(e) = inner.register(true).await {
            inner.state.write().position_dirty = true;
            return Err(e);
        }
        if let Err(e) = inner.write_fields(&id, fields, WriteKind::Position).await {
            inner.state.write().position_dirty = true;
            return Err(e.into());
        }

        tracing::info!(client = %id, "Presence back online");
        Ok(())
    }

    /// Assign a fresh random glyph to the own record.
    ///
    /// # Errors
    ///
    /// Returns `NoIdentity`, `Offline`, or the store's error.
    pub async fn reroll_symbol(&self) -> Result<String, PresenceError> {
        let inner = &self.inner;
        let id = {
            let state = inner.state.read();
            let identity = state.identity.as_ref().ok_or(PresenceError::NoIdentity)?;
            if !state.status.accepts_writes() {
                return Err(PresenceError::Offline);
            }
            identity.id.clone()
        };

        let glyph = Glyph::random();
        inner
            .write_fields(&id, PeerFields::symbol(glyph.clone()), WriteKind::Symbol)
            .await?;
        inner.adopt_symbol(&id, glyph.clone());
        Ok(glyph)
    }

    /// Forget everything: stop all timers, close the connection, drop the
    /// identity. The next `start` registers a brand-new identity.
    pub async fn reset(&self) {
        let inner = &self.inner;
        let previous = {
            let mut state = inner.state.write();
            state.session.cancel();
            let previous = state.identity.take().map(|identity| identity.id);
            *state = SessionState::new(&inner.shutdown);
            previous
        };
        inner.store.close().await;
        inner.emit(PresenceEvent::StatusChanged(PresenceStatus::Offline));
        tracing::info!(previous = ?previous, "Presence state reset");
    }

    /// Tear down background tasks and close the connection, keeping the
    /// identity. A later `start` resumes with the same id.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let was_active = {
            let mut state = inner.state.write();
            state.session.cancel();
            state.started = false;
            state.sweeping = false;
            state.subscribed = false;
            state.write_armed = false;
            state.join_deadline = None;
            let was_active = state.status.is_active();
            state.status = PresenceStatus::Offline;
            was_active
        };
        inner.store.close().await;
        if was_active {
            inner.emit(PresenceEvent::StatusChanged(PresenceStatus::Offline));
        }
        tracing::debug!("Presence manager shut down");
    }
}

// =============================================================================
// Presence Handle
// =============================================================================

/// Read-mostly view of a running presence manager.
///
/// Handed to whatever needs introspection (renderers, the health server,
/// tests) instead of a global.
#[derive(Clone)]
pub struct PresenceHandle {
    inner: Arc<Inner>,
}

impl PresenceHandle {
    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> PresenceStatus {
        self.inner.state.read().status
    }

    /// Copy of the local identity, if any.
    #[must_use]
    pub fn identity(&self) -> Option<LocalIdentity> {
        self.inner.state.read().identity.clone()
    }

    /// Local record id, if any.
    #[must_use]
    pub fn local_id(&self) -> Option<PeerId> {
        self.inner
            .state
            .read()
            .identity
            .as_ref()
            .map(|identity| identity.id.clone())
    }

    /// Last polled connectivity.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.read().connected
    }

    /// Latest observed peer set.
    #[must_use]
    pub fn peers(&self) -> PeerSet {
        self.inner.state.read().peers.clone()
    }

    /// Subscribe to presence events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.inner.events.subscribe()
    }

    /// Debug helper: remove up to `count` peers other than self.
    ///
    /// # Errors
    ///
    /// Returns `NoIdentity`, `Offline`, or the first store error.
    pub async fn evict_others(&self, count: usize) -> Result<Vec<PeerId>, PresenceError> {
        self.inner.evict_others(count).await
    }
}

impl std::fmt::Debug for PresenceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("PresenceHandle")
            .field("status", &state.status)
            .field("identity", &state.identity)
            .field("connected", &state.connected)
            .field("peers", &state.peers.len())
            .finish()
    }
}

// =============================================================================
// Internals
// =============================================================================

impl Inner {
    fn emit(&self, event: PresenceEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn fall_offline(&self) {
        {
            let mut state = self.state.write();
            state.status = PresenceStatus::Offline;
        }
        self.emit(PresenceEvent::StatusChanged(PresenceStatus::Offline));
    }

    async fn join(self: &Arc<Self>) -> Result<bool, PresenceError> {
        self.register(false).await
    }

    /// Add the identity to the collection, skipping the add when `force` is
    /// unset and the current snapshot already lists it.
    async fn register(self: &Arc<Self>, force: bool) -> Result<bool, PresenceError> {
        let (id, present) = {
            let state = self.state.read();
            let identity = state.identity.as_ref().ok_or(PresenceError::NoIdentity)?;
            if !state.status.is_active() {
                return Err(PresenceError::Offline);
            }
            (identity.id.clone(), !force && state.peers.contains(&identity.id))
        };

        if !present {
            self.store
                .add(&self.config.collection, &id)
                .await
                .inspect_err(|_| self.metrics.record_write_error(WriteKind::Join))?;
            self.metrics.record_write(WriteKind::Join);
            tracing::debug!(client = %id, "Registered in collection");
        }

        self.promote();
        Ok(!present)
    }

    fn promote(self: &Arc<Self>) {
        let promoted = {
            let mut state = self.state.write();
            if state.status == PresenceStatus::Joining {
                state.status = PresenceStatus::Online;
                if state.position_dirty {
                    self.arm_write(&mut state);
                }
                true
            } else {
                false
            }
        };
        if promoted {
            self.emit(PresenceEvent::StatusChanged(PresenceStatus::Online));
            tracing::info!("Presence online");
        }
    }

    /// Trailing debounce: the join runs once no move arrived for `join_debounce`.
    fn schedule_join(self: &Arc<Self>, state: &mut SessionState) {
        let deadline = Instant::now() + self.config.join_debounce;
        let running = state.join_deadline.replace(deadline).is_some();
        if running {
            return;
        }

        let inner = Arc::clone(self);
        let cancel = state.writes.clone();
        tokio::spawn(async move {
            loop {
                let deadline = inner.state.read().join_deadline;
                let Some(deadline) = deadline else {
                    return;
                };
                if Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }

            {
                let mut state = inner.state.write();
                if cancel.is_cancelled() {
                    return;
                }
                state.join_deadline = None;
            }
            if let Err(e) = inner.join().await {
                tracing::debug!(error = %e, "Debounced join skipped");
            }
        });
    }

    /// Throttle: at most one position write per `write_interval`.
    fn arm_write(self: &Arc<Self>, state: &mut SessionState) {
        if state.write_armed {
            self.metrics.record_move_coalesced();
            return;
        }
        state.write_armed = true;

        let inner = Arc::clone(self);
        let cancel = state.writes.clone();
        let delay = self.config.write_interval;
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => inner.flush_position(&cancel).await,
            }
        });
    }

    async fn flush_position(&self, cancel: &CancellationToken) {
        let (id, fields) = {
            let mut state = self.state.write();
            if cancel.is_cancelled() {
                return;
            }
            state.write_armed = false;
            if !state.status.accepts_writes() {
                return;
            }
            let Some((id, x, y)) = state
                .identity
                .as_ref()
                .map(|identity| (identity.id.clone(), identity.x, identity.y))
            else {
                return;
            };
            state.position_dirty = false;
            (id, PeerFields::position(x, y))
        };

        if self.write_fields(&id, fields, WriteKind::Position).await.is_err() {
            self.state.write().position_dirty = true;
        }
    }

    async fn write_fields(
        &self,
        id: &PeerId,
        fields: PeerFields,
        kind: WriteKind,
    ) -> Result<(), StoreError> {
        match self.store.set(id, fields).await {
            Ok(()) => {
                self.metrics.record_write(kind);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_write_error(kind);
                tracing::warn!(client = %id, error = %e, "Record write failed");
                Err(e)
            }
        }
    }

    fn adopt_symbol(&self, id: &PeerId, symbol: String) {
        let mut state = self.state.write();
        if let Some(identity) = state
            .identity
            .as_mut()
            .filter(|identity| identity.id == *id)
        {
            identity.symbol = Some(symbol);
        }
    }

    /// First-time initialization: give the own record a symbol if it has none.
    async fn ensure_symbol(&self, id: &PeerId) {
        match self.store.query_once(id).await {
            Ok(Some(record)) if !record.needs_symbol() => {
                if let Some(symbol) = record.symbol {
                    self.adopt_symbol(id, symbol);
                }
            }
            Ok(_) => {
                let glyph = Glyph::random();
                if self
                    .write_fields(id, PeerFields::symbol(glyph.clone()), WriteKind::Symbol)
                    .await
                    .is_ok()
                {
                    tracing::debug!(client = %id, symbol = %glyph, "Assigned initial symbol");
                    self.adopt_symbol(id, glyph);
                }
            }
            Err(e) => {
                tracing::error!(client = %id, error = %e, "Initial record query failed");
            }
        }
    }

    async fn sweep_abandoned(&self) -> Vec<PeerId> {
        let started = std::time::Instant::now();
        let now = self.clock.now();
        let candidates = {
            let state = self.state.read();
            let Some(identity) = state.identity.as_ref() else {
                tracing::debug!("No local identity; skipping sweep");
                return Vec::new();
            };
            self.policy.abandoned(&state.peers, &identity.id, now)
        };

        let mut evicted = Vec::with_capacity(candidates.len());
        for id in candidates {
            match self.store.remove(&self.config.collection, &id).await {
                Ok(()) => {
                    self.metrics.record_write(WriteKind::Remove);
                    tracing::info!(peer = %id, "Evicted abandoned peer");
                    evicted.push(id);
                }
                Err(e) => {
                    self.metrics.record_write_error(WriteKind::Remove);
                    tracing::warn!(peer = %id, error = %e, "Failed to evict abandoned peer");
                }
            }
        }

        self.metrics.record_sweep(evicted.len(), started.elapsed());
        tracing::debug!(evicted = evicted.len(), "Abandonment sweep finished");
        if !evicted.is_empty() {
            self.emit(PresenceEvent::Evicted(evicted.clone()));
        }
        evicted
    }

    async fn evict_others(&self, count: usize) -> Result<Vec<PeerId>, PresenceError> {
        let victims: Vec<PeerId> = {
            let state = self.state.read();
            let identity = state.identity.as_ref().ok_or(PresenceError::NoIdentity)?;
            if !state.status.accepts_writes() {
                return Err(PresenceError::Offline);
            }
            state
                .peers
                .others(&identity.id)
                .take(count)
                .map(|record| record.id.clone())
                .collect()
        };

        for id in &victims {
            self.store
                .remove(&self.config.collection, id)
                .await
                .inspect_err(|_| self.metrics.record_write_error(WriteKind::Remove))?;
            self.metrics.record_write(WriteKind::Remove);
        }

        tracing::info!(count = victims.len(), "Evicted peers on request");
        if !victims.is_empty() {
            self.emit(PresenceEvent::Evicted(victims.clone()));
        }
        Ok(victims)
    }

    fn apply_snapshot(self: &Arc<Self>, records: Vec<PeerRecord>) {
        let peers = PeerSet::from_snapshot(records);
        let count = peers.len();
        let (client, sweep_session) = {
            let mut state = self.state.write();
            state.peers = peers;
            let first = !state.sweeping;
            state.sweeping = true;
            (state.client_label(), first.then(|| state.session.clone()))
        };

        self.metrics.set_peers(&client, count);
        self.emit(PresenceEvent::PeersChanged { count });

        // The first snapshot triggers an immediate sweep.
        if let Some(session) = sweep_session {
            self.spawn_sweeps(session);
        }
    }

    fn poll_connectivity(&self) {
        let connected = self.store.is_connected();
        let client = {
            let mut state = self.state.write();
            if state.connected == connected {
                return;
            }
            state.connected = connected;
            state.client_label()
        };

        self.metrics.set_connected(&client, connected);
        self.emit(PresenceEvent::ConnectivityChanged { connected });
        if connected {
            tracing::info!(client = %client, "Store connected");
        } else {
            tracing::warn!(client = %client, "Store disconnected");
        }
    }

    fn spawn_status_poll(self: &Arc<Self>, cancel: CancellationToken) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.status_poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("Connectivity poll cancelled");
                        break;
                    }
                    _ = interval.tick() => inner.poll_connectivity(),
                }
            }
        });
    }

    async fn subscribe_peers(
        self: &Arc<Self>,
        session: CancellationToken,
    ) -> Result<(), StoreError> {
        let query = SubscriptionQuery::collection(&self.config.collection)
            .with_limit(self.config.snapshot_limit);
        let stream = self.store.subscribe(query).await?;
        self.state.write().subscribed = true;
        self.spawn_subscription(stream, session);
        Ok(())
    }

    fn spawn_subscription(self: &Arc<Self>, mut stream: SnapshotStream, cancel: CancellationToken) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("Peer subscription cancelled");
                        break;
                    }
                    snapshot = stream.next() => match snapshot {
                        Some(records) => inner.apply_snapshot(records),
                        None => {
                            tracing::warn!("Peer subscription ended; renewing on reconnect");
                            let mut state = inner.state.write();
                            if !cancel.is_cancelled() {
                                state.subscribed = false;
                            }
                            break;
                        }
                    },
                }
            }
        });
    }

    /// Self-rescheduling sweep loop with a fresh random delay each round.
    fn spawn_sweeps(self: &Arc<Self>, cancel: CancellationToken) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let status = inner.state.read().status;
                if status.accepts_writes() {
                    inner.sweep_abandoned().await;
                } else {
                    tracing::debug!(status = %status, "Skipping sweep while not online");
                }

                let delay = inner.schedule.next_delay();
                tracing::debug!(delay_ms = delay.as_millis(), "Next abandonment sweep scheduled");
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("Sweep loop cancelled");
                        break;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::application::ports::{ManualClock, MockPeerStore};
    use chrono::DateTime;

    fn pending_stream() -> SnapshotStream {
        Box::pin(futures::stream::pending())
    }

    fn initialized_record(id: &PeerId) -> PeerRecord {
        let mut record = PeerRecord::new(id.clone(), DateTime::UNIX_EPOCH);
        record.apply(&PeerFields::symbol("\u{2710}"), DateTime::UNIX_EPOCH);
        record
    }

    /// Store that accepts everything and never pushes snapshots.
    fn quiet_store() -> MockPeerStore {
        let mut store = MockPeerStore::new();
        store.expect_open().returning(|| Ok(()));
        store.expect_close().return_const(());
        store.expect_is_connected().return_const(true);
        store.expect_add().returning(|_, _| Ok(()));
        store
            .expect_subscribe()
            .returning(|_| Ok(pending_stream()));
        store
    }

    fn manager_with(store: MockPeerStore) -> PresenceManager {
        PresenceManager::with_identity(
            PresenceConfig::default(),
            Arc::new(store),
            Arc::new(ManualClock::default()),
            CancellationToken::new(),
            LocalIdentity::new(PeerId::new("A")),
        )
    }

    #[test]
    fn config_from_default_settings() {
        let config = PresenceConfig::default();
        assert_eq!(config.collection, "mice");
        assert_eq!(config.write_interval, Duration::from_millis(30));
        assert_eq!(config.sweep_min, Duration::from_secs(60));
        assert_eq!(config.sweep_max, Duration::from_secs(120));
        assert_eq!(config.abandonment_threshold, Duration::from_secs(60));
        assert_eq!(config.snapshot_limit, Some(10));
    }

    #[test]
    fn zero_snapshot_limit_means_unlimited() {
        let settings = crate::PresenceSettings {
            snapshot_limit: 0,
            ..Default::default()
        };
        assert_eq!(PresenceConfig::from_settings(&settings).snapshot_limit, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_query_leaves_identity_without_symbol() {
        let mut store = quiet_store();
        store.expect_query_once().returning(|_| {
            Err(StoreError::Query {
                message: "timeout".to_string(),
            })
        });
        store.expect_set().never();

        let manager = manager_with(store);
        let id = manager.start().await.unwrap();

        assert_eq!(id, PeerId::new("A"));
        assert_eq!(manager.handle().status(), PresenceStatus::Online);
        assert_eq!(manager.handle().identity().unwrap().symbol, None);
    }

    #[tokio::test(start_paused = true)]
    async fn uninitialized_record_gets_a_symbol() {
        let mut store = quiet_store();
        store
            .expect_query_once()
            .returning(|id| Ok(Some(PeerRecord::new(id.clone(), DateTime::UNIX_EPOCH))));
        store
            .expect_set()
            .withf(|_, fields| fields.symbol.as_deref().is_some_and(Glyph::contains))
            .times(1)
            .returning(|_, _| Ok(()));

        let manager = manager_with(store);
        manager.start().await.unwrap();

        let symbol = manager.handle().identity().unwrap().symbol.unwrap();
        assert!(Glyph::contains(&symbol));
    }

    #[tokio::test(start_paused = true)]
    async fn initialized_record_symbol_is_adopted() {
        let mut store = quiet_store();
        store
            .expect_query_once()
            .returning(|id| Ok(Some(initialized_record(id))));
        store.expect_set().never();

        let manager = manager_with(store);
        manager.start().await.unwrap();

        assert_eq!(
            manager.handle().identity().unwrap().symbol.as_deref(),
            Some("\u{2710}")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_keeps_manager_offline() {
        let mut store = MockPeerStore::new();
        store.expect_open().returning(|| Err(StoreError::Disconnected));

        let manager = manager_with(store);
        let err = manager.start().await.unwrap_err();

        assert!(matches!(err, PresenceError::Store(StoreError::Disconnected)));
        assert_eq!(manager.handle().status(), PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_rejected() {
        let mut store = quiet_store();
        store
            .expect_query_once()
            .returning(|id| Ok(Some(initialized_record(id))));

        let manager = manager_with(store);
        manager.start().await.unwrap();
        assert!(matches!(
            manager.start().await,
            Err(PresenceError::AlreadyStarted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_drops_pending_position_write() {
        let mut store = quiet_store();
        store
            .expect_query_once()
            .returning(|id| Ok(Some(initialized_record(id))));
        store.expect_set().never();

        let manager = manager_with(store);
        manager.start().await.unwrap();

        manager.move_to(10.0, 20.0).unwrap();
        manager.go_offline().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(manager.handle().status(), PresenceStatus::Offline);
        let identity = manager.handle().identity().unwrap();
        assert!((identity.x - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_moves_coalesce_into_one_write() {
        let mut store = quiet_store();
        store
            .expect_query_once()
            .returning(|id| Ok(Some(initialized_record(id))));
        store
            .expect_set()
            .withf(|_, fields| *fields == PeerFields::position(9.0, 9.0))
            .times(1)
            .returning(|_, _| Ok(()));

        let manager = manager_with(store);
        manager.start().await.unwrap();

        for i in 0..10 {
            let v = f64::from(i);
            manager.move_to(v, v).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn move_without_identity_is_rejected() {
        let manager = PresenceManager::new(
            PresenceConfig::default(),
            Arc::new(MockPeerStore::new()),
            Arc::new(ManualClock::default()),
            CancellationToken::new(),
        );
        assert!(matches!(
            manager.move_to(1.0, 1.0),
            Err(PresenceError::NoIdentity)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_removal_is_not_reported_as_evicted() {
        let clock = ManualClock::default();
        let mut store = quiet_store();
        store
            .expect_query_once()
            .returning(|id| Ok(Some(initialized_record(id))));
        store.expect_remove().returning(|_, _| {
            Err(StoreError::Write {
                message: "rejected".to_string(),
            })
        });

        let manager = PresenceManager::with_identity(
            PresenceConfig::default(),
            Arc::new(store),
            Arc::new(clock.clone()),
            CancellationToken::new(),
            LocalIdentity::new(PeerId::new("A")),
        );
        manager.start().await.unwrap();
        manager.inner.apply_snapshot(vec![PeerRecord::new(
            PeerId::new("ghost"),
            DateTime::UNIX_EPOCH,
        )]);

        clock.advance(Duration::from_secs(3_600));
        assert!(manager.sweep_abandoned().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn go_online_requires_start() {
        let manager = manager_with(MockPeerStore::new());
        assert!(matches!(
            manager.go_online().await,
            Err(PresenceError::NotStarted)
        ));
    }

    /// Store whose snapshot streams end immediately, counting subscriptions.
    fn closing_stream_store(subscriptions: &Arc<AtomicUsize>) -> MockPeerStore {
        let mut store = MockPeerStore::new();
        store.expect_open().returning(|| Ok(()));
        store.expect_close().return_const(());
        store.expect_is_connected().return_const(true);
        store.expect_add().returning(|_, _| Ok(()));
        store.expect_set().returning(|_, _| Ok(()));
        store
            .expect_query_once()
            .returning(|id| Ok(Some(initialized_record(id))));
        let counter = Arc::clone(subscriptions);
        store.expect_subscribe().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(futures::stream::empty()))
        });
        store
    }

    #[tokio::test(start_paused = true)]
    async fn ended_subscription_is_renewed_on_reconnect() {
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let manager = manager_with(closing_stream_store(&subscriptions));

        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(subscriptions.load(Ordering::SeqCst), 1);

        manager.go_offline().await.unwrap();
        manager.go_online().await.unwrap();

        assert_eq!(subscriptions.load(Ordering::SeqCst), 2);
        assert_eq!(manager.handle().status(), PresenceStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn live_subscription_is_kept_on_reconnect() {
        let mut store = quiet_store();
        store
            .expect_query_once()
            .returning(|id| Ok(Some(initialized_record(id))));
        store.expect_set().returning(|_, _| Ok(()));

        let manager = manager_with(store);
        manager.start().await.unwrap();
        manager.go_offline().await.unwrap();
        manager.go_online().await.unwrap();

        assert!(manager.inner.state.read().subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_always_readds_and_restamps_record() {
        let adds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&adds);
        let mut store = MockPeerStore::new();
        store.expect_open().returning(|| Ok(()));
        store.expect_close().return_const(());
        store.expect_is_connected().return_const(true);
        store
            .expect_subscribe()
            .returning(|_| Ok(pending_stream()));
        store.expect_add().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        store
            .expect_query_once()
            .returning(|id| Ok(Some(initialized_record(id))));
        store
            .expect_set()
            .withf(|id, fields| id.as_str() == "A" && fields.x.is_some() && fields.y.is_some())
            .times(1)
            .returning(|_, _| Ok(()));

        let manager = manager_with(store);
        manager.start().await.unwrap();
        assert_eq!(adds.load(Ordering::SeqCst), 1);

        // The snapshot still lists self, as it would before a peer's sweep lands.
        manager
            .inner
            .apply_snapshot(vec![initialized_record(&PeerId::new("A"))]);

        manager.go_offline().await.unwrap();
        manager.go_online().await.unwrap();

        assert_eq!(adds.load(Ordering::SeqCst), 2);
        assert_eq!(manager.handle().status(), PresenceStatus::Online);
    }

    #[derive(Default)]
    struct RecordingMetrics {
        writes: parking_lot::Mutex<Vec<WriteKind>>,
        coalesced: AtomicUsize,
    }

    impl PresenceMetrics for RecordingMetrics {
        fn record_write(&self, kind: WriteKind) {
            self.writes.lock().push(kind);
        }
        fn record_write_error(&self, _kind: WriteKind) {}
        fn record_move_coalesced(&self) {
            self.coalesced.fetch_add(1, Ordering::SeqCst);
        }
        fn record_sweep(&self, _evicted: usize, _duration: Duration) {}
        fn set_peers(&self, _client: &str, _count: usize) {}
        fn set_connected(&self, _client: &str, _connected: bool) {}
    }

    #[tokio::test(start_paused = true)]
    async fn activity_is_reported_to_metrics_sink() {
        let mut store = quiet_store();
        store
            .expect_query_once()
            .returning(|id| Ok(Some(initialized_record(id))));
        store.expect_set().returning(|_, _| Ok(()));
        let sink = Arc::new(RecordingMetrics::default());

        let manager = manager_with(store).with_metrics(sink.clone());
        manager.start().await.unwrap();
        manager
            .inner
            .apply_snapshot(vec![initialized_record(&PeerId::new("A"))]);
        for i in 0..4 {
            let v = f64::from(i);
            manager.move_to(v, v).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(*sink.writes.lock(), vec![WriteKind::Join, WriteKind::Position]);
        assert_eq!(sink.coalesced.load(Ordering::SeqCst), 3);
    }
}
