//! Counter subscription manager
//!
//! Shares one channel connection and one counter subscription between any
//! number of mounted consumers. The connection lives while at least one
//! consumer holds a reference and is torn down when the last one leaves.

use crate::api::OccupancyApi;
use crate::channel::{ChannelClient, ChannelState, TopicSubscription, WebSocketTransport};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::snapshot::CountSnapshotFetcher;
use crate::token::{FileTokenStore, TokenProvider, TokenStore};

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection health as seen by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterStatus {
    /// Waiting for the channel to come up
    Connecting,
    /// Receiving live publications
    Live,
    /// Showing the last known count while the transport reconnects
    Stale { reason: String },
}

/// What a consumer observes, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterUpdate {
    /// Initial value from the count endpoint (0 if it was unavailable)
    Snapshot(u64),
    /// Value from a publication on the counter topic
    Live(u64),
    Status(CounterStatus),
}

/// Read a counter value out of a publication payload.
///
/// Accepts `{"counter": n}`, `{"value": n}` or a bare integer. Negative values
/// clamp to 0.
pub fn parse_counter(data: &Value) -> Option<u64> {
    let value = match data {
        Value::Object(map) => map.get("counter").or_else(|| map.get("value"))?,
        other => other,
    };
    value
        .as_u64()
        .or_else(|| value.as_i64().map(|n| n.max(0) as u64))
}

/// State a consumer shares with the manager
struct ConsumerShared {
    id: Uuid,
    value: AtomicU64,
    status: Mutex<CounterStatus>,
    updates: Mutex<Option<mpsc::UnboundedSender<CounterUpdate>>>,
    // Set once, under the manager lock
    detached: AtomicBool,
}

impl ConsumerShared {
    /// Apply an update; no-op once the consumer is closed
    fn push(&self, update: CounterUpdate) {
        let updates = self.updates.lock();
        let Some(tx) = updates.as_ref() else {
            return;
        };
        match &update {
            CounterUpdate::Snapshot(n) | CounterUpdate::Live(n) => {
                self.value.store(*n, Ordering::SeqCst)
            }
            CounterUpdate::Status(status) => *self.status.lock() = status.clone(),
        }
        // Consumer may have stopped reading
        let _ = tx.send(update);
    }

    fn close(&self) {
        self.updates.lock().take();
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

/// A consumer's hold on the shared connection
enum Holder {
    /// Counted, but not yet receiving publications
    Reserved,
    Active(Arc<ConsumerShared>),
}

#[derive(Default)]
struct ManagerState {
    holders: HashMap<Uuid, Holder>,
    subscription: Option<TopicSubscription>,
    status_watcher: Option<JoinHandle<()>>,
}

struct ManagerInner {
    tokens: TokenProvider,
    channel: ChannelClient,
    snapshot: CountSnapshotFetcher,
    topic: String,
    state: Mutex<ManagerState>,
}

/// Orchestrates token, connection, snapshot and subscription for consumers.
///
/// This struct is cheaply cloneable as it uses an internal Arc.
#[derive(Clone)]
pub struct CounterSubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl CounterSubscriptionManager {
    pub fn new(
        tokens: TokenProvider,
        channel: ChannelClient,
        snapshot: CountSnapshotFetcher,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                tokens,
                channel,
                snapshot,
                topic: topic.into(),
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// Wire the production collaborators from configuration
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let api = Arc::new(OccupancyApi::new(config)?);

        let store: Arc<dyn TokenStore> = match &config.token_cache_path {
            Some(path) => Arc::new(FileTokenStore::new(path)),
            None => Arc::new(FileTokenStore::in_config_dir()?),
        };

        Ok(Self::new(
            TokenProvider::new(store, api.clone()),
            ChannelClient::new(Arc::new(WebSocketTransport::new(config.clone()))),
            CountSnapshotFetcher::new(api, config.operation_timeout),
            config.topic.clone(),
        ))
    }

    /// Create a consumer. No I/O happens until it is activated.
    pub fn mount(&self) -> CounterConsumer {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConsumerShared {
            id: Uuid::new_v4(),
            value: AtomicU64::new(0),
            status: Mutex::new(CounterStatus::Connecting),
            updates: Mutex::new(Some(tx)),
            detached: AtomicBool::new(false),
        });
        debug!(consumer_id = %shared.id, "Consumer mounted");

        CounterConsumer {
            manager: self.clone(),
            shared,
            updates: rx,
            activation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn channel(&self) -> &ChannelClient {
        &self.inner.channel
    }

    pub fn tokens(&self) -> &TokenProvider {
        &self.inner.tokens
    }

    /// Number of consumers holding the connection
    pub fn ref_count(&self) -> usize {
        self.inner.state.lock().holders.len()
    }

    /// Whether the manager holds the counter subscription
    pub fn is_subscribed(&self) -> bool {
        self.inner.state.lock().subscription.is_some()
    }
}

impl ManagerInner {
    async fn activate(self: &Arc<Self>, shared: &Arc<ConsumerShared>) -> Result<()> {
        let consumer_id = shared.id;

        let token = self.tokens.resolve_token().await?;

        let mut reservation = self.reserve(shared)?;

        if let Err(e) = self.channel.ensure_connected(&token).await {
            drop(reservation);
            if shared.is_detached() {
                return Err(SyncError::Detached);
            }
            return Err(e);
        }

        let count = self.snapshot.fetch_current_count().await;

        let mut state = self.state.lock();
        if !matches!(state.holders.get(&consumer_id), Some(Holder::Reserved)) {
            // Deactivated while we were suspended
            reservation.disarm();
            debug!(%consumer_id, "Activation abandoned");
            return Err(SyncError::Detached);
        }

        if state.subscription.is_none() {
            debug_assert!(
                !self.channel.is_subscribed(&self.topic),
                "counter topic subscribed without a manager handle"
            );

            let weak = Arc::downgrade(self);
            let subscription = match self.channel.subscribe(&self.topic, move |topic, data| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_publication(topic, &data);
                }
            }) {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(%consumer_id, error = %e, "Failed to subscribe to counter topic");
                    state.holders.remove(&consumer_id);
                    reservation.disarm();
                    if state.holders.is_empty() {
                        self.teardown(&mut state);
                    }
                    return Err(e);
                }
            };

            state.status_watcher = Some(tokio::spawn(watch_status(
                Arc::downgrade(self),
                self.channel.state_receiver(),
            )));
            info!(topic = %self.topic, subscription_id = %subscription.id(), "Counter subscription opened");
            state.subscription = Some(subscription);
        }

        shared.push(CounterUpdate::Snapshot(count));
        shared.push(CounterUpdate::Status(self.status_for(self.channel.state())));
        state.holders.insert(consumer_id, Holder::Active(shared.clone()));
        reservation.disarm();

        info!(%consumer_id, count, refs = state.holders.len(), "Consumer activated");
        Ok(())
    }

    /// Count the consumer before the connection is touched
    fn reserve(&self, shared: &ConsumerShared) -> Result<Reservation<'_>> {
        let mut state = self.state.lock();
        if shared.is_detached() {
            return Err(SyncError::Detached);
        }
        state.holders.insert(shared.id, Holder::Reserved);
        debug!(consumer_id = %shared.id, refs = state.holders.len(), "Reference reserved");

        Ok(Reservation {
            inner: self,
            consumer_id: shared.id,
            armed: true,
        })
    }

    /// Drop a reservation that never became active
    fn release(&self, consumer_id: Uuid) {
        let mut state = self.state.lock();
        if !matches!(state.holders.get(&consumer_id), Some(Holder::Reserved)) {
            return;
        }
        state.holders.remove(&consumer_id);
        debug!(%consumer_id, refs = state.holders.len(), "Reference released");

        if state.holders.is_empty() {
            self.teardown(&mut state);
        }
    }

    fn deactivate(&self, shared: &ConsumerShared) {
        let mut state = self.state.lock();
        if shared.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.close();

        if state.holders.remove(&shared.id).is_none() {
            debug!(consumer_id = %shared.id, "Inactive consumer detached");
            return;
        }
        info!(consumer_id = %shared.id, refs = state.holders.len(), "Consumer deactivated");

        if state.holders.is_empty() {
            self.teardown(&mut state);
        }
    }

    /// Last reference gone: unsubscribe, then disconnect
    fn teardown(&self, state: &mut ManagerState) {
        if let Some(watcher) = state.status_watcher.take() {
            watcher.abort();
        }
        if let Some(subscription) = state.subscription.take() {
            self.channel.unsubscribe(subscription.topic());
        }
        self.channel.disconnect();
        info!(topic = %self.topic, "No consumers left, channel disconnected");
    }

    fn on_publication(&self, topic: &str, data: &Value) {
        let Some(count) = parse_counter(data) else {
            warn!(topic, payload = %data, "Ignoring publication without a counter value");
            return;
        };
        debug!(topic, count, "Counter publication");
        self.broadcast(CounterUpdate::Live(count));
    }

    /// Deliver to every active consumer; detached ones are no longer in the table
    fn broadcast(&self, update: CounterUpdate) {
        let state = self.state.lock();
        for holder in state.holders.values() {
            if let Holder::Active(shared) = holder {
                shared.push(update.clone());
            }
        }
    }

    fn status_for(&self, state: ChannelState) -> CounterStatus {
        match state {
            ChannelState::Connected => CounterStatus::Live,
            // A retry after a failure is still stale until it connects
            ChannelState::Connecting => match self.channel.last_error() {
                Some(error) => CounterStatus::Stale {
                    reason: format!("reconnecting: {}", error),
                },
                None => CounterStatus::Connecting,
            },
            ChannelState::Errored => CounterStatus::Stale {
                reason: self
                    .channel
                    .last_error()
                    .unwrap_or_else(|| "connection error".to_string()),
            },
            ChannelState::Disconnected => CounterStatus::Stale {
                reason: "disconnected".to_string(),
            },
        }
    }
}

/// Undoes a reservation unless activation completes
struct Reservation<'a> {
    inner: &'a ManagerInner,
    consumer_id: Uuid,
    armed: bool,
}

impl Reservation<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release(self.consumer_id);
        }
    }
}

/// Forward channel state changes to consumers while the subscription is held
async fn watch_status(inner: Weak<ManagerInner>, mut states: watch::Receiver<ChannelState>) {
    while states.changed().await.is_ok() {
        let state = *states.borrow_and_update();
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let status = inner.status_for(state);
        debug!(?state, ?status, "Channel state changed");
        inner.broadcast(CounterUpdate::Status(status));
    }
}

/// One mounted consumer of the live counter.
///
/// Dropping the consumer deactivates it.
pub struct CounterConsumer {
    manager: CounterSubscriptionManager,
    shared: Arc<ConsumerShared>,
    updates: mpsc::UnboundedReceiver<CounterUpdate>,
    activation: tokio::sync::Mutex<()>,
}

impl CounterConsumer {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Resolve the token, connect, prime from the snapshot and subscribe.
    ///
    /// A no-op when already active. Fails with `Detached` after `deactivate`.
    pub async fn activate(&self) -> Result<()> {
        let _guard = self.activation.lock().await;

        if self.shared.is_detached() {
            return Err(SyncError::Detached);
        }
        if self.is_active() {
            return Ok(());
        }

        self.manager.inner.activate(&self.shared).await
    }

    /// Release this consumer's reference. Idempotent.
    pub fn deactivate(&self) {
        self.manager.inner.deactivate(&self.shared);
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.manager.inner.state.lock().holders.get(&self.shared.id),
            Some(Holder::Active(_))
        )
    }

    /// Latest counter value
    pub fn value(&self) -> u64 {
        self.shared.value.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> CounterStatus {
        self.shared.status.lock().clone()
    }

    /// Next update in delivery order; `None` once deactivated and drained
    pub async fn next_update(&mut self) -> Option<CounterUpdate> {
        self.updates.recv().await
    }

    /// Next update if one is already queued
    pub fn try_next_update(&mut self) -> Option<CounterUpdate> {
        self.updates.try_recv().ok()
    }
}

impl Drop for CounterConsumer {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl std::fmt::Debug for CounterConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterConsumer")
            .field("id", &self.shared.id)
            .field("value", &self.value())
            .field("detached", &self.shared.is_detached())
            .finish()
    }
}
