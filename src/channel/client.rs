//! Channel client implementation

use super::transport::{Transport, TransportEvent, TransportSession};
use crate::error::{Result, SyncError};
use crate::token::AccessToken;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection state of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection object exists
    Disconnected,
    /// Connection object exists, transport is (re)connecting
    Connecting,
    /// Transport is up
    Connected,
    /// Transport reported a failure and is expected to retry
    Errored,
}

/// Handler for publications on a topic
pub type PublicationHandler = Arc<dyn Fn(&str, serde_json::Value) + Send + Sync>;

/// Handle to the single subscription on a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    topic: String,
    id: Uuid,
    connection_id: Uuid,
}

impl TopicSubscription {
    /// Get the subscribed topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The connection this subscription was created on
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}

struct SubscriptionEntry {
    handle: TopicSubscription,
    handler: PublicationHandler,
}

struct ChannelConnection {
    id: Uuid,
    // None while the transport is still opening
    session: Option<Arc<dyn TransportSession>>,
    dispatcher: JoinHandle<()>,
}

impl ChannelConnection {
    fn shutdown(self) {
        if let Some(session) = self.session {
            session.close();
        }
        self.dispatcher.abort();
    }
}

/// Internal client state
struct ClientInner {
    transport: Arc<dyn Transport>,
    state: watch::Sender<ChannelState>,
    state_rx: watch::Receiver<ChannelState>,

    connection: Mutex<Option<ChannelConnection>>,

    // Topic -> the one subscription on it
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,

    last_error: Mutex<Option<String>>,

    // Serializes ensure_connected so racing callers build one connection
    connect_lock: tokio::sync::Mutex<()>,
}

/// Owner of the persistent realtime connection and its topic subscriptions.
///
/// At most one connection and at most one subscription per topic exist at a
/// time. This struct is cheaply cloneable as it uses an internal Arc.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<ClientInner>,
}

impl ChannelClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);

        let inner = Arc::new(ClientInner {
            transport,
            state: state_tx,
            state_rx,
            connection: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            last_error: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        });

        Self { inner }
    }

    /// Get the current connection state
    pub fn state(&self) -> ChannelState {
        *self.inner.state_rx.borrow()
    }

    /// Get a receiver for connection state changes after this call
    pub fn state_receiver(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Most recent error since the transport last connected
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Id of the live connection object
    pub fn connection_id(&self) -> Option<Uuid> {
        self.inner.connection.lock().as_ref().map(|c| c.id)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.subscriptions.lock().contains_key(topic)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Create and start the connection if none exists; no-op otherwise.
    ///
    /// Does not wait for the transport to report `Connected`.
    pub async fn ensure_connected(&self, token: &AccessToken) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;

        {
            let mut slot = self.inner.connection.lock();
            match slot.as_ref() {
                Some(conn) if conn.session.is_some() => {
                    debug!("Channel connection already exists");
                    return Ok(());
                }
                // An open that was cancelled before it finished; we hold the lock so nobody else is opening
                Some(_) => {
                    if let Some(stale) = slot.take() {
                        debug!(connection_id = %stale.id, "Discarding abandoned connection");
                        stale.shutdown();
                    }
                }
                None => {}
            }
        }

        let connection_id = Uuid::new_v4();
        self.inner.last_error.lock().take();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Register before opening so early events are not taken for stale ones
        let dispatcher = tokio::spawn(dispatch_events(
            Arc::downgrade(&self.inner),
            connection_id,
            events_rx,
        ));
        *self.inner.connection.lock() = Some(ChannelConnection {
            id: connection_id,
            session: None,
            dispatcher,
        });
        self.inner.set_state(ChannelState::Connecting);

        match self.inner.transport.open(token, events_tx).await {
            Ok(session) => {
                let mut slot = self.inner.connection.lock();
                match slot.as_mut() {
                    Some(conn) if conn.id == connection_id => {
                        conn.session = Some(session);
                        info!(%connection_id, "Channel connection opened");
                        Ok(())
                    }
                    _ => {
                        drop(slot);
                        session.close();
                        warn!(%connection_id, "Channel disconnected while opening");
                        Err(SyncError::Shutdown)
                    }
                }
            }
            Err(e) => {
                warn!(%connection_id, error = %e, "Failed to open channel connection");
                if let Some(conn) = self.inner.take_connection(connection_id) {
                    conn.shutdown();
                }
                self.inner.record_error(e.to_string());
                self.inner.set_state(ChannelState::Disconnected);
                Err(SyncError::Connection(e.to_string()))
            }
        }
    }

    /// Subscribe to a topic, reusing the existing subscription if there is one.
    ///
    /// When the topic is already subscribed the handler passed here is not
    /// registered, so publications are never delivered twice.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<TopicSubscription>
    where
        F: Fn(&str, serde_json::Value) + Send + Sync + 'static,
    {
        let connection = self.inner.connection.lock();
        let Some(conn) = connection.as_ref() else {
            return Err(SyncError::NotConnected);
        };
        let Some(session) = conn.session.as_ref() else {
            return Err(SyncError::NotConnected);
        };

        let mut subs = self.inner.subscriptions.lock();
        if let Some(existing) = subs.get(topic) {
            debug!(topic, "Reusing existing subscription");
            return Ok(existing.handle.clone());
        }

        session.subscribe(topic)?;

        let handle = TopicSubscription {
            topic: topic.to_string(),
            id: Uuid::new_v4(),
            connection_id: conn.id,
        };
        subs.insert(
            topic.to_string(),
            SubscriptionEntry {
                handle: handle.clone(),
                handler: Arc::new(handler),
            },
        );

        info!(topic, subscription_id = %handle.id, "Subscribed");
        Ok(handle)
    }

    /// Stop and forget the subscription on `topic`; no-op if absent
    pub fn unsubscribe(&self, topic: &str) {
        let connection = self.inner.connection.lock();
        let Some(entry) = self.inner.subscriptions.lock().remove(topic) else {
            return;
        };

        if let Some(session) = connection.as_ref().and_then(|c| c.session.as_ref()) {
            if let Err(e) = session.unsubscribe(topic) {
                warn!(topic, error = %e, "Failed to send unsubscribe");
            }
        }

        info!(topic, subscription_id = %entry.handle.id, "Unsubscribed");
    }

    /// Tear down the connection and drop every subscription handle
    pub fn disconnect(&self) {
        let taken = {
            let mut connection = self.inner.connection.lock();
            self.inner.subscriptions.lock().clear();
            connection.take()
        };

        if let Some(conn) = taken {
            info!(connection_id = %conn.id, "Channel disconnected");
            conn.shutdown();
        }

        self.inner.set_state(ChannelState::Disconnected);
    }
}

impl ClientInner {
    fn set_state(&self, state: ChannelState) {
        let _ = self.state.send(state);
    }

    fn record_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    /// A held subscription stopped delivering; surface it until the next connect
    fn subscription_lost(&self, topic: &str, message: String) {
        if !self.subscriptions.lock().contains_key(topic) {
            return;
        }
        self.record_error(message);
        self.set_state(ChannelState::Errored);
    }

    fn is_current(&self, connection_id: Uuid) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| c.id == connection_id)
    }

    fn take_connection(&self, connection_id: Uuid) -> Option<ChannelConnection> {
        let mut slot = self.connection.lock();
        if slot.as_ref().is_some_and(|c| c.id == connection_id) {
            slot.take()
        } else {
            None
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting => self.set_state(ChannelState::Connecting),
            TransportEvent::Connected => {
                info!("Channel connected");
                self.last_error.lock().take();
                self.set_state(ChannelState::Connected);
            }
            TransportEvent::Disconnected { reason } => {
                warn!(%reason, "Channel dropped, transport will retry");
                self.record_error(reason);
                self.set_state(ChannelState::Errored);
            }
            TransportEvent::Error { message } => {
                warn!(%message, "Channel error");
                self.record_error(message);
                self.set_state(ChannelState::Errored);
            }
            TransportEvent::Subscribed { topic } => {
                debug!(%topic, "Subscription confirmed");
            }
            TransportEvent::SubscribeFailed { topic, message } => {
                warn!(%topic, %message, "Subscription rejected");
                self.subscription_lost(&topic, format!("subscription to {} rejected: {}", topic, message));
            }
            TransportEvent::Unsubscribed { topic, reason } => {
                warn!(%topic, %reason, "Subscription ended by server");
                self.subscription_lost(&topic, format!("subscription to {} ended: {}", topic, reason));
            }
            TransportEvent::Publication { topic, data } => {
                let handler = self
                    .subscriptions
                    .lock()
                    .get(&topic)
                    .map(|entry| entry.handler.clone());

                match handler {
                    Some(handler) => handler(&topic, data),
                    None => debug!(%topic, "Publication for unknown topic dropped"),
                }
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.get_mut().take() {
            conn.shutdown();
        }
    }
}

/// Apply events for one connection in delivery order until it is replaced
async fn dispatch_events(
    inner: Weak<ClientInner>,
    connection_id: Uuid,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.is_current(connection_id) {
            break;
        }
        inner.handle_event(event);
    }
    debug!(%connection_id, "Event dispatcher stopped");
}
