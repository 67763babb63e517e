//! Transport abstraction under the channel client
//!
//! The transport owns the socket and its retry policy. The channel client only
//! sees a session handle for issuing commands and an ordered stream of events.

use crate::error::Result;
use crate::token::AccessToken;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection lifecycle and data events, in delivery order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A (re)connect attempt started
    Connecting,
    /// The server accepted the connection
    Connected,
    /// The socket dropped; the transport may retry
    Disconnected { reason: String },
    /// Non-fatal transport error
    Error { message: String },
    /// A subscribe command was confirmed
    Subscribed { topic: String },
    /// A subscribe command was rejected
    SubscribeFailed { topic: String, message: String },
    /// The server ended a subscription; it is replayed on the next connect
    Unsubscribed { topic: String, reason: String },
    /// Data published on a subscribed topic
    Publication {
        topic: String,
        data: serde_json::Value,
    },
}

/// Where a transport delivers its events
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Factory for live sessions
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a session authenticated with `token`.
    ///
    /// Returns as soon as the session accepts commands. The socket may still be
    /// connecting; commands issued before it is up are buffered and flushed on
    /// connect.
    async fn open(&self, token: &AccessToken, events: EventSink) -> Result<Arc<dyn TransportSession>>;
}

/// Command side of an open session
pub trait TransportSession: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<()>;

    fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Stop the session for good; no further events are sent
    fn close(&self);
}
