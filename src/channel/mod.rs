//! Persistent realtime channel
//!
//! This module provides:
//! - `ChannelClient`: the one connection per client and its topic subscriptions
//! - `Transport`: the seam under the client, with a WebSocket implementation
//! - `protocol`: JSON wire frames for the pub/sub service

mod client;
pub mod protocol;
mod transport;
mod websocket;

pub use client::{ChannelClient, ChannelState, PublicationHandler, TopicSubscription};
pub use transport::{EventSink, Transport, TransportEvent, TransportSession};
pub use websocket::WebSocketTransport;
