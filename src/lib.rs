//! occupi-rtc - live office occupancy counter over a realtime channel
//!
//! Keeps one persistent pub/sub connection per process, shared by every
//! mounted consumer. Consumers are primed from the count endpoint and then
//! follow publications on the counter topic in delivery order.
//!
//! # Example
//!
//! ```no_run
//! use occupi_rtc::{CounterSubscriptionManager, CounterUpdate, SyncConfig};
//!
//! # async fn example() -> occupi_rtc::Result<()> {
//! let config = SyncConfig::from_env().session_token("session-token");
//! let manager = CounterSubscriptionManager::from_config(&config)?;
//!
//! let mut consumer = manager.mount();
//! consumer.activate().await?;
//!
//! while let Some(update) = consumer.next_update().await {
//!     if let CounterUpdate::Live(count) = update {
//!         println!("{} people in the office", count);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod manager;
pub mod snapshot;
pub mod token;

pub use api::{CheckResponse, OccupancyApi};
pub use channel::{ChannelClient, ChannelState, TopicSubscription, Transport, TransportEvent, TransportSession};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use manager::{CounterConsumer, CounterStatus, CounterSubscriptionManager, CounterUpdate};
pub use snapshot::{CountSnapshotFetcher, CountSource};
pub use token::{AccessToken, FileTokenStore, MemoryTokenStore, TokenMinter, TokenProvider, TokenStore};
