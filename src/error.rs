//! Error types for the occupancy sync client

use thiserror::Error;

/// Errors that can occur while synchronizing the occupancy counter
#[derive(Error, Debug)]
pub enum SyncError {
    /// The authentication collaborator could not mint a realtime token
    #[error("Token acquisition failed: {0}")]
    TokenAcquisitionFailed(String),

    /// The current count could not be read (never escapes the snapshot fetcher)
    #[error("Snapshot fetch failed: {0}")]
    SnapshotFetchFailed(String),

    /// Connection to the realtime service failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// WebSocket level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// No live channel connection
    #[error("Not connected")]
    NotConnected,

    /// Token cache could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A configured URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Failed to serialize/deserialize a payload
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// The consumer was deactivated and cannot be used again
    #[error("Consumer detached")]
    Detached,

    /// The client has been shut down
    #[error("Client shut down")]
    Shutdown,
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
