//! One-shot read of the current occupancy count

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Authoritative source of the current count
#[async_trait]
pub trait CountSource: Send + Sync {
    async fn current_count(&self) -> Result<u64>;
}

/// Primes consumer state before live updates arrive.
///
/// Any failure degrades to `0`. The live subscription corrects the value
/// shortly after, so callers must treat a zero as provisional.
pub struct CountSnapshotFetcher {
    source: Arc<dyn CountSource>,
    timeout: Duration,
}

impl CountSnapshotFetcher {
    pub fn new(source: Arc<dyn CountSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    pub async fn fetch_current_count(&self) -> u64 {
        match self.try_fetch().await {
            Ok(count) => {
                debug!(count, "Fetched count snapshot");
                count
            }
            Err(e) => {
                warn!(error = %e, "Count snapshot unavailable, starting from 0");
                0
            }
        }
    }

    async fn try_fetch(&self) -> Result<u64> {
        match timeout(self.timeout, self.source.current_count()).await {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(e)) => Err(SyncError::SnapshotFetchFailed(e.to_string())),
            Err(_) => Err(SyncError::SnapshotFetchFailed(SyncError::Timeout.to_string())),
        }
    }
}
