//! Day-scoped token resolution

use super::{redact, AccessToken, Clock, SystemClock, TokenStore};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Authentication collaborator that mints realtime tokens
#[async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint_token(&self) -> Result<String>;
}

/// Hands out a token that is valid today, minting at most once per day
pub struct TokenProvider {
    store: Arc<dyn TokenStore>,
    minter: Arc<dyn TokenMinter>,
    clock: Arc<dyn Clock>,
    // Last token minted by this process; survives a store that cannot persist
    minted: parking_lot::Mutex<Option<AccessToken>>,
    // Serializes resolves so racing callers share one mint
    mint_lock: Mutex<()>,
    force_refresh: AtomicBool,
}

impl TokenProvider {
    pub fn new(store: Arc<dyn TokenStore>, minter: Arc<dyn TokenMinter>) -> Self {
        Self::with_clock(store, minter, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn TokenStore>,
        minter: Arc<dyn TokenMinter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            minter,
            clock,
            minted: parking_lot::Mutex::new(None),
            mint_lock: Mutex::new(()),
            force_refresh: AtomicBool::new(false),
        }
    }

    /// Return the cached token if it was minted today, otherwise mint and cache a new one
    pub async fn resolve_token(&self) -> Result<AccessToken> {
        let _guard = self.mint_lock.lock().await;
        let today = self.clock.today();

        if !self.force_refresh.load(Ordering::SeqCst) {
            let minted = self.minted.lock().clone();
            if let Some(token) = minted.filter(|t| t.is_valid_on(today)) {
                debug!(issued_date = %token.issued_date, "Using realtime token minted by this process");
                return Ok(token);
            }

            match self.store.get_token().await {
                Ok(Some(token)) if token.is_valid_on(today) => {
                    debug!(issued_date = %token.issued_date, "Using cached realtime token");
                    return Ok(token);
                }
                Ok(Some(token)) => {
                    info!(issued_date = %token.issued_date, %today, "Cached realtime token is stale");
                }
                Ok(None) => debug!("No cached realtime token"),
                Err(e) => warn!(error = %e, "Token cache unreadable, minting a new token"),
            }
        }

        let value = self
            .minter
            .mint_token()
            .await
            .map_err(|e| match e {
                SyncError::TokenAcquisitionFailed(_) => e,
                other => SyncError::TokenAcquisitionFailed(other.to_string()),
            })?;

        if value.is_empty() {
            return Err(SyncError::TokenAcquisitionFailed(
                "authentication service returned an empty token".into(),
            ));
        }

        if let Err(e) = self.store.set_token(&value, today).await {
            // The token is still usable for this process
            warn!(error = %e, "Failed to persist realtime token");
        }
        self.force_refresh.store(false, Ordering::SeqCst);

        info!(token = %redact(&value), issued_date = %today, "Minted realtime token");
        let token = AccessToken::new(value, today);
        *self.minted.lock() = Some(token.clone());
        Ok(token)
    }

    /// Ignore the cache on the next resolve
    pub fn invalidate(&self) {
        self.force_refresh.store(true, Ordering::SeqCst);
    }
}
