//! Token persistence
//!
//! - Memory: process-local, for tests and one-shot commands
//! - File: JSON document in the platform config directory:
//!   - Linux: `~/.config/occupi/`
//!   - macOS: `~/Library/Application Support/occupi/`
//!   - Windows: `%APPDATA%\occupi\`

use super::AccessToken;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TOKEN_FILE_NAME: &str = "rtc-token.json";

/// Storage for the realtime token and its issue date
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Read the cached token, `None` if never set
    async fn get_token(&self) -> Result<Option<AccessToken>>;

    /// Persist a token together with the date it was minted
    async fn set_token(&self, token: &str, issued_date: NaiveDate) -> Result<()>;
}

/// In-memory token store
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: RwLock<Option<AccessToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a token already cached
    pub fn with_token(token: AccessToken) -> Self {
        Self {
            token: RwLock::new(Some(token)),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get_token(&self) -> Result<Option<AccessToken>> {
        Ok(self.token.read().clone())
    }

    async fn set_token(&self, token: &str, issued_date: NaiveDate) -> Result<()> {
        *self.token.write() = Some(AccessToken::new(token, issued_date));
        Ok(())
    }
}

/// Token store backed by a JSON file
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store in the platform config directory
    pub fn in_config_dir() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| SyncError::Storage("no config directory on this platform".into()))?;
        Ok(Self::new(dir.join("occupi").join(TOKEN_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get_token(&self) -> Result<Option<AccessToken>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<AccessToken>(&raw) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                // Unreadable cache is a miss; the next mint overwrites it
                warn!(path = %self.path.display(), error = %e, "Discarding corrupt token cache");
                Ok(None)
            }
        }
    }

    async fn set_token(&self, token: &str, issued_date: NaiveDate) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(&AccessToken::new(token, issued_date))?;

        // Write-then-rename so a crash never leaves half a token behind
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), %issued_date, "Persisted realtime token");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("occupi-rtc-test-{}", uuid::Uuid::new_v4()))
            .join(TOKEN_FILE_NAME)
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryTokenStore::new();
        assert!(store.get_token().await.unwrap().is_none());

        store.set_token("tok-1", date(2024, 9, 1)).await.unwrap();
        let token = store.get_token().await.unwrap().unwrap();
        assert_eq!(token.value, "tok-1");
        assert_eq!(token.issued_date, date(2024, 9, 1));

        store.set_token("tok-2", date(2024, 9, 2)).await.unwrap();
        assert_eq!(store.get_token().await.unwrap().unwrap().value, "tok-2");
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_none() {
        let store = FileTokenStore::new(temp_path());
        assert!(store.get_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_survives_new_instance() {
        let path = temp_path();

        FileTokenStore::new(&path)
            .set_token("persisted", date(2024, 9, 1))
            .await
            .unwrap();

        // A fresh instance simulates a process restart
        let reopened = FileTokenStore::new(&path);
        let token = reopened.get_token().await.unwrap().unwrap();
        assert_eq!(token, AccessToken::new("persisted", date(2024, 9, 1)));
        assert!(!path.with_extension("json.tmp").exists());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_reads_as_none() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();

        let store = FileTokenStore::new(&path);
        assert!(store.get_token().await.unwrap().is_none());

        store.set_token("fresh", date(2024, 9, 3)).await.unwrap();
        assert_eq!(store.get_token().await.unwrap().unwrap().value, "fresh");

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
