//! REST client for the occupancy backend
//!
//! Only the endpoints the realtime client depends on:
//! - `rtc/get-token`: mint a realtime token (the authentication collaborator)
//! - `rtc/current-count`: authoritative counter snapshot
//! - `rtc/enter` / `rtc/exit`: check-in and check-out, which make the backend publish

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::snapshot::CountSource;
use crate::token::TokenMinter;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

const TOKEN_PATH: &str = "rtc/get-token";
const COUNT_PATH: &str = "rtc/current-count";
const ENTER_PATH: &str = "rtc/enter";
const EXIT_PATH: &str = "rtc/exit";

/// `{ "data": ... }` success envelope
#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

/// Error body returned by the backend on non-2xx responses
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// Response to a check-in or check-out
#[derive(Debug, Clone, Deserialize)]
pub struct CheckResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CheckResponse {
    /// Counter value after the check, when the backend reports it
    pub fn counter(&self) -> Option<u64> {
        self.data.get("counter").and_then(|v| v.as_u64())
    }
}

/// HTTP client for the occupancy backend
#[derive(Debug, Clone)]
pub struct OccupancyApi {
    http: reqwest::Client,
    base: Url,
    session_token: Option<String>,
}

impl OccupancyApi {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.operation_timeout)
            .build()?;

        Ok(Self {
            http,
            base: base_url(&config.api_url)?,
            session_token: config.session_token.clone(),
        })
    }

    /// Ask the backend for a fresh realtime token
    pub async fn rtc_token(&self) -> Result<String> {
        let envelope: DataEnvelope<String> = self.get(TOKEN_PATH).await?;
        Ok(envelope.data)
    }

    /// Read the current occupancy count
    pub async fn read_count(&self) -> Result<u64> {
        let envelope: DataEnvelope<serde_json::Value> = self.get(COUNT_PATH).await?;
        parse_count(&envelope.data)
    }

    /// Check in (increments the counter)
    pub async fn enter(&self) -> Result<CheckResponse> {
        let response: CheckResponse = self.get(ENTER_PATH).await?;
        info!(message = %response.message, "Checked in");
        Ok(response)
    }

    /// Check out (decrements the counter, never below zero)
    pub async fn exit(&self) -> Result<CheckResponse> {
        let response: CheckResponse = self.get(EXIT_PATH).await?;
        info!(message = %response.message, "Checked out");
        Ok(response)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base.join(path)?;
        debug!(%url, "GET");

        let mut request = self.http.get(url).header(ACCEPT, "application/json");
        if let Some(token) = &self.session_token {
            request = request.header(AUTHORIZATION, token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(SyncError::Api {
                status: status.as_u16(),
                message: error_message(&body, status.canonical_reason()),
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl TokenMinter for OccupancyApi {
    async fn mint_token(&self) -> Result<String> {
        self.rtc_token()
            .await
            .map_err(|e| SyncError::TokenAcquisitionFailed(e.to_string()))
    }
}

#[async_trait]
impl CountSource for OccupancyApi {
    async fn current_count(&self) -> Result<u64> {
        self.read_count().await
    }
}

/// Normalize the base so relative joins keep any path prefix
fn base_url(raw: &str) -> Result<Url> {
    let mut base = Url::parse(raw)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

/// Counts are non-negative; the backend clamps at zero and so do we
fn parse_count(value: &serde_json::Value) -> Result<u64> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    if let Some(n) = value.as_i64() {
        return Ok(n.max(0) as u64);
    }
    Err(SyncError::Api {
        status: 200,
        message: format!("count is not an integer: {}", value),
    })
}

fn error_message(body: &str, reason: Option<&str>) -> String {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    parsed
        .error
        .and_then(|e| e.message)
        .or(parsed.message)
        .unwrap_or_else(|| reason.unwrap_or("request failed").to_string())
}
