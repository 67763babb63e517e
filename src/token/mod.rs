//! Realtime access tokens
//!
//! A token is minted by the backend and is good for the calendar day it was
//! issued on. Validity is a date comparison, not a TTL:
//! - `store`: where the token and its issue date live between runs
//! - `provider`: returns the cached token or mints a new one when the day rolls over

mod provider;
mod store;

pub use provider::{TokenMinter, TokenProvider};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A realtime access token and the local date it was minted
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    pub issued_date: NaiveDate,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, issued_date: NaiveDate) -> Self {
        Self {
            value: value.into(),
            issued_date,
        }
    }

    /// A token is only valid on the day it was issued
    pub fn is_valid_on(&self, today: NaiveDate) -> bool {
        self.issued_date == today
    }
}

// Keep token values out of logs
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &redact(&self.value))
            .field("issued_date", &self.issued_date)
            .finish()
    }
}

/// Short, log-safe rendering of a secret
pub fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", prefix)
    }
}

/// Source of "today" for token day-rotation
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local wall-clock date
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// A clock pinned to one date
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}
