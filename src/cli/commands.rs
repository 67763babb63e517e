//! CLI command definitions

use clap::{Parser, Subcommand};
use occupi_rtc::config::{DEFAULT_API_URL, DEFAULT_COUNTER_TOPIC, DEFAULT_REALTIME_URL};
use occupi_rtc::SyncConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "occupi-rtc")]
#[command(about = "Live office occupancy counter", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Base URL of the occupancy API
    #[arg(long, env = "OCCUPI_API_URL", default_value = DEFAULT_API_URL, global = true)]
    pub api_url: String,

    /// WebSocket URL of the realtime service
    #[arg(long, env = "OCCUPI_RTC_URL", default_value = DEFAULT_REALTIME_URL, global = true)]
    pub realtime_url: String,

    /// Counter topic to subscribe to
    #[arg(long, env = "OCCUPI_RTC_TOPIC", default_value = DEFAULT_COUNTER_TOPIC, global = true)]
    pub topic: String,

    /// Session credential sent as the Authorization header
    #[arg(long, env = "OCCUPI_SESSION_TOKEN", global = true)]
    pub session_token: Option<String>,

    /// Where to cache the realtime token
    #[arg(long, env = "OCCUPI_TOKEN_CACHE", global = true)]
    pub token_cache: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    pub fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::new(&self.api_url, &self.realtime_url).topic(&self.topic);
        if let Some(token) = &self.session_token {
            config = config.session_token(token);
        }
        if let Some(path) = &self.token_cache {
            config = config.token_cache_path(path);
        }
        config
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Follow the live counter until Ctrl-C
    Watch,

    /// Print the current count once
    Count,

    /// Check in (increments the counter)
    Enter,

    /// Check out (decrements the counter)
    Exit,

    /// Show the cached realtime token
    ///
    /// Examples:
    ///   occupi-rtc token
    ///   occupi-rtc token --refresh
    Token {
        /// Mint a new token even if today's is cached
        #[arg(long)]
        refresh: bool,
    },
}
