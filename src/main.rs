//! occupi-rtc CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use clap::Parser;
use occupi_rtc::token::redact;
use occupi_rtc::{
    CountSnapshotFetcher, CounterStatus, CounterSubscriptionManager, CounterUpdate, OccupancyApi,
    SyncConfig,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli.sync_config();

    match cli.command {
        Commands::Watch => watch(config).await,
        Commands::Count => count(config).await,
        Commands::Enter => check(config, true).await,
        Commands::Exit => check(config, false).await,
        Commands::Token { refresh } => token(config, refresh).await,
    }
}

fn manager(config: &SyncConfig) -> Result<CounterSubscriptionManager> {
    CounterSubscriptionManager::from_config(config).context("Failed to set up the sync client")
}

async fn watch(config: SyncConfig) -> Result<()> {
    let manager = manager(&config)?;
    let mut consumer = manager.mount();

    consumer
        .activate()
        .await
        .context("Failed to start the live counter")?;
    info!(topic = %manager.topic(), "Watching occupancy");

    loop {
        tokio::select! {
            update = consumer.next_update() => match update {
                Some(CounterUpdate::Snapshot(n)) => println!("{} (snapshot)", n),
                Some(CounterUpdate::Live(n)) => println!("{}", n),
                Some(CounterUpdate::Status(CounterStatus::Stale { reason })) => {
                    println!("stale: {} (last count {})", reason, consumer.value())
                }
                Some(CounterUpdate::Status(status)) => println!("status: {:?}", status),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    consumer.deactivate();
    Ok(())
}

async fn count(config: SyncConfig) -> Result<()> {
    let api = Arc::new(OccupancyApi::new(&config).context("Invalid API URL")?);
    let count = CountSnapshotFetcher::new(api, config.operation_timeout)
        .fetch_current_count()
        .await;

    println!("{}", count);
    Ok(())
}

async fn check(config: SyncConfig, entering: bool) -> Result<()> {
    let api = OccupancyApi::new(&config).context("Invalid API URL")?;

    let response = if entering {
        api.enter().await.context("Check-in failed")?
    } else {
        api.exit().await.context("Check-out failed")?
    };

    println!("{}", response.message);
    if let Some(counter) = response.counter() {
        println!("Counter: {}", counter);
    }
    Ok(())
}

async fn token(config: SyncConfig, refresh: bool) -> Result<()> {
    let manager = manager(&config)?;
    let tokens = manager.tokens();

    if refresh {
        tokens.invalidate();
    }
    let token = tokens
        .resolve_token()
        .await
        .context("Failed to resolve the realtime token")?;

    println!("Token:  {}", redact(&token.value));
    println!("Issued: {}", token.issued_date);
    Ok(())
}
