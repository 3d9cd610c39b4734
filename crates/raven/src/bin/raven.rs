use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nostr_client::PoolConfig;
use raven::{
    BackgroundBridge, BridgeConfig, PassthroughCipher, PoolFactory, Raven, RavenConfig,
    RelayEntry, RelaySetResolver, signer_from_priv, transport,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(about = "Sync Nostr public chat from relays and log what is rebuilt")]
struct Args {
    /// Relay to use, as `url`, `url#read` or `url#write`. Repeatable.
    #[arg(long = "relay")]
    relays: Vec<RelayEntry>,

    /// Channel id to sync in addition to the ones found for the identity.
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// Keep a live inbox subscription open.
    #[arg(long)]
    listen: bool,

    /// Report which live relay carries this event id, then exit.
    #[arg(long)]
    locate: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = RavenConfig::from_env().context("load configuration")?;
    for entry in args.relays {
        config.add_relay(entry);
    }
    for channel in args.channels {
        if !config.default_channels.contains(&channel) {
            config.default_channels.push(channel);
        }
    }

    if let Some(event_id) = args.locate {
        return locate(&config, &event_id).await;
    }

    let secret = std::env::var("RAVEN_SECRET_KEY").unwrap_or_else(|_| "none".to_string());
    let pubkey = std::env::var("RAVEN_PUBKEY").ok();
    let signer = signer_from_priv(&secret, pubkey.as_deref()).context("load RAVEN_SECRET_KEY")?;

    let raven = Raven::new(
        config,
        transport::pool(PoolConfig::default()),
        signer,
        Arc::new(PassthroughCipher),
    );
    match raven.identity() {
        Some(identity) => info!("running as {}", identity),
        None => info!("running without identity"),
    }

    let mut events = raven.events();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("{} ({} items)", event.label(), event.len()),
                Err(RecvError::Lagged(skipped)) => warn!("log fell behind by {} batches", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let report = raven.connect().await;
    if report.connected.is_empty() {
        warn!("no relay connected; sync will be empty");
    }
    raven.init().await;
    if args.listen && !raven.start_inbox().await {
        warn!("inbox not started");
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    raven.shutdown().await;
    logger.abort();
    Ok(())
}

async fn locate(config: &RavenConfig, event_id: &str) -> Result<()> {
    let relays = RelaySetResolver::new(&config.relays).all_configured();

    let factory = Arc::new(PoolFactory::new(PoolConfig::default(), config.connect_timeout));
    let bridge = BackgroundBridge::spawn(BridgeConfig::from_config(config, relays), factory);
    let located = bridge.locate_relay(event_id).await;
    bridge.shutdown().await?;

    let relay = located?;
    info!("{} is available on {}", event_id, relay);
    Ok(())
}
