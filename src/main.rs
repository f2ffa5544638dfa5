//! signal-bridge daemon entry point.
//!
//! Loads the configuration, selects the transport and reports the accounts
//! it can serve. In json-rpc mode it then follows every connected account's
//! inbound events and logs them until interrupted.

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use signal_bridge::bridge::Bridge;
use signal_bridge::config::{BridgeConfig, TransportMode};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "signal_bridge=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("Starting signal-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = BridgeConfig::load().context("Failed to load configuration")?;
    info!(mode = %config.mode, "Configuration loaded");

    let bridge = Bridge::from_config(&config).await;

    let accounts = bridge
        .get_accounts()
        .await
        .context("Failed to list signal-cli accounts")?;
    if accounts.is_empty() {
        warn!("No accounts available");
    }
    for account in &accounts {
        info!(account = %account, "Account available");
    }

    if bridge.mode() != TransportMode::JsonRpc {
        return Ok(());
    }

    let mut followers = JoinSet::new();
    for account in accounts {
        let mut subscription = match bridge.subscribe(&account) {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(account = %account, "Not following events: {}", e);
                continue;
            }
        };
        followers.spawn(async move {
            while let Some(event) = subscription.recv().await {
                info!(account = %account, "Event: {}", event);
            }
            info!(account = %account, "Event stream ended");
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    followers.abort_all();
    Ok(())
}
