// =============================================================================
// Pulsefeed — Main Entry Point
// =============================================================================
//
// Boots the resilient market-data pipeline: one multiplexed Binance stream
// session supervised for reconnects, kline and ticker subscriptions for every
// configured symbol, and a small read-only HTTP API over the in-memory data.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod indicators;
mod market_data;
mod runtime_config;
mod stream;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::BinanceRest;
use crate::runtime_config::RuntimeConfig;
use crate::stream::{MarketStreamClient, StreamName};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = RuntimeConfig::load("pulsefeed.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbols = ?config.symbols,
        intervals = ?config.intervals,
        ws_url = %config.ws_url,
        "pulsefeed starting"
    );

    // ── 2. Build the stream client ───────────────────────────────────────
    let rest = BinanceRest::new(config.rest_url.clone());
    let client = Arc::new(MarketStreamClient::new(&config, rest));

    // ── 3. Register subscriptions, then connect ──────────────────────────
    // Registry entries put down before the first session are replayed as
    // soon as it comes up; send errors here are not fatal.
    for symbol in &config.symbols {
        for interval in &config.intervals {
            if let Err(e) = client.subscribe(StreamName::kline(symbol, interval)).await {
                warn!(symbol = %symbol, interval = %interval, error = %e, "subscribe failed");
            }
        }
        if let Err(e) = client.subscribe(StreamName::ticker(symbol)).await {
            warn!(symbol = %symbol, error = %e, "ticker subscribe failed");
        }
    }

    client.connect().await;
    info!(streams = client.subscriptions().len(), "stream client connected");

    // ── 4. Start the API server ──────────────────────────────────────────
    let listen_addr = config.listen_addr.clone();
    let state = Arc::new(AppState::new(config, client.clone()));

    let server = tokio::spawn(async move {
        let app = api::rest::router(state);
        let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %listen_addr, error = %e, "failed to bind API server");
                return;
            }
        };
        info!(addr = %listen_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 5. Run until interrupted ─────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    client.close().await;
    server.abort();

    info!("pulsefeed stopped");
    Ok(())
}
