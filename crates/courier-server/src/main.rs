//! # courier-server
//!
//! Real-time messaging and call-signaling server.
//!
//! This binary provides:
//! - **Presence**: who is online, pushed to conversation partners
//! - **Conversation rooms**: ordered fan-out of end-to-end encrypted
//!   messages the server cannot read
//! - **History paging** and receiver-driven delivery receipts
//! - **Call signaling**: a per-pair state machine relaying opaque
//!   offers, answers and ICE candidates
//! - **HTTP API** (axum) for health, instance info and the websocket upgrade
//! - **Rate limiting** per IP and per connection

mod api;
mod calls;
mod config;
mod error;
mod hub;
mod pagination;
mod presence;
mod rate_limit;
mod registry;
mod rooms;
mod storage;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::storage::{Collaborators, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting Courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = Arc::new(ServerConfig::from_env());
    info!(?config, "Loaded configuration");
    if config.allow_unverified_auth {
        tracing::warn!("ALLOW_UNVERIFIED_AUTH is set; sockets may claim any user id");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = match &config.seed_path {
        Some(path) => MemoryStore::from_seed_file(path).await?,
        None => MemoryStore::new(),
    };
    let store = Arc::new(store);

    let hub = Hub::new(config.clone(), Collaborators::from_store(store.clone()));
    let app_state = AppState::new(hub, store, config.clone());

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = app_state.rate_limiter.clone();
    let el = app_state.event_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
            el.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
