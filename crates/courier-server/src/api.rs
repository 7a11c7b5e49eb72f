use std::sync::Arc;

use axum::{
    extract::State,
    http::Method,
    middleware,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_shared::constants::PROTOCOL_VERSION;
use courier_shared::types::ConnectionId;

use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::storage::SessionLookup;
use crate::ws::ws_upgrade;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub sessions: Arc<dyn SessionLookup>,
    pub rate_limiter: RateLimiter,
    pub event_limiter: RateLimiter<ConnectionId>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(hub: Hub, sessions: Arc<dyn SessionLookup>, config: Arc<ServerConfig>) -> Self {
        Self {
            hub,
            sessions,
            rate_limiter: RateLimiter::default(),
            event_limiter: RateLimiter::new(config.events_per_sec, config.event_burst),
            config,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    online_users: usize,
    connections: usize,
    active_calls: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        online_users: state.hub.online_count().await,
        connections: state.hub.connection_count().await,
        active_calls: state.hub.active_calls().await,
    })
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
