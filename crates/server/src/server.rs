//! HTTP surface: WebSocket feed, health and statistics

use axum::{extract::State, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use spread_hub::FanoutHub;
use spread_price_feed::{PipelineStats, SpreadPipeline, TokenStats};

use crate::ws;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SpreadPipeline>,
    pub hub: FanoutHub,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(pipeline: Arc<SpreadPipeline>) -> Self {
        let hub = pipeline.hub();
        Self {
            pipeline,
            hub,
            started_at: Utc::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain open connections
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(address = %listener.local_addr()?, "Spread feed listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": if state.pipeline.is_running() { "ok" } else { "starting" },
        "timestamp": Utc::now().timestamp_millis(),
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
    }))
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    pipeline: PipelineStats,
    tokens: Vec<TokenStats>,
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        pipeline: state.pipeline.stats(),
        tokens: state.pipeline.token_stats(),
    })
}
