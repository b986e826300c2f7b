pub mod auth;
pub mod config;
pub mod db;
pub mod http;
pub mod rate_limit;
pub mod repo;
pub mod routing;
pub mod signing;
pub mod state;
pub mod stats;
pub mod worker;
pub mod ws_tunnel;

pub use state::AppState;

use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/tunnel", get(ws_tunnel::tunnel_handler))
        .route(
            "/v1/channels/:channel_id/signals",
            post(http::signals::push_signal).get(http::signals::list_signals),
        )
        .route(
            "/v1/channels/:channel_id/stats",
            get(http::signals::channel_stats),
        )
        .route(
            "/v1/webhooks/:webhook_id/deliveries",
            get(http::deliveries::list_deliveries),
        )
        .route("/v1/admin/dlq", get(http::admin::list_dlq))
        .route(
            "/v1/admin/dlq/:dead_letter_id/retry",
            post(http::admin::retry_dlq),
        )
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
