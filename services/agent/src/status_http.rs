//! Local status endpoint for ops probes.  Reports whether the tunnel is
//! currently established.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn serve(bind: String, connected: watch::Receiver<bool>) {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .with_state(connected);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(bind = %bind, error = %e, "status endpoint bind failed");
            return;
        }
    };
    info!(bind = %bind, "status endpoint listening");
    if let Err(e) = axum::serve(listener, router).await {
        warn!(error = %e, "status endpoint stopped");
    }
}

async fn healthz(State(connected): State<watch::Receiver<bool>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "tunnel_connected": *connected.borrow(),
    }))
}
