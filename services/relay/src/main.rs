use relay::config::RelayConfig;
use relay::state::AppState;
use relay::{db, routing, stats, worker};
use std::env;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };
    info!(
        server_id = %config.server_id,
        bind = %config.api_bind,
        workers = config.worker_concurrency,
        "relay starting"
    );

    info!("connecting to database...");
    let pool = db::connect(&config).await;
    info!(pool_size = config.db_pool_size, "database ready");

    let redis_client =
        redis::Client::open(config.redis_url.as_str()).expect("invalid REDIS_URL");

    // Unclean shutdown recovery: no agents are connected at startup, so any
    // session rows or routing claims still live for this instance are stale.
    let closed = relay::repo::agent_connections::close_stale_for_server(&pool, &config.server_id)
        .await
        .expect("failed to reset stale agent sessions");
    if closed > 0 {
        info!(closed, "closed stale agent sessions from previous run");
    }

    let bind_addr = config.api_bind.clone();
    let state = AppState::new(pool.clone(), redis_client, config);

    if let Ok(mut redis) = state.redis.manager().await {
        if let Err(e) =
            routing::release_all_for_server(&mut redis, &state.config.server_id).await
        {
            tracing::warn!(error = %e, "stale routing claim cleanup failed");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(routing::run_forward_listener(state.clone()));
    let http = worker::http_client(state.config.delivery_timeout);
    let workers = worker::spawn(state.clone(), http, shutdown_rx.clone());
    tokio::spawn(stats::run_stats_refresher(
        pool,
        state.config.stats_interval,
        shutdown_rx,
    ));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "relay listening");
    let server_id = state.config.server_id.clone();
    axum::serve(listener, relay::build_router(state))
        .with_graceful_shutdown(shutdown_signal(server_id))
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    for handle in workers {
        let _ = handle.await;
    }
    info!("relay shut down gracefully");
}

/// Resolves when the process is asked to stop, which lets axum drain
/// in-flight requests and tunnel sessions before the workers are signalled.
/// Tunnel session rows and routing claims left behind by a hard kill are
/// reclaimed by the next boot's stale-state cleanup.
async fn shutdown_signal(server_id: String) {
    #[cfg(unix)]
    let terminate = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.expect("failed to install Ctrl+C handler");
            info!(server_id = %server_id, signal = "SIGINT", "shutdown requested, draining");
        }
        () = terminate => {
            info!(server_id = %server_id, signal = "SIGTERM", "shutdown requested, draining");
        }
    }
}
