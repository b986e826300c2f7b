// herald-agent: customer-side tunnel client.  Holds an outbound connection
// to the relay and forwards each pushed signal to a local HTTP endpoint, so
// no inbound path into the customer network is needed.

use agent::backoff::Backoff;
use agent::config::{load_config, load_config_from_path};
use agent::forward::LocalForwarder;
use agent::status_http;
use agent::tunnel::{TunnelError, TunnelSession};
use std::path::Path;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "agent starting");

    let config = match std::env::args().nth(1) {
        Some(path) => load_config_from_path(Path::new(&path)),
        None => load_config(),
    };
    let config = match config {
        Ok(config) => {
            info!(
                server = %config.server.base_url,
                forward = %config.forward.url,
                "config loaded"
            );
            config
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let (connected_tx, connected_rx) = watch::channel(false);
    tokio::spawn(status_http::serve(
        config.status_http.bind.clone(),
        connected_rx,
    ));

    let forwarder = LocalForwarder::new(&config.forward);
    let url = config.tunnel_url();
    let mut backoff = Backoff::new(config.backoff);

    loop {
        match TunnelSession::connect(&url, &config.token).await {
            Ok(session) => {
                backoff.reset();
                let _ = connected_tx.send(true);
                let reason = session.run(&forwarder).await;
                let _ = connected_tx.send(false);
                match reason {
                    TunnelError::Disconnected => info!("tunnel disconnected"),
                    e => warn!(error = %e, "tunnel session ended"),
                }
            }
            Err(TunnelError::AuthRejected(message)) => {
                // A revoked key will not fix itself; keep retrying slowly in
                // case the key is re-issued server-side.
                warn!(message = %message, "authentication rejected");
            }
            Err(e) => warn!(error = %e, "tunnel connect failed"),
        }

        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::time::sleep(delay).await;
    }
}
