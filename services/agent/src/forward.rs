//! Local delivery: each tunnel signal becomes one HTTP POST to the
//! configured endpoint on the subscriber's network.

use herald_protocol::SignalPayload;
use std::time::Duration;
use tracing::debug;

use crate::config::ForwardConfig;

const LOCAL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct LocalForwarder {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
}

impl LocalForwarder {
    pub fn new(config: &ForwardConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(LOCAL_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        LocalForwarder {
            client,
            url: config.url.clone(),
            bearer_token: config.bearer_token.clone(),
        }
    }

    /// POST the signal payload to the local endpoint.  `Err` carries the
    /// reason string sent upstream as a negative ack.
    pub async fn forward(&self, delivery_id: &str, signal: &SignalPayload) -> Result<(), String> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("X-Herald-Delivery-Id", delivery_id)
            .json(signal);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(delivery_id = %delivery_id, "signal forwarded locally");
                Ok(())
            }
            Ok(response) => Err(format!("local endpoint returned {}", response.status())),
            Err(e) if e.is_timeout() => Err("local endpoint timed out".to_owned()),
            Err(e) => Err(format!("local forward failed: {e}")),
        }
    }
}
