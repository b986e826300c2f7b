//! Cross-server tunnel routing.
//!
//! Each relay instance claims `herald:agent:<subscriber_id> -> server_id` in
//! Redis while it holds the live socket, and listens on its own pub/sub
//! channel for pushes forwarded by workers on other instances.  Claims are
//! released on clean disconnect, guarded so a displaced connection on
//! another server cannot drop a newer claim.

use futures_util::StreamExt;
use herald_protocol::TunnelMessage;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::state::AppState;

fn agent_key(subscriber_id: &str) -> String {
    format!("herald:agent:{subscriber_id}")
}

pub fn server_channel(server_id: &str) -> String {
    format!("herald:server:{server_id}")
}

/// Delete the claim only while it still belongs to this server.
const GUARDED_RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

pub async fn claim(
    redis: &mut ConnectionManager,
    subscriber_id: &str,
    server_id: &str,
) -> Result<(), redis::RedisError> {
    redis.set(agent_key(subscriber_id), server_id).await
}

pub async fn release(
    redis: &mut ConnectionManager,
    subscriber_id: &str,
    server_id: &str,
) -> Result<(), redis::RedisError> {
    redis::Script::new(GUARDED_RELEASE_SCRIPT)
        .key(agent_key(subscriber_id))
        .arg(server_id)
        .invoke_async::<()>(redis)
        .await
}

/// Which server currently claims the subscriber's tunnel, if any.
pub async fn lookup(
    redis: &mut ConnectionManager,
    subscriber_id: &str,
) -> Result<Option<String>, redis::RedisError> {
    redis.get(agent_key(subscriber_id)).await
}

/// Drop every claim held by this server.  Run at boot so claims from an
/// unclean shutdown do not shadow reconnecting agents.
pub async fn release_all_for_server(
    redis: &mut ConnectionManager,
    server_id: &str,
) -> Result<(), redis::RedisError> {
    let keys: Vec<String> = {
        let mut iter = redis.scan_match::<_, String>("herald:agent:*").await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        keys
    };
    for key in keys {
        redis::Script::new(GUARDED_RELEASE_SCRIPT)
            .key(key)
            .arg(server_id)
            .invoke_async::<()>(redis)
            .await?;
    }
    Ok(())
}

/// A push forwarded to the instance that holds the subscriber's socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedPush {
    pub subscriber_id: String,
    pub message: TunnelMessage,
}

/// Publish a push to the home server's channel.  Returns how many listeners
/// received it; zero means no server is consuming that channel and the
/// tunnel path is unavailable.
pub async fn forward(
    redis: &mut ConnectionManager,
    server_id: &str,
    push: &ForwardedPush,
) -> Result<i64, redis::RedisError> {
    let payload = serde_json::to_string(push).expect("push serializes");
    redis.publish(server_channel(server_id), payload).await
}

/// Long-running task: consume this instance's forward channel and hand each
/// push to the local registry.
pub async fn run_forward_listener(state: AppState) {
    let channel = server_channel(&state.config.server_id);
    loop {
        let mut pubsub = match state.redis.client().get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                warn!(error = %e, "forward listener: redis connect failed, retrying");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };
        if let Err(e) = pubsub.subscribe(&channel).await {
            warn!(error = %e, "forward listener: subscribe failed, retrying");
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            continue;
        }
        info!(channel = %channel, "forward listener subscribed");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "forward listener: unreadable payload");
                    continue;
                }
            };
            let push: ForwardedPush = match serde_json::from_str(&payload) {
                Ok(push) => push,
                Err(e) => {
                    warn!(error = %e, "forward listener: malformed push");
                    continue;
                }
            };
            match state.agents.lookup(&push.subscriber_id).await {
                Some(agent) => {
                    if let Err(e) = agent.tx.try_send(push.message) {
                        warn!(
                            subscriber_id = %push.subscriber_id,
                            error = %e,
                            "forwarded push dropped: outbound channel unavailable"
                        );
                    }
                }
                None => warn!(
                    subscriber_id = %push.subscriber_id,
                    "forwarded push dropped: no local connection"
                ),
            }
        }
        warn!("forward listener stream ended, reconnecting");
    }
}
