//! Tunnel server: long-lived authenticated WebSocket connections from
//! customer-run agents, used to deliver signals without any inbound path
//! into the customer network.
//!
//! # Session lifecycle
//! 1. Upgrade on `GET /v1/tunnel`; the socket is anonymous until handshake.
//! 2. First frame must be `auth` within the handshake deadline; anything
//!    else closes with 1008.
//! 3. On success the connection is registered under its subscriber id
//!    (displacing any prior live connection), claimed in the shared routing
//!    map, and recorded in `agent_connections`.
//! 4. Pump loop: outbound pushes, acks, and a 30 s ping/pong heartbeat with
//!    a 30 s grace before closing with 1011.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use herald_protocol::{close_codes, generate_id, id_prefix, TunnelMessage, MAX_FRAME_BYTES};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{self, OwnerType};
use crate::repo::agent_connections;
use crate::routing;
use crate::state::{AgentHandle, AppState};
use crate::worker;

pub async fn tunnel_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_tunnel(socket, state))
}

async fn send_message(socket: &mut WebSocket, msg: &TunnelMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).expect("tunnel message serializes");
    socket.send(Message::Text(json)).await
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_tunnel(mut socket: WebSocket, state: AppState) {
    // Handshake: exactly one auth frame, within the deadline.
    let token = match tokio::time::timeout(state.config.handshake_timeout, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<TunnelMessage>(&text) {
            Ok(TunnelMessage::Auth { token }) => token,
            _ => {
                close_with(
                    &mut socket,
                    close_codes::POLICY_VIOLATION,
                    "expected auth as the first message",
                )
                .await;
                return;
            }
        },
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return,
        Ok(Some(Ok(_))) => {
            close_with(
                &mut socket,
                close_codes::POLICY_VIOLATION,
                "expected auth as the first message",
            )
            .await;
            return;
        }
        Ok(Some(Err(_))) => return,
        Err(_) => {
            close_with(
                &mut socket,
                close_codes::POLICY_VIOLATION,
                "auth handshake timed out",
            )
            .await;
            return;
        }
    };

    let ctx = match auth::validate_raw_key(&state.pool, &token).await {
        Ok(ctx) => ctx,
        Err(e) => {
            debug!(error = %e, "tunnel auth rejected");
            let _ = send_message(
                &mut socket,
                &TunnelMessage::AuthError {
                    message: "unknown or revoked key".to_owned(),
                },
            )
            .await;
            return;
        }
    };
    if ctx.owner_type != OwnerType::Subscriber {
        let _ = send_message(
            &mut socket,
            &TunnelMessage::AuthError {
                message: "tunnel requires a subscriber key".to_owned(),
            },
        )
        .await;
        return;
    }
    let subscriber_id = ctx.owner_id;

    let connection_id = generate_id(id_prefix::CONNECTION);
    let (tx, mut rx) = mpsc::channel::<TunnelMessage>(state.config.tunnel_queue_capacity);
    let handle = AgentHandle::new(connection_id.clone(), tx);
    let displaced = handle.displaced.clone();

    if let Err(e) = agent_connections::insert(
        &state.pool,
        &connection_id,
        &subscriber_id,
        &state.config.server_id,
    )
    .await
    {
        warn!(error = %e, "tunnel session row insert failed");
        let _ = send_message(
            &mut socket,
            &TunnelMessage::AuthError {
                message: "session could not be established".to_owned(),
            },
        )
        .await;
        return;
    }

    if let Some(prior) = state.agents.register(&subscriber_id, handle).await {
        info!(
            subscriber_id = %subscriber_id,
            old_connection = %prior.connection_id,
            new_connection = %connection_id,
            "displacing prior tunnel connection"
        );
        prior.displaced.notify_one();
    }

    // Routing claims are best-effort: local delivery works without Redis.
    match state.redis.manager().await {
        Ok(mut redis) => {
            if let Err(e) =
                routing::claim(&mut redis, &subscriber_id, &state.config.server_id).await
            {
                warn!(error = %e, "tunnel routing claim failed");
            }
        }
        Err(e) => warn!(error = %e, "tunnel routing claim skipped: redis unavailable"),
    }

    if send_message(
        &mut socket,
        &TunnelMessage::AuthOk {
            connection_id: connection_id.clone(),
            subscriber_id: subscriber_id.clone(),
        },
    )
    .await
    .is_err()
    {
        teardown(&state, &subscriber_id, &connection_id, "socket_error").await;
        return;
    }
    info!(
        subscriber_id = %subscriber_id,
        connection_id = %connection_id,
        "agent connected"
    );

    let mut heartbeat = tokio::time::interval(state.config.tunnel_heartbeat);
    heartbeat.tick().await;
    let mut awaiting_pong = false;

    let reason: &str = loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<TunnelMessage>(&text) {
                            Ok(TunnelMessage::Ack { delivery_id, error: None }) => {
                                debug!(delivery_id = %delivery_id, "delivery acknowledged");
                            }
                            Ok(TunnelMessage::Ack { delivery_id, error: Some(error) }) => {
                                if let Err(e) =
                                    worker::handle_negative_ack(&state, &delivery_id, &error).await
                                {
                                    warn!(
                                        delivery_id = %delivery_id,
                                        error = %e,
                                        "negative ack handling failed"
                                    );
                                }
                            }
                            Ok(TunnelMessage::Pong) => { awaiting_pong = false; }
                            Ok(other) => {
                                warn!(subscriber_id = %subscriber_id, ?other, "unexpected tunnel message");
                            }
                            Err(e) => {
                                warn!(subscriber_id = %subscriber_id, error = %e, "malformed tunnel frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break "client_disconnect",
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break "socket_error",
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let is_signal = matches!(msg, TunnelMessage::Signal { .. });
                        if send_message(&mut socket, &msg).await.is_err() {
                            break "socket_error";
                        }
                        if is_signal {
                            let pool = state.pool.clone();
                            let conn = connection_id.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    agent_connections::increment_delivered(&pool, &conn).await
                                {
                                    debug!(error = %e, "signals_delivered update failed");
                                }
                            });
                        }
                    }
                    None => break "closed",
                }
            }
            () = displaced.notified() => {
                close_with(&mut socket, 1000, "displaced by a newer connection").await;
                break "displaced";
            }
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    close_with(
                        &mut socket,
                        close_codes::INTERNAL_ERROR,
                        "heartbeat timed out",
                    )
                    .await;
                    break "heartbeat_timeout";
                }
                if send_message(&mut socket, &TunnelMessage::Ping).await.is_err() {
                    break "socket_error";
                }
                awaiting_pong = true;
            }
        }
    };

    info!(
        subscriber_id = %subscriber_id,
        connection_id = %connection_id,
        reason = %reason,
        "agent session ended"
    );
    teardown(&state, &subscriber_id, &connection_id, reason).await;
}

/// Remove the registry entry (only if this connection still owns it), drop
/// the routing claim alongside, and close out the session row.
async fn teardown(state: &AppState, subscriber_id: &str, connection_id: &str, reason: &str) {
    let removed = state.agents.remove_if(subscriber_id, connection_id).await;
    if removed {
        match state.redis.manager().await {
            Ok(mut redis) => {
                if let Err(e) =
                    routing::release(&mut redis, subscriber_id, &state.config.server_id).await
                {
                    warn!(error = %e, "tunnel routing release failed");
                }
            }
            Err(e) => warn!(error = %e, "tunnel routing release skipped: redis unavailable"),
        }
    }
    if let Err(e) = agent_connections::mark_disconnected(&state.pool, connection_id, reason).await {
        warn!(error = %e, "tunnel session row close failed");
    }
}
