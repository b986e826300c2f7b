//! Tunnel client session.
//!
//! Connects to the relay, performs the auth handshake, and pumps signals to
//! the local forwarder until the connection drops.
//!
//! # Protocol
//! 1. Connect to `wss://…/v1/tunnel`
//! 2. Send `auth` as the first frame
//! 3. Receive `auth_ok` with the assigned connection id
//! 4. For each `signal`: forward locally, then `ack` (with an `error` field
//!    when the local POST failed, which re-enters the relay's retry ladder)
//! 5. Answer every `ping` with `pong`

use futures_util::{SinkExt, StreamExt};
use herald_protocol::TunnelMessage;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::forward::LocalForwarder;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("connection error: {0}")]
    Connect(String),
    #[error("WebSocket error: {0}")]
    Ws(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("tunnel disconnected")]
    Disconnected,
}

/// An authenticated tunnel session.
#[derive(Debug)]
pub struct TunnelSession {
    ws: WsStream,
    connection_id: String,
    subscriber_id: String,
}

impl TunnelSession {
    /// Connect and complete the auth handshake.
    pub async fn connect(url: &str, token: &str) -> Result<Self, TunnelError> {
        use tokio_tungstenite::connect_async;

        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TunnelError::Connect(e.to_string()))?;

        let mut session = TunnelSession {
            ws,
            connection_id: String::new(),
            subscriber_id: String::new(),
        };

        session
            .send_message(&TunnelMessage::Auth {
                token: token.to_owned(),
            })
            .await?;

        match session.recv_message().await? {
            TunnelMessage::AuthOk {
                connection_id,
                subscriber_id,
            } => {
                session.connection_id = connection_id;
                session.subscriber_id = subscriber_id;
                info!(
                    connection_id = %session.connection_id,
                    subscriber_id = %session.subscriber_id,
                    "tunnel session established"
                );
            }
            TunnelMessage::AuthError { message } => {
                return Err(TunnelError::AuthRejected(message));
            }
            other => {
                return Err(TunnelError::Protocol(format!(
                    "expected auth_ok, got: {other:?}"
                )));
            }
        }

        Ok(session)
    }

    /// The connection id assigned by the relay after the handshake.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Pump loop: runs until the connection drops.  The returned error says
    /// why; the caller decides whether to reconnect.
    pub async fn run(mut self, forwarder: &LocalForwarder) -> TunnelError {
        loop {
            let msg = match self.recv_message().await {
                Ok(msg) => msg,
                Err(e) => return e,
            };
            match msg {
                TunnelMessage::Signal {
                    delivery_id,
                    channel_slug,
                    signal,
                    ..
                } => {
                    debug!(
                        delivery_id = %delivery_id,
                        channel = %channel_slug,
                        "signal received"
                    );
                    let ack = match forwarder.forward(&delivery_id, &signal).await {
                        Ok(()) => TunnelMessage::Ack {
                            delivery_id,
                            error: None,
                        },
                        Err(reason) => {
                            warn!(reason = %reason, "local forward failed, sending negative ack");
                            TunnelMessage::Ack {
                                delivery_id,
                                error: Some(reason),
                            }
                        }
                    };
                    if let Err(e) = self.send_message(&ack).await {
                        return e;
                    }
                }
                TunnelMessage::Ping => {
                    if let Err(e) = self.send_message(&TunnelMessage::Pong).await {
                        return e;
                    }
                }
                other => {
                    debug!(?other, "ignoring unexpected tunnel message");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    async fn send_message(&mut self, msg: &TunnelMessage) -> Result<(), TunnelError> {
        let json = serde_json::to_string(msg).expect("tunnel message serializes");
        self.ws
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| TunnelError::Ws(e.to_string()))
    }

    async fn recv_message(&mut self) -> Result<TunnelMessage, TunnelError> {
        loop {
            match self.ws.next().await {
                None => return Err(TunnelError::Disconnected),
                Some(Err(e)) => return Err(TunnelError::Ws(e.to_string())),
                Some(Ok(msg)) => match msg {
                    Message::Text(text) => {
                        return serde_json::from_str(&text)
                            .map_err(|e| TunnelError::Protocol(format!("JSON parse: {e}")));
                    }
                    Message::Close(_) => return Err(TunnelError::Disconnected),
                    Message::Ping(data) => {
                        // Transport-level ping; reply and keep waiting.
                        let _ = self.ws.send(Message::Pong(data)).await;
                    }
                    _ => {}
                },
            }
        }
    }
}
