//! Agent pump loop behavior against an in-process relay stub and an
//! in-process local endpoint, all over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use agent::config::ForwardConfig;
use agent::forward::LocalForwarder;
use agent::tunnel::{TunnelError, TunnelSession};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use herald_protocol::{SignalPayload, TunnelMessage, Urgency};
use tokio::sync::{mpsc, Mutex};

// ---------------------------------------------------------------------------
// Relay stub: answers the handshake, then replays scripted pushes and
// reports every inbound client message.
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct RelayStub {
    pushes: Arc<Mutex<Option<mpsc::Receiver<TunnelMessage>>>>,
    inbound: mpsc::Sender<TunnelMessage>,
}

async fn relay_ws(ws: WebSocketUpgrade, State(stub): State<RelayStub>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_relay_stub(socket, stub))
}

async fn run_relay_stub(mut socket: WebSocket, stub: RelayStub) {
    // Handshake: expect auth, reject unknown tokens.
    let first = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return,
    };
    let authed = match serde_json::from_str::<TunnelMessage>(&first) {
        Ok(TunnelMessage::Auth { token }) => token == "hld_sub_valid",
        _ => false,
    };
    let reply = if authed {
        TunnelMessage::AuthOk {
            connection_id: "conn_stub000000000000000000".to_owned(),
            subscriber_id: "sub_stub0000000000000000000".to_owned(),
        }
    } else {
        TunnelMessage::AuthError {
            message: "unknown or revoked key".to_owned(),
        }
    };
    let _ = socket
        .send(Message::Text(serde_json::to_string(&reply).unwrap()))
        .await;
    if !authed {
        return;
    }

    let mut pushes = stub.pushes.lock().await.take().expect("one session per test");
    loop {
        tokio::select! {
            push = pushes.recv() => {
                match push {
                    Some(msg) => {
                        let json = serde_json::to_string(&msg).unwrap();
                        if socket.send(Message::Text(json)).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        // Script finished: close from the relay side.
                        let _ = socket.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(parsed) = serde_json::from_str::<TunnelMessage>(&text) {
                            let _ = stub.inbound.send(parsed).await;
                        }
                    }
                    Some(Ok(_)) => {}
                    _ => return,
                }
            }
        }
    }
}

async fn spawn_relay_stub() -> (SocketAddr, mpsc::Sender<TunnelMessage>, mpsc::Receiver<TunnelMessage>) {
    let (push_tx, push_rx) = mpsc::channel(16);
    let (inbound_tx, inbound_rx) = mpsc::channel(16);
    let stub = RelayStub {
        pushes: Arc::new(Mutex::new(Some(push_rx))),
        inbound: inbound_tx,
    };
    let router = Router::new()
        .route("/v1/tunnel", get(relay_ws))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, push_tx, inbound_rx)
}

// ---------------------------------------------------------------------------
// Local endpoint stub
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct LocalStub {
    received: mpsc::Sender<(HeaderMap, serde_json::Value)>,
    respond_with_error: bool,
}

async fn local_hook(
    State(stub): State<LocalStub>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
    let _ = stub.received.send((headers, json)).await;
    if stub.respond_with_error {
        axum::http::StatusCode::BAD_GATEWAY
    } else {
        axum::http::StatusCode::OK
    }
}

async fn spawn_local_endpoint(
    respond_with_error: bool,
) -> (SocketAddr, mpsc::Receiver<(HeaderMap, serde_json::Value)>) {
    let (tx, rx) = mpsc::channel(16);
    let stub = LocalStub {
        received: tx,
        respond_with_error,
    };
    let router = Router::new()
        .route("/hook", post(local_hook))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, rx)
}

fn sample_signal() -> SignalPayload {
    SignalPayload {
        id: "sig_Kp5TzR8wQn2XvBj7Mc4Ld1aY".to_owned(),
        title: "deploy finished".to_owned(),
        body: "build 1042 is live".to_owned(),
        urgency: Urgency::High,
        metadata: serde_json::json!({"build": 1042}),
        created_at: "2026-07-30T18:12:03Z".to_owned(),
    }
}

fn sample_push(delivery_id: &str) -> TunnelMessage {
    TunnelMessage::Signal {
        delivery_id: delivery_id.to_owned(),
        channel_id: "ch_Aq2WsX9eDc4RfVt7Gb1Ny6Um".to_owned(),
        channel_slug: "deploys".to_owned(),
        signal: sample_signal(),
    }
}

// ---------------------------------------------------------------------------
// Suites
// ---------------------------------------------------------------------------

#[tokio::test]
async fn signal_is_forwarded_locally_and_acked() {
    let (relay_addr, push_tx, mut inbound) = spawn_relay_stub().await;
    let (local_addr, mut received) = spawn_local_endpoint(false).await;

    let session = TunnelSession::connect(&format!("ws://{relay_addr}/v1/tunnel"), "hld_sub_valid")
        .await
        .expect("handshake should succeed");
    assert_eq!(session.connection_id(), "conn_stub000000000000000000");

    let forwarder = LocalForwarder::new(&ForwardConfig {
        url: format!("http://{local_addr}/hook"),
        bearer_token: Some("local-secret".to_owned()),
    });
    let pump = tokio::spawn(async move { session.run(&forwarder).await });

    push_tx
        .send(sample_push("del_Fh3kW8pQzXn5TbYcRj1mL0aG"))
        .await
        .unwrap();

    let (headers, body) = tokio::time::timeout(std::time::Duration::from_secs(5), received.recv())
        .await
        .expect("local POST should arrive")
        .expect("channel open");
    assert_eq!(
        headers.get("x-herald-delivery-id").unwrap(),
        "del_Fh3kW8pQzXn5TbYcRj1mL0aG"
    );
    assert_eq!(
        headers.get("authorization").unwrap(),
        "Bearer local-secret"
    );
    assert_eq!(body["id"], "sig_Kp5TzR8wQn2XvBj7Mc4Ld1aY");
    assert_eq!(body["urgency"], "high");

    let ack = tokio::time::timeout(std::time::Duration::from_secs(5), inbound.recv())
        .await
        .expect("ack should arrive")
        .expect("channel open");
    match ack {
        TunnelMessage::Ack { delivery_id, error } => {
            assert_eq!(delivery_id, "del_Fh3kW8pQzXn5TbYcRj1mL0aG");
            assert!(error.is_none());
        }
        other => panic!("expected ack, got {other:?}"),
    }

    // Dropping the push script closes the stub's socket; the pump ends.
    drop(push_tx);
    let reason = tokio::time::timeout(std::time::Duration::from_secs(5), pump)
        .await
        .expect("pump should end")
        .unwrap();
    assert!(matches!(reason, TunnelError::Disconnected));
}

#[tokio::test]
async fn local_failure_becomes_a_negative_ack() {
    let (relay_addr, push_tx, mut inbound) = spawn_relay_stub().await;
    let (local_addr, _received) = spawn_local_endpoint(true).await;

    let session = TunnelSession::connect(&format!("ws://{relay_addr}/v1/tunnel"), "hld_sub_valid")
        .await
        .expect("handshake should succeed");
    let forwarder = LocalForwarder::new(&ForwardConfig {
        url: format!("http://{local_addr}/hook"),
        bearer_token: None,
    });
    let _pump = tokio::spawn(async move { session.run(&forwarder).await });

    push_tx
        .send(sample_push("del_Fh3kW8pQzXn5TbYcRj1mL0aG"))
        .await
        .unwrap();

    let ack = tokio::time::timeout(std::time::Duration::from_secs(5), inbound.recv())
        .await
        .expect("ack should arrive")
        .expect("channel open");
    match ack {
        TunnelMessage::Ack { error, .. } => {
            let reason = error.expect("ack should carry the failure reason");
            assert!(reason.contains("502"), "unexpected reason: {reason}");
        }
        other => panic!("expected ack, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (relay_addr, push_tx, mut inbound) = spawn_relay_stub().await;
    let (local_addr, _received) = spawn_local_endpoint(false).await;

    let session = TunnelSession::connect(&format!("ws://{relay_addr}/v1/tunnel"), "hld_sub_valid")
        .await
        .expect("handshake should succeed");
    let forwarder = LocalForwarder::new(&ForwardConfig {
        url: format!("http://{local_addr}/hook"),
        bearer_token: None,
    });
    let _pump = tokio::spawn(async move { session.run(&forwarder).await });

    push_tx.send(TunnelMessage::Ping).await.unwrap();

    let reply = tokio::time::timeout(std::time::Duration::from_secs(5), inbound.recv())
        .await
        .expect("pong should arrive")
        .expect("channel open");
    assert!(matches!(reply, TunnelMessage::Pong));
}

#[tokio::test]
async fn rejected_token_surfaces_as_auth_error() {
    let (relay_addr, _push_tx, _inbound) = spawn_relay_stub().await;

    let err = TunnelSession::connect(&format!("ws://{relay_addr}/v1/tunnel"), "hld_sub_revoked")
        .await
        .expect_err("handshake should be rejected");
    assert!(matches!(err, TunnelError::AuthRejected(_)));
}
