//! Native duplex transport for the Message Hub: an HTTP upgrade handshake
//! via `hyper::upgrade::on`, followed by a `tokio-tungstenite` framed
//! connection carrying JSON envelopes.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper::{Body, Request, Response, StatusCode};
use log::warn;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::protocol::{handle_message, Envelope};
use super::{ClientSession, Hub};
use crate::error::GatewayError;
use crate::identity::{CallerIdentity, Initiator};
use crate::state::GatewayState;

const PER_MESSAGE_DEADLINE: Duration = Duration::from_secs(60);
const QUEUE_CAPACITY: usize = 64;

/// Handle the `/ws` upgrade request: register the session, answer
/// `101 Switching Protocols` immediately, and drive the connection on a
/// spawned task that finishes the handshake in the background.
pub fn upgrade(
    state: Arc<GatewayState>,
    hub: Arc<Hub>,
    caller: Option<CallerIdentity>,
    initiator: Initiator,
    req: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let session = hub.register(caller, initiator, true);

    // Handed back so the client can tag its `/upload` requests with the
    // same session id: cascade cancellation on disconnect only reaches
    // uploads registered under this exact `Initiator`, and an anonymous
    // caller has no other stable identity to correlate the two connections
    // by.
    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "upgrade")
        .header(hyper::header::UPGRADE, "websocket")
        .header(super::SESSION_ID_HEADER, session.id.to_string())
        .body(Body::empty())
        .map_err(|e| GatewayError::InvalidArgument(e.to_string()))?;

    let ping_interval_ms = state.config.effective_ping_interval_ms();

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("duplex: upgrade failed: {}", e);
                hub.unregister(&state, session.id).await;
                return;
            }
        };
        run_session(state, hub, session, ping_interval_ms, upgraded).await;
    });

    Ok(response)
}

async fn run_session(
    state: Arc<GatewayState>,
    hub: Arc<Hub>,
    session: Arc<ClientSession>,
    ping_interval_ms: u64,
    upgraded: Upgraded,
) {
    let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
    let (mut writer, mut reader) = ws.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(QUEUE_CAPACITY);

    if let Ok(text) = serde_json::to_string(&Envelope::config_update(ping_interval_ms)) {
        let _ = outbound_tx.send(Message::Text(text)).await;
    }

    let cancel = session.cancel_handle();
    let writer_cancel = cancel.clone();
    let ping_interval = Duration::from_millis(ping_interval_ms.max(1));

    // One writer task per session; it holds the only handle to the sink,
    // so outbound writes and heartbeats never race each other. Sole
    // ownership stands in for a short-lived lock around each write.
    let writer_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        loop {
            tokio::select! {
                biased;
                _ = writer_cancel.notified() => break,
                _ = ticker.tick() => {
                    if writer.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                maybe_msg = outbound_rx.recv() => {
                    match maybe_msg {
                        Some(msg) => if writer.send(msg).await.is_err() { break },
                        None => break,
                    }
                }
            }
        }
        let _ = writer.close().await;
    });

    // Read deadline is `2 * pingInterval + 10s`; any inbound frame
    // (including a pong) resets it for the next iteration.
    let read_deadline = ping_interval * 2 + Duration::from_secs(10);

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.notified() => break,
            result = tokio::time::timeout(read_deadline, reader.next()) => result,
        };

        let message = match message {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                warn!("duplex: transport error on session {}: {}", session.id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("duplex: read deadline exceeded for session {}", session.id);
                break;
            }
        };

        session.touch();

        match message {
            Message::Text(text) => dispatch_one(state.clone(), outbound_tx.clone(), session.caller.clone(), text),
            Message::Pong(_) => {}
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer_task.abort();
    hub.unregister(&state, session.id).await;
}

/// Dispatch one inbound message to its own task with a per-message
/// deadline, so a slow handler can never stall the reader loop.
fn dispatch_one(
    state: Arc<GatewayState>,
    outbound_tx: mpsc::Sender<Message>,
    caller: Option<CallerIdentity>,
    text: String,
) {
    tokio::spawn(async move {
        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                let err = Envelope {
                    msg_type: "error".into(),
                    payload: serde_json::json!({ "error_type": "payload_parse_error", "message": e.to_string() }),
                    request_id: None,
                };
                if let Ok(text) = serde_json::to_string(&err) {
                    let _ = outbound_tx.send(Message::Text(text)).await;
                }
                return;
            }
        };

        let request_id = envelope.request_id.clone();
        let response = match tokio::time::timeout(PER_MESSAGE_DEADLINE, handle_message(&state, caller.as_ref(), envelope)).await {
            Ok(response) => response,
            Err(_) => Envelope {
                msg_type: "error".into(),
                payload: serde_json::json!({ "error_type": "storage_error", "message": "handler deadline exceeded" }),
                request_id,
            },
        };

        if let Ok(text) = serde_json::to_string(&response) {
            let _ = outbound_tx.send(Message::Text(text)).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendDescriptor, BackendParams, GatewayConfig};
    use crate::state::GatewayState;

    fn state() -> Arc<GatewayState> {
        Arc::new(GatewayState::new(GatewayConfig {
            auth_enabled: false,
            global_admin_groups: Vec::new(),
            client_ping_interval_ms: 10_000,
            upload_idle_timeout_secs: 3600,
            backends: vec![BackendDescriptor {
                name: "local".into(),
                params: BackendParams::Posix {
                    root: std::env::temp_dir(),
                },
                permissions: Vec::new(),
            }],
        }))
    }

    async fn recv_envelope(rx: &mut mpsc::Receiver<Message>) -> Envelope {
        match rx.recv().await.expect("dispatch_one should always reply") {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_json_yields_a_payload_parse_error() {
        let (tx, mut rx) = mpsc::channel(1);
        dispatch_one(state(), tx, None, "not json".into());

        let envelope = recv_envelope(&mut rx).await;
        assert_eq!(envelope.msg_type, "error");
        assert_eq!(envelope.payload["error_type"], serde_json::json!("payload_parse_error"));
    }

    #[tokio::test]
    async fn a_ping_message_echoes_its_request_id() {
        let (tx, mut rx) = mpsc::channel(1);
        let text = serde_json::to_string(&Envelope {
            msg_type: "ping".into(),
            payload: serde_json::json!({"nonce": 1}),
            request_id: Some("abc".into()),
        })
        .unwrap();
        dispatch_one(state(), tx, None, text);

        let envelope = recv_envelope(&mut rx).await;
        assert_eq!(envelope.msg_type, "pong");
        assert_eq!(envelope.request_id.as_deref(), Some("abc"));
    }
}
