//! Long-poll transport for the Message Hub: a plain request/response over
//! HTTP. Each request is handled by a single task with a 30s deadline;
//! `lastActivity` is updated on every request so the idle reaper below can
//! unregister clients that stop polling.

use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Request, Response, StatusCode};
use log::info;
use tokio::time::interval;

use super::protocol::{handle_message, Envelope};
use super::{ClientSessionId, Hub, SESSION_ID_HEADER};
use crate::error::GatewayError;
use crate::identity::{CallerIdentity, Initiator};
use crate::state::GatewayState;

const PER_REQUEST_DEADLINE: Duration = Duration::from_secs(30);
const IDLE_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Handle one `/rpc` request. A client that doesn't yet have a session
/// gets one minted and returned via the `x-session-id` response header;
/// subsequent requests carry that header to rejoin the same session
/// (needed so cascade cancellation and idle reaping have a stable client
/// identity to key on, since long-poll has no persistent transport).
/// Parses the body as one envelope and dispatches it with the per-request
/// deadline.
pub async fn handle_request(
    state: &GatewayState,
    hub: &Hub,
    caller: Option<CallerIdentity>,
    initiator: Initiator,
    req: Request<Body>,
) -> Response<Body> {
    let existing_id: Option<ClientSessionId> = req
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok());

    let session = existing_id
        .and_then(|id| hub.get(id))
        .unwrap_or_else(|| hub.register(caller, initiator, false));
    session.touch();

    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => return error_response(&GatewayError::InvalidArgument(e.to_string()), session.id),
    };

    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            let err = Envelope {
                msg_type: "error".into(),
                payload: serde_json::json!({ "error_type": "payload_parse_error", "message": e.to_string() }),
                request_id: None,
            };
            return json_response(&err, session.id);
        }
    };

    let request_id = envelope.request_id.clone();
    let response = match tokio::time::timeout(PER_REQUEST_DEADLINE, handle_message(state, session.caller.as_ref(), envelope)).await {
        Ok(response) => response,
        Err(_) => Envelope {
            msg_type: "error".into(),
            payload: serde_json::json!({ "error_type": "storage_error", "message": "handler deadline exceeded" }),
            request_id,
        },
    };

    json_response(&response, session.id)
}

fn json_response(envelope: &Envelope, session_id: ClientSessionId) -> Response<Body> {
    let body = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .header(SESSION_ID_HEADER, session_id.to_string())
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn error_response(err: &GatewayError, session_id: ClientSessionId) -> Response<Body> {
    let envelope = Envelope {
        msg_type: "error".into(),
        payload: serde_json::json!({ "error_type": err.wire_error_type(), "message": err.to_string() }),
        request_id: None,
    };
    let body = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(err.http_status())
        .header("content-type", "application/json")
        .header(SESSION_ID_HEADER, session_id.to_string())
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Periodically unregisters long-poll sessions that have stopped polling.
/// There is no dedicated config knob for this timeout, so it reuses the
/// same `2 * pingInterval + 10s` window the duplex transport uses for its
/// read deadline.
pub async fn run_idle_reaper(state: Arc<GatewayState>, hub: Arc<Hub>) {
    let mut ticker = interval(IDLE_REAP_INTERVAL);
    loop {
        ticker.tick().await;
        let idle_after = Duration::from_millis(state.config.effective_ping_interval_ms()) * 2 + Duration::from_secs(10);
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(idle_after).unwrap_or_else(|_| chrono::Duration::seconds(30));

        let idle_sessions: Vec<ClientSessionId> = hub
            .snapshot()
            .into_iter()
            .filter(|s| !s.is_duplex && s.last_activity() < cutoff)
            .map(|s| s.id)
            .collect();

        if idle_sessions.is_empty() {
            continue;
        }
        info!("hub: reaping {} idle long-poll session(s)", idle_sessions.len());
        for id in idle_sessions {
            hub.unregister(&state, id).await;
        }
    }
}
