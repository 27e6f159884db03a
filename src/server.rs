//! HTTP server wiring: binds a `hyper::Server`, resolves a caller identity
//! per request, and dispatches to the upload/download endpoints and the two
//! message-hub transports.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info};

use crate::hub::{Hub, SESSION_ID_HEADER};
use crate::identity::{CallerIdentity, Initiator, SessionId};
use crate::state::GatewayState;

/// Resolves the caller identity for one request. The identity-provider
/// handshake itself is an external collaborator; until one is
/// wired in, a request carries no identity and is treated as anonymous,
/// which `authz::authorize` already handles (deny when auth is enabled,
/// allow-all when it isn't).
fn resolve_caller(_req: &Request<Body>) -> Option<CallerIdentity> {
    None
}

/// An authenticated caller's subject is already a stable cascade key across
/// requests. An anonymous caller has none, so it must echo back the session
/// id its duplex or long-poll connection handed it (`x-session-id`) to keep
/// `/upload` requests correlated with that connection's cascade-cancellation
/// scope; with no such header this is a fresh, uncorrelated anonymous
/// identity.
fn resolve_initiator(caller: Option<&CallerIdentity>, req: &Request<Body>) -> Initiator {
    if let Some(caller) = caller {
        return Initiator::Identity(caller.subject.clone());
    }
    let session_id = req
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(SessionId::new);
    Initiator::Anonymous(session_id)
}

async fn dispatch(
    state: Arc<GatewayState>,
    hub: Arc<Hub>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let caller = resolve_caller(&req);
    let initiator = resolve_initiator(caller.as_ref(), &req);

    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/upload") => crate::api::upload::handle_request(&state, caller.as_ref(), initiator, req).await,
        (&Method::GET, "/download") => crate::api::download::handle_request(&state, caller.as_ref(), req).await,
        (&Method::GET, "/ws") => match crate::hub::duplex::upgrade(state.clone(), hub.clone(), caller, initiator, req) {
            Ok(response) => response,
            Err(e) => crate::api::upload::error_response(&e),
        },
        (&Method::POST, "/rpc") => crate::hub::longpoll::handle_request(&state, &hub, caller, initiator, req).await,
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .unwrap_or_else(|_| Response::new(Body::empty())),
    };

    Ok(response)
}

/// Bind and serve the gateway on `addr`, spawning the upload-session reaper
/// and the long-poll idle reaper as background tasks alongside it. Runs
/// until the process is signalled to stop.
pub async fn run(state: GatewayState, addr: SocketAddr) -> Result<(), hyper::Error> {
    let idle_timeout = std::time::Duration::from_secs(state.config.upload_idle_timeout_secs);
    let state = Arc::new(state);
    let hub = Arc::new(Hub::new());

    tokio::spawn(crate::session::reaper::run(
        state.registry.clone(),
        state.providers.clone(),
        idle_timeout,
    ));
    tokio::spawn(crate::hub::longpoll::run_idle_reaper(state.clone(), hub.clone()));

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        let hub = hub.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| dispatch(state.clone(), hub.clone(), req))) }
    });

    info!("file gateway listening on {}", addr);
    let server = Server::bind(&addr).serve(make_svc);
    if let Err(e) = server.await {
        error!("server error: {}", e);
        return Err(e);
    }
    Ok(())
}
