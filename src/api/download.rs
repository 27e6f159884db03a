//! Download endpoint: `GET` with query `storage`, `path`; sets
//! `Content-Disposition` and streams the backend's byte stream as the
//! response body.

use std::collections::HashMap;

use hyper::{Body, Request, Response};

use crate::authz::authorize;
use crate::config::Access;
use crate::error::{GatewayError, Result};
use crate::identity::CallerIdentity;
use crate::state::GatewayState;

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            let decode = |s: &str| {
                percent_encoding::percent_decode_str(&s.replace('+', " "))
                    .decode_utf8_lossy()
                    .into_owned()
            };
            Some((decode(key), decode(value)))
        })
        .collect()
}

pub async fn handle_request(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    req: Request<Body>,
) -> Response<Body> {
    match handle_request_inner(state, caller, req).await {
        Ok(response) => response,
        Err(e) => super::upload::error_response(&e),
    }
}

async fn handle_request_inner(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let query = req.uri().query().unwrap_or("");
    let fields = parse_query(query);

    let storage = fields
        .get("storage")
        .ok_or_else(|| GatewayError::InvalidArgument("missing query parameter 'storage'".into()))?;
    let path = fields
        .get("path")
        .ok_or_else(|| GatewayError::InvalidArgument("missing query parameter 'path'".into()))?;

    authorize(&state.config, caller, storage, path, Access::Read)?;

    let backend = state.providers.get(storage)?;
    let stream = backend.open_read(caller, path).await?;

    let basename = path.rsplit('/').next().unwrap_or(path);
    let body = Body::wrap_stream(stream);

    Response::builder()
        .status(hyper::StatusCode::OK)
        .header("content-type", "application/octet-stream")
        .header(
            "content-disposition",
            format!("attachment; filename=\"{}\"", basename.replace('"', "")),
        )
        .body(body)
        .map_err(|e| GatewayError::InvalidArgument(format!("failed to build response: {}", e)))
}
