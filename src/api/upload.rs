//! Upload Orchestrator: the five-verb protocol that binds an authorization
//! check, a provider lookup, the session-registry mutex, and a backend
//! adapter into one operation per verb.
//!
//! This module is split in two layers: the orchestration functions below
//! operate purely in terms of domain types and are exercised directly by
//! tests; [`handle_request`] is the thin HTTP adapter that decodes a
//! `multipart/form-data` or `application/x-www-form-urlencoded` body into
//! those calls.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::Utc;
use hyper::{Body, Request, Response, StatusCode};
use log::warn;
use serde_json::json;

use crate::authz::authorize;
use crate::config::Access;
use crate::error::{GatewayError, Result};
use crate::identity::{CallerIdentity, Initiator};
use crate::session::UploadSessionMeta;
use crate::state::GatewayState;

/// `initiate(caller, backend, path, totalSize, chunkSize) -> alreadyUploadedBytes`
pub async fn initiate(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    initiator: Initiator,
    backend_name: &str,
    path: &str,
    total_size: u64,
    chunk_size: u64,
) -> Result<u64> {
    authorize(&state.config, caller, backend_name, path, Access::Write)?;

    if chunk_size == 0 {
        return Err(GatewayError::InvalidArgument("chunk_size must be > 0".into()));
    }

    // Phase 1: off the I/O path, just a uniqueness probe.
    if state.registry.get(backend_name, path).is_some() {
        return Err(GatewayError::Conflict(format!(
            "an upload is already in progress for {}/{}",
            backend_name, path
        )));
    }

    let backend = state.providers.get(backend_name)?;
    let (uploaded, handle) = backend.initiate_upload(caller, path, total_size, chunk_size).await?;

    // Phase 2: re-check uniqueness now that the slow backend-native setup
    // has happened (a racing initiate may have won in between). The handle
    // this call minted identifies only the instance it created, so a lost
    // race tears down exactly that instance and never the winner's.
    let meta = UploadSessionMeta::new(initiator, backend_name.to_string(), backend.kind(), handle.clone(), Utc::now());
    match state.registry.insert_if_absent(backend_name, path, meta) {
        Ok(_) => Ok(uploaded),
        Err(conflict) => {
            if let Err(e) = backend.cancel_upload(Some(&handle), path).await {
                warn!("initiate: teardown after lost race failed for {}/{}: {}", backend_name, path, e);
            }
            Err(conflict)
        }
    }
}

/// `chunk(caller, backend, path, chunkIndex, chunkSize, data, blockId?)`
#[allow(clippy::too_many_arguments)]
pub async fn chunk(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    backend_name: &str,
    path: &str,
    chunk_index: u64,
    chunk_size: u64,
    data: Bytes,
    block_id: Option<&str>,
) -> Result<()> {
    authorize(&state.config, caller, backend_name, path, Access::Write)?;

    let meta = state.registry.get(backend_name, path).ok_or_else(|| {
        GatewayError::NotFound(format!("no upload in progress for {}/{}", backend_name, path))
    })?;

    let backend = state.providers.get(backend_name)?;
    backend
        .write_chunk(&meta.backend_handle, path, chunk_index, chunk_size, data, block_id)
        .await?;
    state.registry.touch_last_activity(backend_name, path, Utc::now());
    Ok(())
}

/// `finalize(caller, backend, path, totalSize, expectedHash, blockIds?)`
pub async fn finalize(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    backend_name: &str,
    path: &str,
    total_size: u64,
    expected_hash: Option<&str>,
    block_ids: Option<&[String]>,
) -> Result<()> {
    authorize(&state.config, caller, backend_name, path, Access::Write)?;

    // Remove from the registry first so later verbs can't race against this
    // finalize.
    let meta = state.registry.remove(backend_name, path).ok_or_else(|| {
        GatewayError::NotFound(format!("no upload in progress for {}/{}", backend_name, path))
    })?;

    let backend = state.providers.get(backend_name)?;
    backend
        .finalize_upload(&meta.backend_handle, path, total_size, expected_hash, block_ids)
        .await
}

/// `cancel(caller, backend, path)`. Idempotent: a second `cancel` on an
/// already-gone session still returns success.
pub async fn cancel(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    backend_name: &str,
    path: &str,
) -> Result<()> {
    authorize(&state.config, caller, backend_name, path, Access::Write)?;
    let meta = state.registry.remove(backend_name, path);
    let backend = state.providers.get(backend_name)?;
    backend.cancel_upload(meta.as_ref().map(|m| &m.backend_handle), path).await
}

/// `status(caller, backend, path) -> uploadedBytes`
pub async fn status(state: &GatewayState, caller: Option<&CallerIdentity>, backend_name: &str, path: &str) -> Result<u64> {
    authorize(&state.config, caller, backend_name, path, Access::Write)?;
    let meta = state.registry.get(backend_name, path);
    let backend = state.providers.get(backend_name)?;
    backend.upload_status(meta.as_ref().map(|m| &m.backend_handle), path).await
}

// --- HTTP adapter -----------------------------------------------------

fn parse_urlencoded(body: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(body);
    text.split('&')
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

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(|s| s.as_str())
        .ok_or_else(|| GatewayError::InvalidArgument(format!("missing field '{}'", name)))
}

fn parse_u64(fields: &HashMap<String, String>, name: &str) -> Result<u64> {
    required(fields, name)?
        .parse::<u64>()
        .map_err(|_| GatewayError::InvalidArgument(format!("field '{}' must be a non-negative integer", name)))
}

pub fn error_response(err: &GatewayError) -> Response<Body> {
    let body = json!({
        "error_type": err.wire_error_type(),
        "message": err.to_string(),
    });
    Response::builder()
        .status(err.http_status())
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::from("{}")))
}

fn json_response(value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Handle one `/upload` request. `caller`/`initiator` have already been
/// resolved by the surrounding middleware; authorization happens inside
/// the per-verb functions above, not here.
pub async fn handle_request(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    initiator: Initiator,
    req: Request<Body>,
) -> Response<Body> {
    match handle_request_inner(state, caller, initiator, req).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

async fn handle_request_inner(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    initiator: Initiator,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        handle_multipart(state, caller, initiator, req, &content_type).await
    } else {
        let body = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(|e| GatewayError::InvalidArgument(format!("failed to read request body: {}", e)))?;
        let fields = parse_urlencoded(&body);
        dispatch_urlencoded(state, caller, initiator, &fields).await
    }
}

async fn dispatch_urlencoded(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    initiator: Initiator,
    fields: &HashMap<String, String>,
) -> Result<Response<Body>> {
    let action = required(fields, "action")?;
    let storage = required(fields, "storage")?;
    let path = required(fields, "path")?;

    match action {
        "initiate" => {
            let total_size = parse_u64(fields, "total_file_size")?;
            let chunk_size = parse_u64(fields, "chunk_size")?;
            let uploaded = initiate(state, caller, initiator, storage, path, total_size, chunk_size).await?;
            Ok(json_response(json!({ "uploaded_size": uploaded })))
        }
        "finalize" => {
            let total_size = parse_u64(fields, "total_file_size")?;
            let expected_hash = fields.get("client_sha256").map(|s| s.as_str());
            let block_ids: Option<Vec<String>> = match fields.get("block_ids") {
                Some(raw) => Some(
                    serde_json::from_str(raw)
                        .map_err(|e| GatewayError::InvalidArgument(format!("bad block_ids: {}", e)))?,
                ),
                None => None,
            };
            finalize(state, caller, storage, path, total_size, expected_hash, block_ids.as_deref()).await?;
            Ok(json_response(json!({ "status": "success" })))
        }
        "cancel" => {
            cancel(state, caller, storage, path).await?;
            Ok(json_response(json!({ "status": "success" })))
        }
        "status" => {
            let uploaded = status(state, caller, storage, path).await?;
            Ok(json_response(json!({ "uploaded_size": uploaded })))
        }
        "chunk" => Err(GatewayError::InvalidArgument(
            "chunk requires multipart/form-data".into(),
        )),
        other => Err(GatewayError::InvalidArgument(format!("unknown action '{}'", other))),
    }
}

async fn handle_multipart(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    _initiator: Initiator,
    req: Request<Body>,
    content_type: &str,
) -> Result<Response<Body>> {
    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| GatewayError::InvalidArgument(format!("bad multipart boundary: {}", e)))?;
    let mut multipart = multer::Multipart::new(req.into_body(), boundary);

    let mut storage: Option<String> = None;
    let mut path: Option<String> = None;
    let mut chunk_index: Option<u64> = None;
    let mut chunk_size: Option<u64> = None;
    let mut block_id: Option<String> = None;
    let mut data: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::InvalidArgument(format!("bad multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "storage" => storage = Some(field.text().await.unwrap_or_default()),
            "path" => path = Some(field.text().await.unwrap_or_default()),
            "chunk_index" => {
                chunk_index = field.text().await.ok().and_then(|s| s.parse().ok());
            }
            "chunk_size" => {
                chunk_size = field.text().await.ok().and_then(|s| s.parse().ok());
            }
            "block_id" => block_id = field.text().await.ok(),
            "chunk" => {
                data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| GatewayError::InvalidArgument(format!("bad chunk data: {}", e)))?,
                )
            }
            _ => {}
        }
    }

    let storage = storage.ok_or_else(|| GatewayError::InvalidArgument("missing field 'storage'".into()))?;
    let path = path.ok_or_else(|| GatewayError::InvalidArgument("missing field 'path'".into()))?;
    let chunk_index = chunk_index.ok_or_else(|| GatewayError::InvalidArgument("missing field 'chunk_index'".into()))?;
    let chunk_size = chunk_size.ok_or_else(|| GatewayError::InvalidArgument("missing field 'chunk_size'".into()))?;
    let data = data.ok_or_else(|| GatewayError::InvalidArgument("missing file part 'chunk'".into()))?;

    chunk(state, caller, &storage, &path, chunk_index, chunk_size, data, block_id.as_deref()).await?;
    Ok(json_response(json!({ "status": "success" })))
}
