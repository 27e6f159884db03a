//! Wire protocol for the Message Hub: JSON envelopes shared by the duplex
//! and long-poll transports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::authz::{authorize, list_accessible};
use crate::config::Access;
use crate::error::GatewayError;
use crate::identity::CallerIdentity;
use crate::state::GatewayState;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "request_id", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn config_update(ping_interval_ms: u64) -> Self {
        Self {
            msg_type: "config_update".into(),
            payload: json!({ "client_ping_interval_ms": ping_interval_ms }),
            request_id: None,
        }
    }

    pub fn ping() -> Self {
        Self {
            msg_type: "ping".into(),
            payload: Value::Null,
            request_id: None,
        }
    }

    fn error(error_type: &'static str, message: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            msg_type: "error".into(),
            payload: json!({ "error_type": error_type, "message": message.into() }),
            request_id,
        }
    }
}

#[derive(Deserialize)]
struct ListDirectoryRequest {
    storage_name: String,
    dir_path: String,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_items_per_page")]
    items_per_page: u32,
    name_filter: Option<String>,
    timestamp_filter: Option<DateTime<Utc>>,
    #[serde(default)]
    only_directories: bool,
}

fn default_page() -> u32 {
    1
}

fn default_items_per_page() -> u32 {
    50
}

#[derive(Deserialize)]
struct CreateDirectoryRequest {
    storage_name: String,
    dir_path: String,
}

#[derive(Deserialize)]
struct DeleteItemRequest {
    storage_name: String,
    item_path: String,
}

#[derive(Deserialize)]
struct CheckDirectoryContentsRequest {
    storage_name: String,
    dir_path: String,
}

/// Dispatch one inbound envelope to its handler and build the response
/// envelope (success or `error`), matching the request's `request_id`.
pub async fn handle_message(state: &GatewayState, caller: Option<&CallerIdentity>, envelope: Envelope) -> Envelope {
    let request_id = envelope.request_id.clone();

    let outcome: Result<(String, Value), (&'static str, String)> = match envelope.msg_type.as_str() {
        "get_filesystems" => Ok(handle_get_filesystems(state, caller)),
        "list_directory" => handle_list_directory(state, caller, envelope.payload).await,
        "create_directory" => handle_create_directory(state, caller, envelope.payload).await,
        "delete_item" => handle_delete_item(state, caller, envelope.payload).await,
        "check_directory_contents_request" => handle_check_contents(state, caller, envelope.payload).await,
        "ping" => Ok(("pong".to_string(), envelope.payload.clone())),
        other => Err(("unsupported_type", format!("unsupported message type '{}'", other))),
    };

    match outcome {
        Ok((msg_type, payload)) => Envelope {
            msg_type,
            payload,
            request_id,
        },
        Err((error_type, message)) => Envelope::error(error_type, message, request_id),
    }
}

fn handle_get_filesystems(state: &GatewayState, caller: Option<&CallerIdentity>) -> (String, Value) {
    let backends = list_accessible(&state.config, caller);
    let summaries: Vec<Value> = backends
        .iter()
        .map(|b| json!({ "name": b.name, "kind": b.kind() }))
        .collect();
    ("get_filesystems_response".to_string(), json!(summaries))
}

async fn handle_list_directory(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    payload: Value,
) -> Result<(String, Value), (&'static str, String)> {
    let req: ListDirectoryRequest =
        serde_json::from_value(payload).map_err(|e| ("payload_parse_error", e.to_string()))?;

    authorize(&state.config, caller, &req.storage_name, &req.dir_path, Access::Read)
        .map_err(|e| auth_or(&e, "list_error"))?;

    let backend = state
        .providers
        .get(&req.storage_name)
        .map_err(|e| ("list_error", e.to_string()))?;

    let opts = crate::backend::ListOptions {
        page: req.page,
        per_page: req.items_per_page,
        name_regex: req.name_filter,
        since: req.timestamp_filter,
        only_dirs: req.only_directories,
    };

    let result = backend
        .list(caller, &req.dir_path, opts)
        .await
        .map_err(|e| ("list_error", e.to_string()))?;

    Ok((
        "list_directory_response".to_string(),
        json!({
            "items": result.items,
            "total_items": result.total,
            "page": result.page,
            "items_per_page": result.per_page,
            "storage_name": req.storage_name,
            "dir_path": req.dir_path,
        }),
    ))
}

async fn handle_create_directory(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    payload: Value,
) -> Result<(String, Value), (&'static str, String)> {
    let req: CreateDirectoryRequest =
        serde_json::from_value(payload).map_err(|e| ("payload_parse_error", e.to_string()))?;

    authorize(&state.config, caller, &req.storage_name, &req.dir_path, Access::Write)
        .map_err(|e| auth_or(&e, "create_dir_error"))?;

    let backend = state
        .providers
        .get(&req.storage_name)
        .map_err(|e| ("create_dir_error", e.to_string()))?;

    backend
        .create_dir(caller, &req.dir_path)
        .await
        .map_err(|e| ("create_dir_error", e.to_string()))?;

    let name = req.dir_path.rsplit('/').next().unwrap_or(&req.dir_path).to_string();
    Ok((
        "create_directory_response".to_string(),
        json!({ "status": "success", "dir_path": req.dir_path, "name": name }),
    ))
}

async fn handle_delete_item(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    payload: Value,
) -> Result<(String, Value), (&'static str, String)> {
    let req: DeleteItemRequest =
        serde_json::from_value(payload).map_err(|e| ("payload_parse_error", e.to_string()))?;

    authorize(&state.config, caller, &req.storage_name, &req.item_path, Access::Write)
        .map_err(|e| auth_or(&e, "delete_item_error"))?;

    let backend = state
        .providers
        .get(&req.storage_name)
        .map_err(|e| ("delete_item_error", e.to_string()))?;

    backend
        .delete(caller, &req.item_path)
        .await
        .map_err(|e| ("delete_item_error", e.to_string()))?;

    let name = req.item_path.rsplit('/').next().unwrap_or(&req.item_path).to_string();
    Ok((
        "delete_item_response".to_string(),
        json!({ "status": "success", "item_path": req.item_path, "name": name }),
    ))
}

async fn handle_check_contents(
    state: &GatewayState,
    caller: Option<&CallerIdentity>,
    payload: Value,
) -> Result<(String, Value), (&'static str, String)> {
    let req: CheckDirectoryContentsRequest =
        serde_json::from_value(payload).map_err(|e| ("payload_parse_error", e.to_string()))?;

    authorize(&state.config, caller, &req.storage_name, &req.dir_path, Access::Read)
        .map_err(|e| auth_or(&e, "check_contents_error"))?;

    let backend = state
        .providers
        .get(&req.storage_name)
        .map_err(|e| ("check_contents_error", e.to_string()))?;

    let opts = crate::backend::ListOptions {
        page: 1,
        per_page: 1,
        ..Default::default()
    };
    let result = backend
        .list(caller, &req.dir_path, opts)
        .await
        .map_err(|e| ("check_contents_error", e.to_string()))?;

    Ok((
        "check_directory_contents_request_response".to_string(),
        json!({ "has_contents": result.total > 0, "dir_path": req.dir_path }),
    ))
}

/// `auth_error` takes priority over the per-verb error name whenever the
/// underlying failure was actually a permission denial.
fn auth_or(err: &GatewayError, verb_error_type: &'static str) -> (&'static str, String) {
    match err {
        GatewayError::PermissionDenied(_) => ("auth_error", err.to_string()),
        _ => (verb_error_type, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendDescriptor, BackendParams, GatewayConfig};

    fn state(root: &std::path::Path) -> GatewayState {
        let config = GatewayConfig {
            auth_enabled: false,
            global_admin_groups: Vec::new(),
            client_ping_interval_ms: 10_000,
            upload_idle_timeout_secs: 3600,
            backends: vec![BackendDescriptor {
                name: "local".into(),
                params: BackendParams::Posix {
                    root: root.to_path_buf(),
                },
                permissions: Vec::new(),
            }],
        };
        GatewayState::new(config)
    }

    fn request(msg_type: &str, payload: Value) -> Envelope {
        Envelope {
            msg_type: msg_type.to_string(),
            payload,
            request_id: Some("req-1".to_string()),
        }
    }

    #[tokio::test]
    async fn ping_echoes_payload_and_request_id() {
        let dir = tempfile::tempdir().unwrap();
        let gw = state(dir.path());
        let response = handle_message(&gw, None, request("ping", json!({"nonce": 7}))).await;
        assert_eq!(response.msg_type, "pong");
        assert_eq!(response.payload, json!({"nonce": 7}));
        assert_eq!(response.request_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn get_filesystems_lists_configured_backends() {
        let dir = tempfile::tempdir().unwrap();
        let gw = state(dir.path());
        let response = handle_message(&gw, None, request("get_filesystems", Value::Null)).await;
        assert_eq!(response.msg_type, "get_filesystems_response");
        assert_eq!(response.payload[0]["name"], json!("local"));
    }

    #[tokio::test]
    async fn list_directory_returns_entries_for_an_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hi").await.unwrap();
        let gw = state(dir.path());

        let response = handle_message(
            &gw,
            None,
            request(
                "list_directory",
                json!({"storage_name": "local", "dir_path": ""}),
            ),
        )
        .await;

        assert_eq!(response.msg_type, "list_directory_response");
        assert_eq!(response.payload["total_items"], json!(1));
    }

    #[tokio::test]
    async fn list_directory_with_malformed_payload_reports_payload_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let gw = state(dir.path());

        let response = handle_message(&gw, None, request("list_directory", json!({"storage_name": "local"}))).await;

        assert_eq!(response.msg_type, "error");
        assert_eq!(response.payload["error_type"], json!("payload_parse_error"));
        assert_eq!(response.request_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn create_directory_then_delete_item_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let gw = state(dir.path());

        let created = handle_message(
            &gw,
            None,
            request("create_directory", json!({"storage_name": "local", "dir_path": "sub"})),
        )
        .await;
        assert_eq!(created.msg_type, "create_directory_response");
        assert!(dir.path().join("sub").is_dir());

        let deleted = handle_message(
            &gw,
            None,
            request("delete_item", json!({"storage_name": "local", "item_path": "sub"})),
        )
        .await;
        assert_eq!(deleted.msg_type, "delete_item_response");
        assert!(!dir.path().join("sub").exists());
    }

    #[tokio::test]
    async fn check_directory_contents_reports_false_for_an_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let gw = state(dir.path());

        let response = handle_message(
            &gw,
            None,
            request(
                "check_directory_contents_request",
                json!({"storage_name": "local", "dir_path": ""}),
            ),
        )
        .await;

        assert_eq!(response.msg_type, "check_directory_contents_request_response");
        assert_eq!(response.payload["has_contents"], json!(false));
    }

    #[tokio::test]
    async fn unknown_message_type_reports_unsupported_type() {
        let dir = tempfile::tempdir().unwrap();
        let gw = state(dir.path());

        let response = handle_message(&gw, None, request("does_not_exist", Value::Null)).await;

        assert_eq!(response.msg_type, "error");
        assert_eq!(response.payload["error_type"], json!("unsupported_type"));
        assert_eq!(response.request_id.as_deref(), Some("req-1"));
    }
}
