//! Integration coverage for idle-upload reaping: with a short idle timeout,
//! an upload that receives no further activity is reaped and its temp file
//! removed within a couple of seconds, with no explicit `cancel` call.

use std::time::Duration;

use filegate::config::{BackendDescriptor, BackendParams, GatewayConfig};
use filegate::identity::{Initiator, SessionId};
use filegate::session::reaper;
use filegate::state::GatewayState;

fn config(root: &std::path::Path) -> GatewayConfig {
    GatewayConfig {
        auth_enabled: false,
        global_admin_groups: Vec::new(),
        client_ping_interval_ms: 10_000,
        upload_idle_timeout_secs: 1,
        backends: vec![BackendDescriptor {
            name: "local".into(),
            params: BackendParams::Posix {
                root: root.to_path_buf(),
            },
            permissions: Vec::new(),
        }],
    }
}

#[tokio::test]
async fn idle_upload_is_reaped_within_bounded_time() {
    let dir = tempfile::tempdir().unwrap();
    let state = GatewayState::new(config(dir.path()));

    filegate::api::upload::initiate(
        &state,
        None,
        Initiator::Anonymous(SessionId::new()),
        "local",
        "idle.bin",
        10,
        5,
    )
    .await
    .unwrap();

    assert!(state.registry.get("local", "idle.bin").is_some());
    assert!(std::fs::read_dir(dir.path())
        .unwrap()
        .any(|e| e.unwrap().file_name().to_string_lossy().starts_with("upload-")));

    let registry = state.registry.clone();
    let providers = state.providers.clone();
    tokio::spawn(reaper::run(registry, providers, Duration::from_secs(1)));

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(state.registry.get("local", "idle.bin").is_none());
    assert!(!std::fs::read_dir(dir.path())
        .unwrap()
        .any(|e| e.unwrap().file_name().to_string_lossy().starts_with("upload-")));

    let uploaded = filegate::api::upload::status(&state, None, "local", "idle.bin")
        .await
        .unwrap();
    assert_eq!(uploaded, 0);
}
