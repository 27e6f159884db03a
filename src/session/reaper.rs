//! Reaper: a background task that periodically cancels upload sessions
//! whose `last_activity` exceeds the configured idle timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use tokio::time::interval;

use crate::provider::ProviderRegistry;
use crate::session::UploadSessionRegistry;

const REAP_INTERVAL: Duration = Duration::from_secs(60);
const CANCEL_DEADLINE: Duration = Duration::from_secs(30);

/// Run the reaper loop forever. Intended to be spawned once at startup and
/// left to run for the lifetime of the process; it never returns errors.
/// Every failure it encounters is logged and it moves on. Best-effort: a
/// cancel that fails leaves the session gone from the registry regardless.
///
/// The tick cadence is capped at `REAP_INTERVAL` but never exceeds the
/// configured idle timeout itself, so a short timeout still converges
/// within a couple of seconds instead of waiting out a fixed minute-long
/// tick.
pub async fn run(registry: Arc<UploadSessionRegistry>, providers: Arc<ProviderRegistry>, idle_timeout: Duration) {
    let tick = REAP_INTERVAL.min(idle_timeout).max(Duration::from_millis(200));
    let mut ticker = interval(tick);
    loop {
        ticker.tick().await;
        reap_once(&registry, &providers, idle_timeout).await;
    }
}

async fn reap_once(registry: &UploadSessionRegistry, providers: &ProviderRegistry, idle_timeout: Duration) {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(idle_timeout).unwrap_or_else(|_| chrono::Duration::seconds(3600));

    let idle = registry.remove_idle(cutoff);
    if idle.is_empty() {
        return;
    }
    info!("reaper: cancelling {} idle upload session(s)", idle.len());

    for ((backend_name, path), meta) in idle {
        let backend = match providers.get(&backend_name) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("reaper: backend '{}' vanished from configuration: {}", backend_name, e);
                continue;
            }
        };

        let outcome = tokio::time::timeout(
            CANCEL_DEADLINE,
            backend.cancel_upload(Some(&meta.backend_handle), &path),
        )
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("reaper: cancel failed for {}/{}: {}", backend_name, path, e),
            Err(_) => warn!("reaper: cancel timed out for {}/{}", backend_name, path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::identity::{Initiator, SessionId};
    use crate::session::UploadSessionMeta;

    #[tokio::test]
    async fn reap_once_cancels_only_idle_sessions() {
        let dir = tempfile::tempdir().unwrap();

        let config = crate::config::GatewayConfig {
            auth_enabled: false,
            global_admin_groups: Vec::new(),
            client_ping_interval_ms: 10_000,
            upload_idle_timeout_secs: 60,
            backends: vec![crate::config::BackendDescriptor {
                name: "local".into(),
                params: crate::config::BackendParams::Posix {
                    root: dir.path().to_path_buf(),
                },
                permissions: Vec::new(),
            }],
        };
        let providers = ProviderRegistry::from_config(&config);
        let (_, stale_handle) = providers
            .get("local")
            .unwrap()
            .initiate_upload(None, "stale.bin", 4, 4)
            .await
            .unwrap();
        let (_, fresh_handle) = providers
            .get("local")
            .unwrap()
            .initiate_upload(None, "fresh.bin", 4, 4)
            .await
            .unwrap();

        let registry = UploadSessionRegistry::new();
        let old = Utc::now() - chrono::Duration::hours(2);
        let fresh = Utc::now();
        registry
            .insert_if_absent(
                "local",
                "stale.bin",
                UploadSessionMeta::new(
                    Initiator::Anonymous(SessionId::new()),
                    "local".into(),
                    BackendKind::Posix,
                    stale_handle,
                    old,
                ),
            )
            .unwrap();
        registry
            .insert_if_absent(
                "local",
                "fresh.bin",
                UploadSessionMeta::new(
                    Initiator::Anonymous(SessionId::new()),
                    "local".into(),
                    BackendKind::Posix,
                    fresh_handle,
                    fresh,
                ),
            )
            .unwrap();

        reap_once(&registry, &providers, Duration::from_secs(3600)).await;

        assert!(registry.get("local", "stale.bin").is_none());
        assert!(registry.get("local", "fresh.bin").is_some());
    }
}
