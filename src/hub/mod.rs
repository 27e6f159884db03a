//! Message Hub and Client Session: owns the set of active client sessions
//! (duplex and long-poll), dispatches inbound messages, and reaps idle
//! long-poll clients. On client disappearance it cancels that client's
//! in-flight uploads.

pub mod duplex;
pub mod longpoll;
pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::identity::{CallerIdentity, Initiator};
use crate::state::GatewayState;

/// Cascade-cancel cleanup runs under a fresh background context with its
/// own deadline, never the dying session's own context. Same 30s deadline
/// the reaper applies to its own backend `cancel` calls.
const CASCADE_CANCEL_DEADLINE: Duration = Duration::from_secs(30);

pub type ClientSessionId = crate::identity::SessionId;

/// Header used to correlate a stateless HTTP request (`/upload`, `/rpc`)
/// with a hub session, so anonymous-client cascade cancellation has a
/// stable identity to key on across both connections.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// One active client. Duplex sessions additionally own a reader/writer
/// task pair (spawned by [`duplex`]); long-poll sessions only carry
/// `last_activity`, refreshed per request.
pub struct ClientSession {
    pub id: ClientSessionId,
    pub caller: Option<CallerIdentity>,
    pub initiator: Initiator,
    pub is_duplex: bool,
    last_activity: Mutex<DateTime<Utc>>,
    cancelled: Arc<Notify>,
}

impl ClientSession {
    fn new(id: ClientSessionId, caller: Option<CallerIdentity>, initiator: Initiator, is_duplex: bool) -> Self {
        Self {
            id,
            caller,
            initiator,
            is_duplex,
            last_activity: Mutex::new(Utc::now()),
            cancelled: Arc::new(Notify::new()),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Fires the session's cancel handle. The reader/writer tasks select
    /// on this to unwind promptly.
    pub fn cancel(&self) {
        self.cancelled.notify_waiters();
    }

    pub fn cancel_handle(&self) -> Arc<Notify> {
        self.cancelled.clone()
    }
}

#[derive(Default)]
pub struct Hub {
    sessions: Mutex<HashMap<ClientSessionId, Arc<ClientSession>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, caller: Option<CallerIdentity>, initiator: Initiator, is_duplex: bool) -> Arc<ClientSession> {
        let id = ClientSessionId::new();
        let session = Arc::new(ClientSession::new(id, caller, initiator, is_duplex));
        self.sessions.lock().insert(id, session.clone());
        session
    }

    pub fn get(&self, id: ClientSessionId) -> Option<Arc<ClientSession>> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Unregister a session and cascade-cancel its in-flight uploads. The
    /// session's own context is already dead by the time this runs, so
    /// cleanup uses a fresh background context per adapter call.
    pub async fn unregister(&self, state: &GatewayState, id: ClientSessionId) {
        let session = match self.sessions.lock().remove(&id) {
            Some(session) => session,
            None => return,
        };
        session.cancel();

        let cancelled = state.registry.remove_for_initiator(&session.initiator);
        if cancelled.is_empty() {
            return;
        }
        info!(
            "hub: cancelling {} in-flight upload(s) for disconnected session {}",
            cancelled.len(),
            session.id
        );

        for ((backend_name, path), meta) in cancelled {
            let backend = match state.providers.get(&backend_name) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!("hub: backend '{}' vanished from configuration: {}", backend_name, e);
                    continue;
                }
            };
            match tokio::time::timeout(
                CASCADE_CANCEL_DEADLINE,
                backend.cancel_upload(Some(&meta.backend_handle), &path),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("hub: cascade cancel failed for {}/{}: {}", backend_name, path, e),
                Err(_) => warn!("hub: cascade cancel timed out for {}/{}", backend_name, path),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendDescriptor, BackendParams, GatewayConfig};
    use crate::identity::SessionId;
    use crate::session::UploadSessionMeta;
    use crate::state::GatewayState;

    fn config(root: &std::path::Path) -> GatewayConfig {
        GatewayConfig {
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
        }
    }

    #[tokio::test]
    async fn unregister_cascade_cancels_in_flight_uploads_for_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let state = GatewayState::new(config(dir.path()));

        let hub = Hub::new();
        let initiator = Initiator::Anonymous(SessionId::new());
        let session = hub.register(None, initiator.clone(), false);

        let backend = state.providers.get("local").unwrap();
        let (_, handle) = backend.initiate_upload(None, "partial.bin", 10, 5).await.unwrap();
        state
            .registry
            .insert_if_absent(
                "local",
                "partial.bin",
                UploadSessionMeta::new(
                    initiator,
                    "local".into(),
                    crate::config::BackendKind::Posix,
                    handle,
                    Utc::now(),
                ),
            )
            .unwrap();

        assert!(state.registry.get("local", "partial.bin").is_some());

        hub.unregister(&state, session.id).await;

        assert!(state.registry.get("local", "partial.bin").is_none());
        assert!(hub.get(session.id).is_none());
        // The POSIX backend's cancel_upload removes its temp file; a
        // second cancel must stay a no-op since it's required to be
        // idempotent.
        assert!(backend.cancel_upload(None, "partial.bin").await.is_ok());
    }

    #[tokio::test]
    async fn unregister_on_unknown_session_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let state = GatewayState::new(config(dir.path()));
        let hub = Hub::new();

        hub.unregister(&state, ClientSessionId::new()).await;
    }
}
