//! Upload Session Registry: a process-wide map from `(backend_name, path)`
//! to a live upload session record, guarded by a single mutex. Sole arbiter
//! of the "one writer per path" invariant. Backend adapters never enforce
//! uniqueness themselves.

pub mod reaper;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::BackendKind;
use crate::error::{GatewayError, Result};
use crate::identity::Initiator;

pub type SessionKey = (String, String); // (backend_name, path)

/// Generic, backend-agnostic metadata the registry tracks for a live
/// upload. Backend-specific resources (temp file handles, chunk channels)
/// live inside the adapter itself, keyed by the opaque `backend_handle`
/// below; only the POSIX adapter needs such state.
pub struct UploadSessionMeta {
    pub initiator: Initiator,
    pub backend_name: String,
    pub backend_kind: BackendKind,
    /// The handle the backend adapter returned from `initiate_upload` for
    /// this particular attempt. Every later verb for this session must pass
    /// it back to the adapter so a registry-race loser only ever tears down
    /// the resources it created itself.
    pub backend_handle: String,
    last_activity: Mutex<DateTime<Utc>>,
}

impl UploadSessionMeta {
    pub fn new(
        initiator: Initiator,
        backend_name: String,
        backend_kind: BackendKind,
        backend_handle: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            initiator,
            backend_name,
            backend_kind,
            backend_handle,
            last_activity: Mutex::new(now),
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    pub fn touch(&self, now: DateTime<Utc>) {
        let mut guard = self.last_activity.lock();
        if now > *guard {
            *guard = now;
        }
    }
}

#[derive(Default)]
pub struct UploadSessionRegistry {
    sessions: Mutex<HashMap<SessionKey, Arc<UploadSessionMeta>>>,
}

impl UploadSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(backend: &str, path: &str) -> SessionKey {
        (backend.to_string(), path.to_string())
    }

    /// Insert a new session iff one does not already exist for this key.
    /// Fails with *conflict* otherwise.
    pub fn insert_if_absent(&self, backend: &str, path: &str, meta: UploadSessionMeta) -> Result<Arc<UploadSessionMeta>> {
        let key = Self::key(backend, path);
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&key) {
            return Err(GatewayError::Conflict(format!(
                "an upload is already in progress for {}/{}",
                backend, path
            )));
        }
        let meta = Arc::new(meta);
        sessions.insert(key, meta.clone());
        Ok(meta)
    }

    pub fn get(&self, backend: &str, path: &str) -> Option<Arc<UploadSessionMeta>> {
        self.sessions.lock().get(&Self::key(backend, path)).cloned()
    }

    pub fn remove(&self, backend: &str, path: &str) -> Option<Arc<UploadSessionMeta>> {
        self.sessions.lock().remove(&Self::key(backend, path))
    }

    pub fn touch_last_activity(&self, backend: &str, path: &str, now: DateTime<Utc>) {
        if let Some(meta) = self.sessions.lock().get(&Self::key(backend, path)) {
            meta.touch(now);
        }
    }

    pub fn snapshot(&self) -> Vec<(SessionKey, Arc<UploadSessionMeta>)> {
        self.sessions
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Remove every session whose `last_activity` is older than `cutoff`,
    /// under a single mutex acquisition. Callers invoke adapter `cancel` on
    /// the returned entries *outside* any lock.
    pub fn remove_idle(&self, cutoff: DateTime<Utc>) -> Vec<(SessionKey, Arc<UploadSessionMeta>)> {
        let mut sessions = self.sessions.lock();
        let idle_keys: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, meta)| meta.last_activity() < cutoff)
            .map(|(k, _)| k.clone())
            .collect();

        idle_keys
            .into_iter()
            .filter_map(|key| sessions.remove(&key).map(|meta| (key.clone(), meta)))
            .collect()
    }

    /// Remove every session initiated by `initiator`, under a single mutex
    /// acquisition.
    pub fn remove_for_initiator(&self, initiator: &Initiator) -> Vec<(SessionKey, Arc<UploadSessionMeta>)> {
        let mut sessions = self.sessions.lock();
        let matching_keys: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, meta)| &meta.initiator == initiator)
            .map(|(k, _)| k.clone())
            .collect();

        matching_keys
            .into_iter()
            .filter_map(|key| sessions.remove(&key).map(|meta| (key.clone(), meta)))
            .collect()
    }
}
