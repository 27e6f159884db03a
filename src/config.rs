//! Configuration data model.
//!
//! Full configuration lifecycle management is an external collaborator's
//! concern, but the data types below are load-bearing for every other
//! component, and a straightforward loader is required to exercise the
//! system in tests and in `filegatectl config check`. There is deliberately
//! no hot-reload, no schema migration, and no multi-file include mechanism
//! here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

/// Required access kind for an operation against an item.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Write,
}

/// A single `(group-name, access)` permission rule attached to a backend.
/// A `write` rule implies `read`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionRule {
    pub group: String,
    pub access: Access,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Posix,
    BlockList,
}

/// Kind-specific parameters for a backend descriptor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendParams {
    Posix { root: PathBuf },
    BlockList { root: PathBuf },
}

impl BackendParams {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendParams::Posix { .. } => BackendKind::Posix,
            BackendParams::BlockList { .. } => BackendKind::BlockList,
        }
    }

    pub fn root(&self) -> &Path {
        match self {
            BackendParams::Posix { root } => root,
            BackendParams::BlockList { root } => root,
        }
    }
}

/// Immutable record describing one configured backend. Lifetime = process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub params: BackendParams,
    #[serde(default)]
    pub permissions: Vec<PermissionRule>,
}

impl BackendDescriptor {
    pub fn kind(&self) -> BackendKind {
        self.params.kind()
    }
}

fn default_ping_interval_ms() -> u64 {
    10_000
}

fn default_idle_timeout_secs() -> u64 {
    3600
}

/// Process-wide configuration: backend descriptors, global authorization
/// knobs, and the hub's heartbeat/reaper tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub auth_enabled: bool,
    #[serde(default)]
    pub global_admin_groups: Vec<String>,
    #[serde(default = "default_ping_interval_ms")]
    pub client_ping_interval_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub upload_idle_timeout_secs: u64,
    pub backends: Vec<BackendDescriptor>,
}

impl GatewayConfig {
    /// Reject non-positive ping intervals, falling back to the 10s default.
    pub fn effective_ping_interval_ms(&self) -> u64 {
        if self.client_ping_interval_ms == 0 {
            default_ping_interval_ms()
        } else {
            self.client_ping_interval_ms
        }
    }

    pub fn backend_map(&self) -> HashMap<String, &BackendDescriptor> {
        self.backends.iter().map(|b| (b.name.clone(), b)).collect()
    }

    pub fn find_backend(&self, name: &str) -> Option<&BackendDescriptor> {
        self.backends.iter().find(|b| b.name == name)
    }

    fn validate(&self) -> Result<(), Error> {
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.name.clone()) {
                bail!("duplicate backend name '{}'", backend.name);
            }
            if backend.name.is_empty() {
                bail!("backend name must not be empty");
            }
        }
        Ok(())
    }
}

/// Load and validate a TOML configuration document from disk.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<GatewayConfig, Error> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read config file {:?}", path))?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<GatewayConfig, Error> {
    let config: GatewayConfig =
        toml::from_str(raw).with_context(|| "unable to parse gateway configuration")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
            auth_enabled = false
            global_admin_groups = ["admins"]

            [[backends]]
            name = "local"
            kind = "posix"
            root = "/srv/files"

            [[backends.permissions]]
            group = "staff"
            access = "write"
        "#;
        let config = parse_config(raw).unwrap();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].kind(), BackendKind::Posix);
        assert_eq!(config.effective_ping_interval_ms(), 10_000);
    }

    #[test]
    fn rejects_duplicate_backend_names() {
        let raw = r#"
            [[backends]]
            name = "dup"
            kind = "posix"
            root = "/a"

            [[backends]]
            name = "dup"
            kind = "block-list"
            root = "/b"
        "#;
        assert!(parse_config(raw).is_err());
    }

    #[test]
    fn zero_ping_interval_falls_back_to_default() {
        let raw = r#"
            client_ping_interval_ms = 0
            backends = []
        "#;
        let config = parse_config(raw).unwrap();
        assert_eq!(config.effective_ping_interval_ms(), 10_000);
    }
}
