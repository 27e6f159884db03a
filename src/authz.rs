//! Authorization Evaluator. A pure function over configuration: given a
//! caller identity (possibly absent), a backend name, a path, and a
//! required access kind, decides allow/deny. Never touches I/O.

use crate::config::{Access, BackendDescriptor, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::identity::CallerIdentity;

/// Evaluate whether `caller` may perform `required` access on `path` within
/// `backend`. Rules are evaluated in a fixed order: auth-disabled
/// short-circuit, missing-identity deny, admin-group bypass, unknown-backend
/// fault, then per-group rule folding.
pub fn authorize(
    config: &GatewayConfig,
    caller: Option<&CallerIdentity>,
    backend: &str,
    _path: &str,
    required: Access,
) -> Result<()> {
    // Rule 1: auth disabled short-circuits to allow.
    if !config.auth_enabled {
        return Ok(());
    }

    // Rule 2: auth enabled but no identity -> deny.
    let caller = match caller {
        Some(caller) => caller,
        None => {
            return Err(GatewayError::PermissionDenied(
                "authentication required".into(),
            ))
        }
    };

    // Rule 3: global admin groups bypass per-backend rules entirely.
    if caller.is_in_any_group(&config.global_admin_groups) {
        return Ok(());
    }

    // Rule 4: unknown backend is a configuration fault, not a deny.
    let descriptor = config
        .find_backend(backend)
        .ok_or_else(|| GatewayError::NotFound(format!("backend '{}' not configured", backend)))?;

    // Rule 5: fold matching rules; write implies read.
    if rule_grants(descriptor, caller, required) {
        Ok(())
    } else {
        Err(GatewayError::PermissionDenied(format!(
            "no {:?} permission on backend '{}'",
            required, backend
        )))
    }
}

fn rule_grants(descriptor: &BackendDescriptor, caller: &CallerIdentity, required: Access) -> bool {
    let mut has_read = false;
    let mut has_write = false;
    for rule in &descriptor.permissions {
        if caller.groups.contains(&rule.group) {
            match rule.access {
                Access::Read => has_read = true,
                Access::Write => {
                    has_write = true;
                    has_read = true; // write implies read
                }
            }
        }
    }
    match required {
        Access::Read => has_read,
        Access::Write => has_write,
    }
}

/// Every backend for which `read` on the empty path would be allowed. The
/// sole projection exposed to `get_filesystems` requests.
pub fn list_accessible<'a>(
    config: &'a GatewayConfig,
    caller: Option<&CallerIdentity>,
) -> Vec<&'a BackendDescriptor> {
    config
        .backends
        .iter()
        .filter(|backend| authorize(config, caller, &backend.name, "", Access::Read).is_ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendParams, PermissionRule};
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn config(auth_enabled: bool) -> GatewayConfig {
        GatewayConfig {
            auth_enabled,
            global_admin_groups: vec!["admins".into()],
            client_ping_interval_ms: 10_000,
            upload_idle_timeout_secs: 60,
            backends: vec![BackendDescriptor {
                name: "local".into(),
                params: BackendParams::Posix {
                    root: PathBuf::from("/tmp"),
                },
                permissions: vec![PermissionRule {
                    group: "staff".into(),
                    access: Access::Write,
                }],
            }],
        }
    }

    fn caller(groups: &[&str]) -> CallerIdentity {
        CallerIdentity::new(
            "u1",
            "u1@example.com",
            groups.iter().map(|g| g.to_string()).collect::<HashSet<_>>(),
        )
    }

    #[test]
    fn auth_disabled_allows_everything() {
        let cfg = config(false);
        assert!(authorize(&cfg, None, "local", "x", Access::Write).is_ok());
    }

    #[test]
    fn missing_identity_denied_when_auth_enabled() {
        let cfg = config(true);
        assert!(authorize(&cfg, None, "local", "x", Access::Read).is_err());
    }

    #[test]
    fn admin_group_bypasses_rules() {
        let cfg = config(true);
        let caller = caller(&["admins"]);
        assert!(authorize(&cfg, Some(&caller), "local", "x", Access::Write).is_ok());
    }

    #[test]
    fn unknown_backend_is_not_found_not_deny() {
        let cfg = config(true);
        let caller = caller(&["staff"]);
        let err = authorize(&cfg, Some(&caller), "missing", "x", Access::Read).unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    #[test]
    fn write_rule_implies_read() {
        let cfg = config(true);
        let caller = caller(&["staff"]);
        assert!(authorize(&cfg, Some(&caller), "local", "x", Access::Read).is_ok());
        assert!(authorize(&cfg, Some(&caller), "local", "x", Access::Write).is_ok());
    }

    #[test]
    fn unrelated_group_denied() {
        let cfg = config(true);
        let caller = caller(&["guests"]);
        assert!(authorize(&cfg, Some(&caller), "local", "x", Access::Read).is_err());
    }

    #[test]
    fn list_accessible_is_pure_and_idempotent() {
        let cfg = config(true);
        let caller = caller(&["staff"]);
        let first = list_accessible(&cfg, Some(&caller));
        let second = list_accessible(&cfg, Some(&caller));
        assert_eq!(first.len(), 1);
        assert_eq!(first.len(), second.len());
    }
}
