//! Provider Registry: a named lookup table of backend adapter instances,
//! built once at startup from configuration. Read-mostly after
//! construction; no runtime add/remove of backends.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::block_list::BlockListBackend;
use crate::backend::posix::PosixBackend;
use crate::backend::Backend;
use crate::config::{BackendParams, GatewayConfig};
use crate::error::{GatewayError, Result};

pub struct ProviderRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut backends: HashMap<String, Arc<dyn Backend>> = HashMap::new();
        for descriptor in &config.backends {
            let backend: Arc<dyn Backend> = match &descriptor.params {
                BackendParams::Posix { root } => Arc::new(PosixBackend::new(descriptor.name.clone(), root.clone())),
                BackendParams::BlockList { root } => {
                    Arc::new(BlockListBackend::new(descriptor.name.clone(), root.clone()))
                }
            };
            backends.insert(descriptor.name.clone(), backend);
        }
        Self { backends }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("backend '{}' not configured", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendDescriptor;

    #[test]
    fn builds_one_adapter_per_descriptor() {
        let config = GatewayConfig {
            auth_enabled: false,
            global_admin_groups: Vec::new(),
            client_ping_interval_ms: 10_000,
            upload_idle_timeout_secs: 60,
            backends: vec![
                BackendDescriptor {
                    name: "local".into(),
                    params: BackendParams::Posix {
                        root: "/tmp".into(),
                    },
                    permissions: Vec::new(),
                },
                BackendDescriptor {
                    name: "objects".into(),
                    params: BackendParams::BlockList {
                        root: "/tmp".into(),
                    },
                    permissions: Vec::new(),
                },
            ],
        };

        let registry = ProviderRegistry::from_config(&config);
        assert!(registry.get("local").is_ok());
        assert!(registry.get("objects").is_ok());
        assert!(registry.get("missing").is_err());
    }
}
