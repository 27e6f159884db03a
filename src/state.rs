//! Process-wide shared state: configuration, the Provider Registry, and the
//! Upload Session Registry. One instance lives behind an `Arc` for the
//! lifetime of the process and is handed to every request handler and
//! background task.

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::provider::ProviderRegistry;
use crate::session::UploadSessionRegistry;

pub struct GatewayState {
    pub config: GatewayConfig,
    pub providers: Arc<ProviderRegistry>,
    pub registry: Arc<UploadSessionRegistry>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Self {
        let providers = Arc::new(ProviderRegistry::from_config(&config));
        Self {
            config,
            providers,
            registry: Arc::new(UploadSessionRegistry::new()),
        }
    }
}
