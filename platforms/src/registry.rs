use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::service::PlatformService;
use crate::types::{CredentialValidation, Platform};

/// Map-based factory of platform clients keyed by [`Platform`].
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    services: HashMap<Platform, Arc<dyn PlatformService>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` under its own platform key, replacing any previous one.
    pub fn with(mut self, service: Arc<dyn PlatformService>) -> Self {
        self.register(service);
        self
    }

    pub fn register(&mut self, service: Arc<dyn PlatformService>) {
        let platform = service.platform();
        if self.services.insert(platform, service).is_some() {
            warn!(%platform, "platform service replaced in registry");
        } else {
            debug!(%platform, "platform service registered");
        }
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformService>> {
        self.services.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut out: Vec<Platform> = self.services.keys().copied().collect();
        out.sort();
        out
    }

    /// Validates raw credentials with the service registered for `platform`.
    pub fn validate(&self, platform: &str, raw: &Value) -> Result<CredentialValidation, RegistryError> {
        let platform: Platform = platform.parse()?;
        let service = self
            .get(platform)
            .ok_or_else(|| RegistryError::NotRegistered(platform.to_string()))?;

        Ok(service.validate_credentials(raw))
    }
}

impl std::fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}
