use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use super::error::SandboxError;
use super::handle::Sandbox;

/// Builds a fresh, disconnected sandbox instance.
///
/// Constructors read their credentials up front, so a missing API key
/// surfaces here as `SandboxError::Config` before any network call.
pub type SandboxConstructor =
    Arc<dyn Fn() -> Result<Box<dyn Sandbox>, SandboxError> + Send + Sync + 'static>;

/// Name → constructor map.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, SandboxConstructor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        crate::providers::register_defaults(&mut registry);
        registry
    }

    /// Store `constructor` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Result<Box<dyn Sandbox>, SandboxError> + Send + Sync + 'static,
    {
        self.register_shared(name, Arc::new(constructor));
    }

    pub fn register_shared(&mut self, name: impl Into<String>, constructor: SandboxConstructor) {
        let name = name.into();
        if self.providers.insert(name.clone(), constructor).is_some() {
            tracing::debug!(provider = %name, "replaced registered sandbox provider");
        }
    }

    pub fn get(&self, name: &str) -> Result<SandboxConstructor, SandboxError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| SandboxError::ProviderNotFound(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.list())
            .finish()
    }
}

// Written at startup, read afterwards.
static GLOBAL: LazyLock<RwLock<ProviderRegistry>> =
    LazyLock::new(|| RwLock::new(ProviderRegistry::with_defaults()));

/// Register a provider in the process-wide registry.
pub fn register<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Result<Box<dyn Sandbox>, SandboxError> + Send + Sync + 'static,
{
    let mut registry = GLOBAL.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    registry.register(name, constructor);
}

pub fn get(name: &str) -> Result<SandboxConstructor, SandboxError> {
    let registry = GLOBAL.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    registry.get(name)
}

pub fn list() -> Vec<String> {
    let registry = GLOBAL.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    registry.list()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::E2bSandbox;
    use crate::testing::FakeCloud;

    fn fake() -> Result<Box<dyn Sandbox>, SandboxError> {
        Ok(Box::new(E2bSandbox::with_api(Arc::new(FakeCloud::new()))))
    }

    #[test]
    fn get_after_register_returns_same_constructor() {
        let mut registry = ProviderRegistry::new();
        let ctor: SandboxConstructor = Arc::new(fake);
        registry.register_shared("fake", ctor.clone());
        let found = registry.get("fake").unwrap();
        assert!(Arc::ptr_eq(&found, &ctor));
    }

    #[test]
    fn unknown_provider_fails() {
        let registry = ProviderRegistry::new();
        let err = registry.get("nimbus").err().unwrap();
        assert!(matches!(err, SandboxError::ProviderNotFound(name) if name == "nimbus"));
    }

    #[test]
    fn register_overwrites() {
        let mut registry = ProviderRegistry::new();
        registry.register("fake", fake);
        registry.register("fake", || Err(SandboxError::Config("replaced".into())));
        let ctor = registry.get("fake").unwrap();
        assert!(matches!(ctor(), Err(SandboxError::Config(msg)) if msg == "replaced"));
        assert_eq!(registry.list(), vec!["fake".to_string()]);
    }

    #[test]
    fn defaults_include_builtin_providers() {
        let names = ProviderRegistry::with_defaults().list();
        assert_eq!(
            names,
            vec!["beam", "codesandbox", "daytona", "e2b", "modal", "ssh"]
        );
    }

    #[test]
    fn global_registry_accepts_late_registration() {
        register("global-fake", fake);
        assert!(list().contains(&"global-fake".to_string()));
        let instance = get("global-fake").unwrap()().unwrap();
        assert_eq!(instance.provider(), "e2b");
        assert!(get("definitely-not-registered").is_err());
    }
}
