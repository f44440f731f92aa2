//! Runtime handler plugins
//!
//! A runtime handler names the helper plugin that serves a container's
//! capability set and the init image its guests boot from. Handlers are
//! registered at daemon startup; `create` resolves one by name.

use dashmap::DashMap;

use crate::error::{Error, Result};

/// One registered helper plugin.
#[derive(Debug, Clone)]
pub struct RuntimeHandler {
    /// Name selected by `ContainerConfiguration::runtime_handler`
    pub name: String,

    /// Image reference providing the platform init filesystem
    pub init_image: String,
}

#[derive(Default)]
pub struct RuntimeRegistry {
    handlers: DashMap<String, RuntimeHandler>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: RuntimeHandler) {
        self.handlers.insert(handler.name.clone(), handler);
    }

    pub fn get(&self, name: &str) -> Result<RuntimeHandler> {
        self.handlers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                Error::unsupported(format!("no runtime handler named {}", name))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let registry = RuntimeRegistry::new();
        registry.register(RuntimeHandler {
            name: "vz".into(),
            init_image: "harbor/init:latest".into(),
        });

        assert_eq!(registry.get("vz").unwrap().init_image, "harbor/init:latest");
        let err = registry.get("kata").unwrap_err();
        assert!(err.is_kind(crate::error::ErrorKind::Unsupported));
    }
}
