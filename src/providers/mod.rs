//! Provider collaborators.
//!
//! Chat providers, watchers, and similar long-running integrations live
//! behind the [`Provider`] trait. The gateway only knows how to start and
//! stop them, ask their status, and merge the gateway methods they
//! contribute into the method registry. Provider internals (wire formats,
//! polling loops) stay on the other side of the trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::server::ws::dispatch::{MethodHandler, MethodRegistry, RegistryError};
#[cfg(test)]
use crate::server::ws::dispatch::handler;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub id: String,
    /// Method names this provider contributes to the gateway registry.
    pub gateway_methods: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Stopped,
    Running,
    Errored,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider {0:?} is already registered")]
    AlreadyRegistered(String),

    #[error("unknown provider: {0}")]
    Unknown(String),

    #[error(transparent)]
    MethodCollision(#[from] RegistryError),

    #[error("provider {id} failed to {op}: {message}")]
    Lifecycle {
        id: String,
        op: &'static str,
        message: String,
    },
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn descriptor(&self) -> ProviderDescriptor;

    /// Handlers for the methods named in the descriptor.
    fn gateway_methods(&self) -> Vec<(String, MethodHandler)>;

    async fn start(&self) -> Result<(), ProviderError>;
    async fn stop(&self) -> Result<(), ProviderError>;
    fn status(&self) -> ProviderStatus;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider and merge its methods into `methods`. A duplicate
    /// provider id or method name is a configuration error, caught here
    /// before anything is served.
    pub fn register(
        &self,
        provider: Arc<dyn Provider>,
        methods: &MethodRegistry,
    ) -> Result<(), ProviderError> {
        let descriptor = provider.descriptor();
        {
            let providers = self.providers.read();
            if providers.contains_key(&descriptor.id) {
                return Err(ProviderError::AlreadyRegistered(descriptor.id));
            }
        }
        for (name, handler) in provider.gateway_methods() {
            methods.register(&name, handler)?;
        }
        info!(
            target: "gateway",
            provider = %descriptor.id,
            methods = descriptor.gateway_methods.len(),
            "provider registered"
        );
        self.providers.write().insert(descriptor.id, provider);
        Ok(())
    }

    pub fn list(&self) -> Vec<ProviderDescriptor> {
        let mut descriptors: Vec<ProviderDescriptor> = self
            .providers
            .read()
            .values()
            .map(|p| p.descriptor())
            .collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    pub fn status(&self, id: &str) -> Option<ProviderStatus> {
        self.providers.read().get(id).map(|p| p.status())
    }

    fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.read().get(id).cloned()
    }

    pub async fn start_all(&self) {
        let providers: Vec<Arc<dyn Provider>> =
            self.providers.read().values().cloned().collect();
        for provider in providers {
            let id = provider.descriptor().id;
            if let Err(e) = provider.start().await {
                warn!(target: "gateway", provider = %id, "provider start failed: {e}");
            }
        }
    }

    pub async fn stop_all(&self) {
        let providers: Vec<Arc<dyn Provider>> =
            self.providers.read().values().cloned().collect();
        for provider in providers {
            let id = provider.descriptor().id;
            if let Err(e) = provider.stop().await {
                warn!(target: "gateway", provider = %id, "provider stop failed: {e}");
            }
        }
    }

    /// Stop and start one provider, used when a hot reload touches its
    /// config section.
    pub async fn restart(&self, id: &str) -> Result<(), ProviderError> {
        let provider = self
            .get(id)
            .ok_or_else(|| ProviderError::Unknown(id.to_string()))?;
        provider.stop().await?;
        provider.start().await?;
        info!(target: "gateway", provider = %id, "provider restarted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        id: String,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl StubProvider {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn descriptor(&self) -> ProviderDescriptor {
            ProviderDescriptor {
                id: self.id.clone(),
                gateway_methods: vec![format!("{}.poke", self.id)],
            }
        }

        fn gateway_methods(&self) -> Vec<(String, MethodHandler)> {
            let name = format!("{}.poke", self.id);
            vec![(name, handler(|_params, _ctx| async { Ok(json!({"poked": true})) }))]
        }

        async fn start(&self) -> Result<(), ProviderError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), ProviderError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn status(&self) -> ProviderStatus {
            if self.starts.load(Ordering::SeqCst) > self.stops.load(Ordering::SeqCst) {
                ProviderStatus::Running
            } else {
                ProviderStatus::Stopped
            }
        }
    }

    #[test]
    fn test_register_contributes_methods() {
        let registry = ProviderRegistry::new();
        let methods = MethodRegistry::with_core_methods();
        registry
            .register(StubProvider::new("telegram"), &methods)
            .unwrap();
        assert!(methods.contains("telegram.poke"));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let registry = ProviderRegistry::new();
        let methods = MethodRegistry::with_core_methods();
        registry
            .register(StubProvider::new("telegram"), &methods)
            .unwrap();
        let err = registry
            .register(StubProvider::new("telegram"), &methods)
            .unwrap_err();
        assert!(matches!(err, ProviderError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_method_collision_with_core_rejected() {
        struct Colliding;

        #[async_trait]
        impl Provider for Colliding {
            fn descriptor(&self) -> ProviderDescriptor {
                ProviderDescriptor {
                    id: "bad".into(),
                    gateway_methods: vec!["ping".into()],
                }
            }
            fn gateway_methods(&self) -> Vec<(String, MethodHandler)> {
                vec![("ping".into(), handler(|_p, _c| async { Ok(json!({})) }))]
            }
            async fn start(&self) -> Result<(), ProviderError> {
                Ok(())
            }
            async fn stop(&self) -> Result<(), ProviderError> {
                Ok(())
            }
            fn status(&self) -> ProviderStatus {
                ProviderStatus::Stopped
            }
        }

        let registry = ProviderRegistry::new();
        let methods = MethodRegistry::with_core_methods();
        let err = registry.register(Arc::new(Colliding), &methods).unwrap_err();
        assert!(matches!(err, ProviderError::MethodCollision(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_and_restart() {
        let registry = ProviderRegistry::new();
        let methods = MethodRegistry::with_core_methods();
        let provider = StubProvider::new("gmail");
        registry.register(provider.clone(), &methods).unwrap();

        registry.start_all().await;
        assert_eq!(registry.status("gmail"), Some(ProviderStatus::Running));

        registry.restart("gmail").await.unwrap();
        assert_eq!(provider.starts.load(Ordering::SeqCst), 2);
        assert_eq!(provider.stops.load(Ordering::SeqCst), 1);

        registry.stop_all().await;
        assert_eq!(registry.status("gmail"), Some(ProviderStatus::Stopped));

        let err = registry.restart("ghost").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unknown(_)));
    }
}
