//! Exhibit id to backend address resolution with a bounded cache

use crate::runtime::{ContainerRuntime, InstanceInfo, EXHIBIT_LABEL, PORT_LABEL};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// No live instance backs the exhibit; the caller may trigger a start
    #[error("no running instance for exhibit {0}")]
    NotRunning(String),
    /// The runtime query itself failed; the caller must fail the request
    #[error("resolution failed: {0}")]
    Infrastructure(String),
}

/// How a backend address is derived from a live instance. Chosen once at
/// startup by deployment topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolverStrategy {
    /// Orchestrator-level service discovery: address by instance name,
    /// resolved through the cluster DNS
    ServiceDiscovery,
    /// Inspect the runtime's host-network state: address by published
    /// loopback port
    HostNetwork,
}

/// Maps exhibit ids to reachable backend addresses.
///
/// Successful resolutions are cached with least-recently-used eviction; the
/// provisioner invalidates entries on every stop or restart, and the proxy
/// invalidates reactively when a cached address stops connecting.
pub struct ApplicationResolver {
    runtime: Arc<dyn ContainerRuntime>,
    strategy: ResolverStrategy,
    cache: Mutex<LruCache<String, String>>,
}

impl ApplicationResolver {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        strategy: ResolverStrategy,
        cache_capacity: NonZeroUsize,
    ) -> Self {
        Self {
            runtime,
            strategy,
            cache: Mutex::new(LruCache::new(cache_capacity)),
        }
    }

    /// Resolve the backend address for an exhibit
    pub async fn resolve(&self, exhibit_id: &str) -> Result<String, ResolveError> {
        if let Some(address) = self.cache.lock().get(exhibit_id).cloned() {
            return Ok(address);
        }

        let instances = self
            .runtime
            .list_instances(EXHIBIT_LABEL, exhibit_id)
            .await
            .map_err(|e| ResolveError::Infrastructure(e.to_string()))?;

        let instance = instances
            .into_iter()
            .find(|i| i.running)
            .ok_or_else(|| ResolveError::NotRunning(exhibit_id.to_string()))?;

        let address = self.address_of(&instance)?;
        debug!(exhibit_id, address, "Resolved backend address");
        self.cache
            .lock()
            .put(exhibit_id.to_string(), address.clone());
        Ok(address)
    }

    /// Drop a cached address. Called on stop/restart and on connect failure.
    pub fn invalidate(&self, exhibit_id: &str) {
        if self.cache.lock().pop(exhibit_id).is_some() {
            debug!(exhibit_id, "Invalidated cached address");
        }
    }

    fn address_of(&self, instance: &InstanceInfo) -> Result<String, ResolveError> {
        let port: u16 = instance
            .labels
            .get(PORT_LABEL)
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| {
                ResolveError::Infrastructure(format!(
                    "instance {} is missing the {} label",
                    instance.id, PORT_LABEL
                ))
            })?;

        match self.strategy {
            ResolverStrategy::ServiceDiscovery => {
                if instance.name.is_empty() {
                    return Err(ResolveError::Infrastructure(format!(
                        "instance {} has no name for service discovery",
                        instance.id
                    )));
                }
                Ok(format!("{}:{}", instance.name, port))
            }
            ResolverStrategy::HostNetwork => {
                let host_port = instance.host_ports.get(&port).ok_or_else(|| {
                    ResolveError::Infrastructure(format!(
                        "instance {} has no published binding for port {}",
                        instance.id, port
                    ))
                })?;
                Ok(format!("127.0.0.1:{}", host_port))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::MockRuntime;
    use crate::runtime::InstanceSpec;
    use std::collections::HashMap;

    fn labels_for(exhibit_id: &str, port: u16) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(EXHIBIT_LABEL.to_string(), exhibit_id.to_string());
        labels.insert(PORT_LABEL.to_string(), port.to_string());
        labels
    }

    async fn spawn_instance(runtime: &MockRuntime, exhibit_id: &str, port: u16) -> String {
        runtime
            .create_instance(&InstanceSpec {
                name: format!("galleria-{}", exhibit_id),
                image: "nginx:alpine".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                container_port: port,
                labels: labels_for(exhibit_id, port),
            })
            .await
            .unwrap()
    }

    fn resolver(runtime: Arc<MockRuntime>, capacity: usize) -> ApplicationResolver {
        ApplicationResolver::new(
            runtime,
            ResolverStrategy::HostNetwork,
            NonZeroUsize::new(capacity).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_resolve_host_network_address() {
        let runtime = Arc::new(MockRuntime::new());
        *runtime.host_port.lock() = Some(49152);
        spawn_instance(&runtime, "e1", 8080).await;

        let resolver = resolver(runtime, 10);
        assert_eq!(resolver.resolve("e1").await.unwrap(), "127.0.0.1:49152");
    }

    #[tokio::test]
    async fn test_resolve_service_discovery_address() {
        let runtime = Arc::new(MockRuntime::new());
        spawn_instance(&runtime, "e1", 8080).await;

        let resolver = ApplicationResolver::new(
            runtime,
            ResolverStrategy::ServiceDiscovery,
            NonZeroUsize::new(10).unwrap(),
        );
        assert_eq!(resolver.resolve("e1").await.unwrap(), "galleria-e1:8080");
    }

    #[tokio::test]
    async fn test_missing_instance_is_not_running() {
        let runtime = Arc::new(MockRuntime::new());
        let resolver = resolver(runtime, 10);
        assert!(matches!(
            resolver.resolve("ghost").await,
            Err(ResolveError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_runtime_query() {
        let runtime = Arc::new(MockRuntime::new());
        spawn_instance(&runtime, "e1", 8080).await;

        let resolver = resolver(Arc::clone(&runtime), 10);
        resolver.resolve("e1").await.unwrap();
        resolver.resolve("e1").await.unwrap();
        resolver.resolve("e1").await.unwrap();
        assert_eq!(runtime.list_call_count(), 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let runtime = Arc::new(MockRuntime::new());
        spawn_instance(&runtime, "a", 8080).await;
        spawn_instance(&runtime, "b", 8080).await;
        spawn_instance(&runtime, "c", 8080).await;

        let resolver = resolver(Arc::clone(&runtime), 2);
        resolver.resolve("a").await.unwrap();
        resolver.resolve("b").await.unwrap();
        resolver.resolve("c").await.unwrap();
        let after_fill = runtime.list_call_count();
        assert_eq!(after_fill, 3);

        // b and c are still cached
        resolver.resolve("b").await.unwrap();
        resolver.resolve("c").await.unwrap();
        assert_eq!(runtime.list_call_count(), after_fill);

        // a was evicted and needs a fresh query
        resolver.resolve("a").await.unwrap();
        assert_eq!(runtime.list_call_count(), after_fill + 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_requery() {
        let runtime = Arc::new(MockRuntime::new());
        spawn_instance(&runtime, "e1", 8080).await;

        let resolver = resolver(Arc::clone(&runtime), 10);
        resolver.resolve("e1").await.unwrap();
        resolver.invalidate("e1");
        resolver.resolve("e1").await.unwrap();
        assert_eq!(runtime.list_call_count(), 2);
    }

    #[tokio::test]
    async fn test_stopped_instance_is_not_running() {
        let runtime = Arc::new(MockRuntime::new());
        let id = spawn_instance(&runtime, "e1", 8080).await;
        runtime.instances.lock().get_mut(&id).unwrap().running = false;

        let resolver = resolver(runtime, 10);
        assert!(matches!(
            resolver.resolve("e1").await,
            Err(ResolveError::NotRunning(_))
        ));
    }
}
