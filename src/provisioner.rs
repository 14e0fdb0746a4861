//! Backend provisioning: starts and stops exhibit instances under the
//! distributed write lock
//!
//! Every status mutation for one exhibit happens while holding the write
//! lock on `(id, "runtime_info")`, which totally orders start/stop across
//! all gateway replicas: two replicas can never create duplicate backends
//! for the same exhibit.

use crate::domain::{Exhibit, ExhibitRuntimeInfo, RuntimeStatus};
use crate::livecheck::LivecheckRunner;
use crate::lock::{LockError, LockService};
use crate::resolver::ApplicationResolver;
use crate::runtime::{ContainerRuntime, InstanceSpec, EXHIBIT_LABEL, PORT_LABEL};
use crate::runtime_info::RUNTIME_INFO_RESOURCE;
use crate::state::{StateStore, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("container runtime error: {0}")]
    Runtime(String),
    #[error("livecheck failed: {0}")]
    Livecheck(String),
}

/// Consumed contract: expands an exhibit's environment template into the
/// concrete environment mapping passed to the instance.
pub trait EnvironmentTemplateResolver: Send + Sync {
    fn resolve(&self, exhibit: &Exhibit) -> HashMap<String, String>;
}

/// Substitutes `{{exhibit_id}}`, `{{exhibit_name}}` and `{{port}}` in
/// template values
pub struct PlaceholderTemplateResolver;

impl EnvironmentTemplateResolver for PlaceholderTemplateResolver {
    fn resolve(&self, exhibit: &Exhibit) -> HashMap<String, String> {
        exhibit
            .environment
            .iter()
            .map(|(k, v)| {
                let value = v
                    .replace("{{exhibit_id}}", &exhibit.id)
                    .replace("{{exhibit_name}}", &exhibit.name)
                    .replace("{{port}}", &exhibit.port.to_string());
                (k.clone(), value)
            })
            .collect()
    }
}

/// Starts and stops backend instances for exhibits
pub struct ApplicationProvisioner {
    store: Arc<dyn StateStore>,
    locks: Arc<LockService>,
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<ApplicationResolver>,
    livecheck: LivecheckRunner,
    env_resolver: Arc<dyn EnvironmentTemplateResolver>,
}

impl ApplicationProvisioner {
    pub fn new(
        store: Arc<dyn StateStore>,
        locks: Arc<LockService>,
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<ApplicationResolver>,
        livecheck: LivecheckRunner,
        env_resolver: Arc<dyn EnvironmentTemplateResolver>,
    ) -> Self {
        Self {
            store,
            locks,
            runtime,
            resolver,
            livecheck,
            env_resolver,
        }
    }

    /// Start the exhibit's backend. Idempotent: a Starting or Running record
    /// means another caller (possibly on another replica) already won, and
    /// this call returns success without side effects.
    pub async fn start(&self, exhibit: &Exhibit) -> Result<(), ProvisionError> {
        let lock = self.locks.lock(&exhibit.id, RUNTIME_INFO_RESOURCE);
        lock.write_lock().await?;

        let result = self.start_locked(exhibit).await;

        // The lock must come off on every exit path; a leaked lease blocks
        // the exhibit until the TTL fires.
        if let Err(unlock_err) = lock.write_unlock().await {
            error!(exhibit_id = %exhibit.id, error = %unlock_err, "failed to release provisioning lock");
            result?;
            return Err(ProvisionError::Lock(unlock_err));
        }
        result
    }

    async fn start_locked(&self, exhibit: &Exhibit) -> Result<(), ProvisionError> {
        let current = self
            .store
            .get_runtime_info(&exhibit.id)
            .await?
            .unwrap_or_default();

        match current.status {
            RuntimeStatus::Starting | RuntimeStatus::Running => {
                info!(exhibit_id = %exhibit.id, status = ?current.status, "Backend already up, skipping start");
                return Ok(());
            }
            _ => {}
        }

        let mut info = ExhibitRuntimeInfo {
            status: RuntimeStatus::Starting,
            address: None,
            instance_id: None,
            started_at: Some(Utc::now()),
        };
        self.store.set_runtime_info(&exhibit.id, &info).await?;

        match self.launch(exhibit).await {
            Ok((instance_id, address)) => {
                info.status = RuntimeStatus::Running;
                info.address = Some(address.clone());
                info.instance_id = Some(instance_id);
                self.store.set_runtime_info(&exhibit.id, &info).await?;
                // the cache may still hold the address of a previous instance
                self.resolver.invalidate(&exhibit.id);
                info!(exhibit_id = %exhibit.id, address, "Backend running");
                Ok(())
            }
            Err(e) => {
                info.status = RuntimeStatus::Failed;
                info.address = None;
                info.instance_id = None;
                if let Err(store_err) = self.store.set_runtime_info(&exhibit.id, &info).await {
                    warn!(exhibit_id = %exhibit.id, error = %store_err, "failed to record Failed status");
                }
                self.resolver.invalidate(&exhibit.id);
                warn!(exhibit_id = %exhibit.id, error = %e, "Backend start failed");
                Err(e)
            }
        }
    }

    /// Create the instance, resolve its address and drive the livecheck.
    /// A partially created instance is torn down on any failure.
    async fn launch(&self, exhibit: &Exhibit) -> Result<(String, String), ProvisionError> {
        let env = self.env_resolver.resolve(exhibit);

        let mut labels = HashMap::new();
        labels.insert(EXHIBIT_LABEL.to_string(), exhibit.id.clone());
        labels.insert(PORT_LABEL.to_string(), exhibit.port.to_string());

        let spec = InstanceSpec {
            name: format!("galleria-{}", exhibit.id),
            image: exhibit.image.clone(),
            args: exhibit.args.clone(),
            env,
            container_port: exhibit.port,
            labels,
        };

        let instance_id = self
            .runtime
            .create_instance(&spec)
            .await
            .map_err(|e| ProvisionError::Runtime(e.to_string()))?;

        let address = match self.resolver.resolve(&exhibit.id).await {
            Ok(address) => address,
            Err(e) => {
                self.teardown(&exhibit.id, &instance_id).await;
                return Err(ProvisionError::Runtime(e.to_string()));
            }
        };

        if let Err(e) = self
            .livecheck
            .wait_ready(exhibit, &instance_id, &address)
            .await
        {
            self.teardown(&exhibit.id, &instance_id).await;
            return Err(ProvisionError::Livecheck(e.to_string()));
        }

        Ok((instance_id, address))
    }

    async fn teardown(&self, exhibit_id: &str, instance_id: &str) {
        if let Err(e) = self.runtime.remove_instance(instance_id).await {
            warn!(exhibit_id, instance_id, error = %e, "failed to tear down partial instance");
        }
        self.resolver.invalidate(exhibit_id);
    }

    /// Stop the exhibit's backend and publish the Stopped record
    pub async fn stop(&self, exhibit_id: &str) -> Result<(), ProvisionError> {
        let lock = self.locks.lock(exhibit_id, RUNTIME_INFO_RESOURCE);
        lock.write_lock().await?;

        let result = self.stop_locked(exhibit_id).await;

        if let Err(unlock_err) = lock.write_unlock().await {
            error!(exhibit_id, error = %unlock_err, "failed to release provisioning lock");
            result?;
            return Err(ProvisionError::Lock(unlock_err));
        }
        result
    }

    async fn stop_locked(&self, exhibit_id: &str) -> Result<(), ProvisionError> {
        let current = self
            .store
            .get_runtime_info(exhibit_id)
            .await?
            .unwrap_or_default();

        // Failed records may still reference a leftover instance
        let stoppable = matches!(
            current.status,
            RuntimeStatus::Running | RuntimeStatus::Failed
        );
        if !stoppable {
            info!(exhibit_id, status = ?current.status, "Nothing to stop");
            return Ok(());
        }

        let mut info = current.clone();
        info.status = RuntimeStatus::Stopping;
        self.store.set_runtime_info(exhibit_id, &info).await?;

        if let Some(ref instance_id) = current.instance_id {
            self.runtime
                .remove_instance(instance_id)
                .await
                .map_err(|e| ProvisionError::Runtime(e.to_string()))?;
        }

        info.status = RuntimeStatus::Stopped;
        info.address = None;
        info.instance_id = None;
        info.started_at = None;
        self.store.set_runtime_info(exhibit_id, &info).await?;
        self.resolver.invalidate(exhibit_id);
        info!(exhibit_id, "Backend stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExhibitDefinition, LivecheckProbe, LivecheckSpec};
    use crate::lock::LockSettings;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::resolver::ResolverStrategy;
    use crate::runtime::testing::MockRuntime;
    use crate::state::MemoryStateStore;
    use std::num::NonZeroUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn exhibit() -> Exhibit {
        let mut environment = HashMap::new();
        environment.insert("SELF".to_string(), "{{exhibit_name}}:{{port}}".to_string());
        ExhibitDefinition {
            name: "demo".to_string(),
            image: "nginx:alpine".to_string(),
            args: Vec::new(),
            environment,
            port: 8080,
            // exec probe against the mock runtime succeeds immediately
            livecheck: LivecheckSpec {
                probe: LivecheckProbe::Exec {
                    command: vec!["true".to_string()],
                    expect_exit: 0,
                },
                interval_ms: 10,
                timeout_secs: 5,
                max_attempts: 5,
            },
            idle_ttl_secs: 60,
        }
        .into_exhibit()
    }

    struct Harness {
        store: Arc<MemoryStateStore>,
        runtime: Arc<MockRuntime>,
        resolver: Arc<ApplicationResolver>,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStateStore::new());
            let runtime = Arc::new(MockRuntime::new());
            let resolver = Arc::new(ApplicationResolver::new(
                runtime.clone() as Arc<dyn ContainerRuntime>,
                ResolverStrategy::HostNetwork,
                NonZeroUsize::new(100).unwrap(),
            ));
            Self {
                store,
                runtime,
                resolver,
            }
        }

        /// One provisioner per simulated gateway replica; the store and the
        /// container runtime are the shared infrastructure
        fn replica(&self) -> ApplicationProvisioner {
            let locks = Arc::new(LockService::new(
                self.store.clone() as Arc<dyn StateStore>,
                LockSettings {
                    acquire_timeout: Duration::from_secs(10),
                    retry_interval: Duration::from_millis(5),
                    lease_ttl: Duration::from_secs(30),
                },
            ));
            ApplicationProvisioner::new(
                self.store.clone() as Arc<dyn StateStore>,
                locks,
                self.runtime.clone() as Arc<dyn ContainerRuntime>,
                self.resolver.clone(),
                LivecheckRunner::new(
                    self.runtime.clone() as Arc<dyn ContainerRuntime>,
                    Arc::new(ConnectionPool::new(PoolConfig::default())),
                ),
                Arc::new(PlaceholderTemplateResolver),
            )
        }

        async fn status(&self, id: &str) -> RuntimeStatus {
            self.store
                .get_runtime_info(id)
                .await
                .unwrap()
                .unwrap_or_default()
                .status
        }
    }

    #[tokio::test]
    async fn test_start_publishes_running_record() {
        let harness = Harness::new();
        let provisioner = harness.replica();
        let e = exhibit();

        provisioner.start(&e).await.unwrap();

        let info = harness.store.get_runtime_info(&e.id).await.unwrap().unwrap();
        assert_eq!(info.status, RuntimeStatus::Running);
        assert_eq!(info.address.as_deref(), Some("127.0.0.1:8080"));
        assert!(info.instance_id.is_some());
        assert!(info.started_at.is_some());
        assert_eq!(harness.runtime.created_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_start_has_no_side_effects() {
        let harness = Harness::new();
        let provisioner = harness.replica();
        let e = exhibit();

        provisioner.start(&e).await.unwrap();
        provisioner.start(&e).await.unwrap();
        provisioner.start(&e).await.unwrap();

        assert_eq!(harness.runtime.created_count(), 1);
        assert_eq!(harness.status(&e.id).await, RuntimeStatus::Running);
    }

    #[tokio::test]
    async fn test_concurrent_starts_across_replicas_create_one_backend() {
        let harness = Harness::new();
        let e = exhibit();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let provisioner = harness.replica();
            let e = e.clone();
            tasks.push(tokio::spawn(async move { provisioner.start(&e).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(harness.runtime.created_count(), 1);
        assert_eq!(harness.status(&e.id).await, RuntimeStatus::Running);
    }

    #[tokio::test]
    async fn test_create_failure_records_failed_status() {
        let harness = Harness::new();
        harness.runtime.fail_creates.store(true, Ordering::SeqCst);
        let provisioner = harness.replica();
        let e = exhibit();

        let result = provisioner.start(&e).await;
        assert!(matches!(result, Err(ProvisionError::Runtime(_))));
        assert_eq!(harness.status(&e.id).await, RuntimeStatus::Failed);
    }

    #[tokio::test]
    async fn test_livecheck_failure_tears_down_instance() {
        let harness = Harness::new();
        harness.runtime.exec_exit.store(1, Ordering::SeqCst);
        let provisioner = harness.replica();
        let e = exhibit();

        let result = provisioner.start(&e).await;
        assert!(matches!(result, Err(ProvisionError::Livecheck(_))));
        assert_eq!(harness.status(&e.id).await, RuntimeStatus::Failed);
        assert_eq!(harness.runtime.created_count(), 1);
        assert_eq!(harness.runtime.removed_count(), 1);
        assert!(harness.runtime.instances.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_exhibit_can_be_restarted() {
        let harness = Harness::new();
        harness.runtime.exec_exit.store(1, Ordering::SeqCst);
        let provisioner = harness.replica();
        let e = exhibit();

        assert!(provisioner.start(&e).await.is_err());

        harness.runtime.exec_exit.store(0, Ordering::SeqCst);
        provisioner.start(&e).await.unwrap();
        assert_eq!(harness.status(&e.id).await, RuntimeStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_running_backend() {
        let harness = Harness::new();
        let provisioner = harness.replica();
        let e = exhibit();

        provisioner.start(&e).await.unwrap();
        provisioner.stop(&e.id).await.unwrap();

        let info = harness.store.get_runtime_info(&e.id).await.unwrap().unwrap();
        assert_eq!(info.status, RuntimeStatus::Stopped);
        assert!(info.address.is_none());
        assert!(info.instance_id.is_none());
        assert_eq!(harness.runtime.removed_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let harness = Harness::new();
        let provisioner = harness.replica();
        let e = exhibit();

        provisioner.stop(&e.id).await.unwrap();
        assert_eq!(harness.runtime.removed_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_invalidates_cached_address() {
        let harness = Harness::new();
        let provisioner = harness.replica();
        let e = exhibit();

        provisioner.start(&e).await.unwrap();
        harness.resolver.resolve(&e.id).await.unwrap();
        let queries_before = harness.runtime.list_call_count();

        provisioner.stop(&e.id).await.unwrap();

        // the next resolve must requery and observe the instance gone
        assert!(harness.resolver.resolve(&e.id).await.is_err());
        assert!(harness.runtime.list_call_count() > queries_before);
    }

    #[test]
    fn test_placeholder_template_resolution() {
        let e = exhibit();
        let env = PlaceholderTemplateResolver.resolve(&e);
        assert_eq!(env.get("SELF").unwrap(), "demo:8080");
    }
}
