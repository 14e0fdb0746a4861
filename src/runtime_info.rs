//! Typed accessors over the state store, guarded by distributed locks

use crate::domain::ExhibitRuntimeInfo;
use crate::lock::{LockError, LockService};
use crate::state::{StateStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

/// Lock resource name serializing all runtime-info access for one exhibit.
/// The provisioner and the cleanup sweep take the write side of this same
/// resource, which is what keeps them from racing each other.
pub const RUNTIME_INFO_RESOURCE: &str = "runtime_info";

#[derive(Debug, Error)]
pub enum RuntimeInfoError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reads and writes the per-exhibit runtime record
pub struct RuntimeInfoService {
    store: Arc<dyn StateStore>,
    locks: Arc<LockService>,
}

impl RuntimeInfoService {
    pub fn new(store: Arc<dyn StateStore>, locks: Arc<LockService>) -> Self {
        Self { store, locks }
    }

    /// Read the runtime record under the shared lock. A missing record reads
    /// as the default (Stopped) one.
    pub async fn get(&self, exhibit_id: &str) -> Result<ExhibitRuntimeInfo, RuntimeInfoError> {
        let lock = self.locks.lock(exhibit_id, RUNTIME_INFO_RESOURCE);
        lock.read_lock().await?;

        let result = self.store.get_runtime_info(exhibit_id).await;
        let unlock = lock.read_unlock().await;
        if let Err(ref e) = unlock {
            error!(exhibit_id, error = %e, "failed to release runtime-info read lock");
        }

        let info = result?.unwrap_or_default();
        unlock?;
        Ok(info)
    }

    /// Write the runtime record. The caller must already hold the write lock
    /// on `(exhibit_id, "runtime_info")`.
    pub async fn set_locked(
        &self,
        exhibit_id: &str,
        info: &ExhibitRuntimeInfo,
    ) -> Result<(), StoreError> {
        self.store.set_runtime_info(exhibit_id, info).await
    }
}

/// Records when an exhibit last served a proxied request
pub struct LastAccessedService {
    store: Arc<dyn StateStore>,
}

impl LastAccessedService {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Stamp the exhibit as accessed now
    pub async fn touch(&self, exhibit_id: &str) -> Result<(), StoreError> {
        self.store.set_last_accessed(exhibit_id, Utc::now()).await
    }

    pub async fn get(&self, exhibit_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.store.get_last_accessed(exhibit_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RuntimeStatus;
    use crate::lock::LockSettings;
    use crate::state::MemoryStateStore;
    use std::time::Duration;

    fn services() -> (Arc<MemoryStateStore>, RuntimeInfoService) {
        let store = Arc::new(MemoryStateStore::new());
        let locks = Arc::new(LockService::new(
            store.clone() as Arc<dyn StateStore>,
            LockSettings::default(),
        ));
        let service = RuntimeInfoService::new(store.clone() as Arc<dyn StateStore>, locks);
        (store, service)
    }

    #[tokio::test]
    async fn test_missing_record_reads_as_stopped() {
        let (_store, service) = services();
        let info = service.get("unknown").await.unwrap();
        assert_eq!(info.status, RuntimeStatus::Stopped);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (_store, service) = services();
        let info = ExhibitRuntimeInfo {
            status: RuntimeStatus::Running,
            address: Some("127.0.0.1:9000".to_string()),
            instance_id: Some("inst".to_string()),
            started_at: Some(Utc::now()),
        };

        service.set_locked("e1", &info).await.unwrap();
        let read = service.get("e1").await.unwrap();
        assert_eq!(read.status, RuntimeStatus::Running);
        assert_eq!(read.address.as_deref(), Some("127.0.0.1:9000"));
    }

    #[tokio::test]
    async fn test_get_blocked_by_writer_times_out() {
        let store = Arc::new(MemoryStateStore::new());
        let locks = Arc::new(LockService::new(
            store.clone() as Arc<dyn StateStore>,
            LockSettings {
                acquire_timeout: Duration::from_millis(80),
                retry_interval: Duration::from_millis(10),
                lease_ttl: Duration::from_secs(30),
            },
        ));
        let service =
            RuntimeInfoService::new(store.clone() as Arc<dyn StateStore>, locks.clone());

        let writer = locks.lock("e1", RUNTIME_INFO_RESOURCE);
        writer.write_lock().await.unwrap();

        let result = service.get("e1").await;
        assert!(matches!(result, Err(RuntimeInfoError::Lock(_))));

        writer.write_unlock().await.unwrap();
        assert!(service.get("e1").await.is_ok());
    }

    #[tokio::test]
    async fn test_last_accessed_round_trip() {
        let store = Arc::new(MemoryStateStore::new());
        let service = LastAccessedService::new(store as Arc<dyn StateStore>);

        assert!(service.get("e1").await.unwrap().is_none());
        service.touch("e1").await.unwrap();
        let at = service.get("e1").await.unwrap().unwrap();
        assert!((Utc::now() - at).num_seconds() < 5);
    }
}
