//! CRUD for exhibit definitions

use crate::domain::{Exhibit, ExhibitDefinition};
use crate::lock::{LockError, LockService};
use crate::runtime_info::RUNTIME_INFO_RESOURCE;
use crate::state::{StateStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ExhibitError {
    #[error("no exhibit with id {0}")]
    NotFound(String),
    #[error("invalid exhibit definition: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Manages exhibit definitions in the state store. Definitions are immutable
/// after creation; lifecycle state lives in the runtime-info record instead.
pub struct ExhibitService {
    store: Arc<dyn StateStore>,
    locks: Arc<LockService>,
}

impl ExhibitService {
    pub fn new(store: Arc<dyn StateStore>, locks: Arc<LockService>) -> Self {
        Self { store, locks }
    }

    /// Validate and persist a new exhibit, returning its assigned id
    pub async fn create(&self, definition: ExhibitDefinition) -> Result<String, ExhibitError> {
        if definition.name.trim().is_empty() {
            return Err(ExhibitError::Validation("name must not be empty".into()));
        }
        if definition.image.trim().is_empty() {
            return Err(ExhibitError::Validation("image must not be empty".into()));
        }
        if definition.port == 0 {
            return Err(ExhibitError::Validation("port must be non-zero".into()));
        }
        if definition.idle_ttl_secs == 0 {
            return Err(ExhibitError::Validation(
                "idle_ttl_secs must be non-zero".into(),
            ));
        }

        let exhibit = definition.into_exhibit();
        self.store.set_exhibit(&exhibit).await?;
        info!(exhibit_id = %exhibit.id, name = %exhibit.name, image = %exhibit.image, "Exhibit created");
        Ok(exhibit.id)
    }

    pub async fn get(&self, id: &str) -> Result<Exhibit, ExhibitError> {
        self.store
            .get_exhibit(id)
            .await?
            .ok_or_else(|| ExhibitError::NotFound(id.to_string()))
    }

    pub async fn get_all(&self) -> Result<Vec<Exhibit>, ExhibitError> {
        Ok(self.store.list_exhibits().await?)
    }

    pub async fn count(&self) -> Result<usize, ExhibitError> {
        Ok(self.store.list_exhibits().await?.len())
    }

    /// Remove the definition along with its runtime and last-accessed
    /// records. The runtime record is removed under the write lock so a
    /// concurrent provisioning pass cannot interleave.
    pub async fn delete(&self, id: &str) -> Result<(), ExhibitError> {
        // existence check first so a bogus id is a 404, not a silent no-op
        self.get(id).await?;

        let lock = self.locks.lock(id, RUNTIME_INFO_RESOURCE);
        lock.write_lock().await?;

        let result = async {
            self.store.delete_exhibit(id).await?;
            self.store.delete_runtime_info(id).await?;
            self.store.delete_last_accessed(id).await?;
            Ok::<(), StoreError>(())
        }
        .await;

        let unlock = lock.write_unlock().await;
        if let Err(ref e) = unlock {
            error!(exhibit_id = id, error = %e, "failed to release lock after delete");
        }

        result?;
        unlock?;
        info!(exhibit_id = id, "Exhibit deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LivecheckSpec;
    use crate::lock::LockSettings;
    use crate::state::MemoryStateStore;
    use std::collections::HashMap;

    fn service() -> ExhibitService {
        let store = Arc::new(MemoryStateStore::new());
        let locks = Arc::new(LockService::new(
            store.clone() as Arc<dyn StateStore>,
            LockSettings::default(),
        ));
        ExhibitService::new(store as Arc<dyn StateStore>, locks)
    }

    fn definition(name: &str, image: &str, port: u16) -> ExhibitDefinition {
        ExhibitDefinition {
            name: name.to_string(),
            image: image.to_string(),
            args: Vec::new(),
            environment: HashMap::new(),
            port,
            livecheck: LivecheckSpec::default(),
            idle_ttl_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let service = service();

        let id = service
            .create(definition("demo", "nginx:alpine", 80))
            .await
            .unwrap();
        assert_eq!(service.get(&id).await.unwrap().name, "demo");
        assert_eq!(service.count().await.unwrap(), 1);

        service.delete(&id).await.unwrap();
        assert!(matches!(
            service.get(&id).await,
            Err(ExhibitError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_definitions() {
        let service = service();

        assert!(matches!(
            service.create(definition("", "img", 80)).await,
            Err(ExhibitError::Validation(_))
        ));
        assert!(matches!(
            service.create(definition("a", "", 80)).await,
            Err(ExhibitError::Validation(_))
        ));
        assert!(matches!(
            service.create(definition("a", "img", 0)).await,
            Err(ExhibitError::Validation(_))
        ));

        let mut def = definition("a", "img", 80);
        def.idle_ttl_secs = 0;
        assert!(matches!(
            service.create(def).await,
            Err(ExhibitError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let service = service();
        assert!(matches!(
            service.delete("ghost").await,
            Err(ExhibitError::NotFound(_))
        ));
    }
}
