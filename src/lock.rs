//! Distributed per-resource RW mutex over the state store
//!
//! Gateway replicas are stateless, so in-process synchronization cannot
//! prevent two replicas from provisioning the same exhibit. Every lock
//! acquire/release is a round trip to the state store, which arbitrates via
//! lease records. Leases expire after a TTL so a crashed holder cannot block
//! an exhibit forever.

use crate::state::{StateStore, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Errors from lock acquisition or release.
///
/// Callers must never proceed as if holding a lock that failed to acquire,
/// and a failed release is fatal for the affected exhibit until the lease
/// TTL fires.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out acquiring lock {key} after {waited_ms}ms")]
    AcquireTimeout { key: String, waited_ms: u64 },
    #[error("lock store error for {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },
}

/// Tuning for lease-based locking
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// Deadline for one acquisition, covering all retries
    pub acquire_timeout: Duration,
    /// Delay between acquisition attempts
    pub retry_interval: Duration,
    /// Lease lifetime; must exceed the longest critical section
    pub lease_ttl: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(50),
            lease_ttl: Duration::from_secs(120),
        }
    }
}

/// Hands out unacquired lock handles keyed by (exhibit id, resource)
pub struct LockService {
    store: Arc<dyn StateStore>,
    settings: LockSettings,
}

impl LockService {
    pub fn new(store: Arc<dyn StateStore>, settings: LockSettings) -> Self {
        Self { store, settings }
    }

    /// Get an unacquired handle for the named resource of an exhibit
    pub fn lock(&self, exhibit_id: &str, resource: &str) -> DistributedRwLock {
        DistributedRwLock {
            store: Arc::clone(&self.store),
            key: format!("{}/{}", exhibit_id, resource),
            token: Uuid::new_v4().to_string(),
            settings: self.settings.clone(),
        }
    }
}

/// Handle to one named distributed RW mutex.
///
/// Concurrent read holders interleave freely but never with a writer. Each
/// handle carries its own holder token, so one handle must not be shared for
/// overlapping acquisitions.
pub struct DistributedRwLock {
    store: Arc<dyn StateStore>,
    key: String,
    token: String,
    settings: LockSettings,
}

impl DistributedRwLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Acquire the shared side, retrying until the deadline
    pub async fn read_lock(&self) -> Result<(), LockError> {
        self.acquire(true).await
    }

    /// Acquire the exclusive side, retrying until the deadline
    pub async fn write_lock(&self) -> Result<(), LockError> {
        self.acquire(false).await
    }

    /// Release the shared side
    pub async fn read_unlock(&self) -> Result<(), LockError> {
        self.release().await
    }

    /// Release the exclusive side
    pub async fn write_unlock(&self) -> Result<(), LockError> {
        self.release().await
    }

    async fn acquire(&self, shared: bool) -> Result<(), LockError> {
        let started = Instant::now();
        let deadline = started + self.settings.acquire_timeout;

        loop {
            let granted = self
                .store
                .try_acquire_lease(&self.key, &self.token, self.settings.lease_ttl, shared)
                .await
                .map_err(|source| LockError::Store {
                    key: self.key.clone(),
                    source,
                })?;
            if granted {
                return Ok(());
            }

            if Instant::now() + self.settings.retry_interval >= deadline {
                warn!(key = %self.key, shared, "lock acquisition timed out");
                return Err(LockError::AcquireTimeout {
                    key: self.key.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.settings.retry_interval).await;
        }
    }

    async fn release(&self) -> Result<(), LockError> {
        self.store
            .release_lease(&self.key, &self.token)
            .await
            .map_err(|source| LockError::Store {
                key: self.key.clone(),
                source,
            })
    }
}
