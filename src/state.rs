//! Keyed state store contract and the in-memory implementation
//!
//! The gateway persists exhibit definitions, runtime info, last-accessed
//! timestamps and lock leases behind the [`StateStore`] trait. Networked
//! stores implement the same contract externally; [`MemoryStateStore`] backs
//! single-replica deployments and the test suite.
//!
//! Key layout: definitions by `{id}`, runtime info by `{id}/runtime_info`,
//! last-accessed by `{id}/last_accessed`, leases by `{id}/{resource}`.

use crate::domain::{Exhibit, ExhibitRuntimeInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors surfaced by a state store implementation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state store codec error: {0}")]
    Codec(String),
}

/// Keyed persistence consumed by the gateway core.
///
/// The lease primitives back the distributed RW lock: `shared` leases may
/// coexist with each other but never with an exclusive one, and every lease
/// expires after its TTL so a crashed holder cannot block a key forever.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_exhibit(&self, id: &str) -> Result<Option<Exhibit>, StoreError>;
    async fn set_exhibit(&self, exhibit: &Exhibit) -> Result<(), StoreError>;
    async fn delete_exhibit(&self, id: &str) -> Result<(), StoreError>;
    async fn list_exhibits(&self) -> Result<Vec<Exhibit>, StoreError>;

    async fn get_runtime_info(&self, id: &str) -> Result<Option<ExhibitRuntimeInfo>, StoreError>;
    async fn set_runtime_info(
        &self,
        id: &str,
        info: &ExhibitRuntimeInfo,
    ) -> Result<(), StoreError>;
    async fn delete_runtime_info(&self, id: &str) -> Result<(), StoreError>;

    async fn get_last_accessed(&self, id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
    async fn set_last_accessed(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn delete_last_accessed(&self, id: &str) -> Result<(), StoreError>;

    /// Try to take a lease on `key` without blocking. Returns whether the
    /// lease was granted. The token identifies the holder for release.
    async fn try_acquire_lease(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        shared: bool,
    ) -> Result<bool, StoreError>;

    /// Release a lease previously granted to `token`. Releasing an expired
    /// or unknown lease is not an error (the TTL may have fired first).
    async fn release_lease(&self, key: &str, token: &str) -> Result<(), StoreError>;
}

/// Lease record for one key
enum Lease {
    Exclusive { token: String, expires: Instant },
    Shared { holders: HashMap<String, Instant> },
}

impl Lease {
    /// Drop expired holders; returns true when the lease is now empty
    fn expire(&mut self, now: Instant) -> bool {
        match self {
            Lease::Exclusive { expires, .. } => *expires <= now,
            Lease::Shared { holders } => {
                holders.retain(|_, expires| *expires > now);
                holders.is_empty()
            }
        }
    }
}

/// In-memory state store for single-replica deployments and tests
#[derive(Default)]
pub struct MemoryStateStore {
    exhibits: DashMap<String, Exhibit>,
    runtime_info: DashMap<String, ExhibitRuntimeInfo>,
    last_accessed: DashMap<String, DateTime<Utc>>,
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_exhibit(&self, id: &str) -> Result<Option<Exhibit>, StoreError> {
        Ok(self.exhibits.get(id).map(|e| e.value().clone()))
    }

    async fn set_exhibit(&self, exhibit: &Exhibit) -> Result<(), StoreError> {
        self.exhibits.insert(exhibit.id.clone(), exhibit.clone());
        Ok(())
    }

    async fn delete_exhibit(&self, id: &str) -> Result<(), StoreError> {
        self.exhibits.remove(id);
        Ok(())
    }

    async fn list_exhibits(&self) -> Result<Vec<Exhibit>, StoreError> {
        Ok(self.exhibits.iter().map(|e| e.value().clone()).collect())
    }

    async fn get_runtime_info(&self, id: &str) -> Result<Option<ExhibitRuntimeInfo>, StoreError> {
        Ok(self.runtime_info.get(id).map(|i| i.value().clone()))
    }

    async fn set_runtime_info(
        &self,
        id: &str,
        info: &ExhibitRuntimeInfo,
    ) -> Result<(), StoreError> {
        self.runtime_info.insert(id.to_string(), info.clone());
        Ok(())
    }

    async fn delete_runtime_info(&self, id: &str) -> Result<(), StoreError> {
        self.runtime_info.remove(id);
        Ok(())
    }

    async fn get_last_accessed(&self, id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.last_accessed.get(id).map(|t| *t.value()))
    }

    async fn set_last_accessed(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.last_accessed.insert(id.to_string(), at);
        Ok(())
    }

    async fn delete_last_accessed(&self, id: &str) -> Result<(), StoreError> {
        self.last_accessed.remove(id);
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        shared: bool,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let expires = now + ttl;
        let mut leases = self.leases.lock();

        if let Some(lease) = leases.get_mut(key) {
            if lease.expire(now) {
                leases.remove(key);
            }
        }

        match leases.get_mut(key) {
            None => {
                let lease = if shared {
                    let mut holders = HashMap::new();
                    holders.insert(token.to_string(), expires);
                    Lease::Shared { holders }
                } else {
                    Lease::Exclusive {
                        token: token.to_string(),
                        expires,
                    }
                };
                leases.insert(key.to_string(), lease);
                Ok(true)
            }
            Some(Lease::Shared { holders }) if shared => {
                holders.insert(token.to_string(), expires);
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn release_lease(&self, key: &str, token: &str) -> Result<(), StoreError> {
        let mut leases = self.leases.lock();
        let remove = match leases.get_mut(key) {
            Some(Lease::Exclusive { token: held, .. }) => held == token,
            Some(Lease::Shared { holders }) => {
                holders.remove(token);
                holders.is_empty()
            }
            None => false,
        };
        if remove {
            leases.remove(key);
        }
        Ok(())
    }
}
