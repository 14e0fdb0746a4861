//! Periodic idle-eviction sweep
//!
//! Scales exhibits back to zero: any Running backend whose last proxied
//! request is older than its idle TTL gets stopped through the provisioner,
//! taking the same write lock the start path takes, so the sweep can never
//! interrupt an in-flight start.

use crate::domain::RuntimeStatus;
use crate::exhibit::ExhibitService;
use crate::provisioner::ApplicationProvisioner;
use crate::runtime_info::{LastAccessedService, RuntimeInfoService};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct ExhibitCleanupService {
    exhibits: Arc<ExhibitService>,
    runtime_info: Arc<RuntimeInfoService>,
    last_accessed: Arc<LastAccessedService>,
    provisioner: Arc<ApplicationProvisioner>,
}

impl ExhibitCleanupService {
    pub fn new(
        exhibits: Arc<ExhibitService>,
        runtime_info: Arc<RuntimeInfoService>,
        last_accessed: Arc<LastAccessedService>,
        provisioner: Arc<ApplicationProvisioner>,
    ) -> Self {
        Self {
            exhibits,
            runtime_info,
            last_accessed,
            provisioner,
        }
    }

    /// One sweep over all exhibits. Failures are isolated per exhibit: one
    /// exhibit that cannot be inspected or stopped never aborts the rest.
    pub async fn cleanup(&self) -> anyhow::Result<()> {
        let exhibits = self.exhibits.get_all().await?;
        if exhibits.is_empty() {
            debug!("No exhibits, skipping sweep");
            return Ok(());
        }

        debug!(count = exhibits.len(), "Checking for idle exhibits");
        for exhibit in exhibits {
            if let Err(e) = self.cleanup_one(&exhibit).await {
                warn!(exhibit_id = %exhibit.id, error = %e, "Cleanup failed for exhibit, continuing");
            }
        }
        Ok(())
    }

    async fn cleanup_one(&self, exhibit: &crate::domain::Exhibit) -> anyhow::Result<()> {
        let info = self.runtime_info.get(&exhibit.id).await?;
        if info.status != RuntimeStatus::Running {
            return Ok(());
        }

        // a backend that has never served a request idles from its start time
        let last = match self.last_accessed.get(&exhibit.id).await? {
            Some(at) => at,
            None => match info.started_at {
                Some(at) => at,
                None => return Ok(()),
            },
        };

        let idle = Utc::now() - last;
        let ttl = chrono::Duration::seconds(exhibit.idle_ttl_secs as i64);
        if idle > ttl {
            info!(
                exhibit_id = %exhibit.id,
                idle_secs = idle.num_seconds(),
                ttl_secs = exhibit.idle_ttl_secs,
                "Stopping idle exhibit"
            );
            self.provisioner.stop(&exhibit.id).await?;
        }
        Ok(())
    }

    /// Run sweeps on a fixed interval until shutdown
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Cleanup sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.cleanup().await {
                        error!(error = %e, "Cleanup sweep failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Cleanup sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
