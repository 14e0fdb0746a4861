//! Readiness polling for freshly started backends
//!
//! A backend is only published as Running once its livecheck passes. The
//! HTTP variant probes over the pooled client; the exec variant runs a
//! command inside the instance through the container runtime.

use crate::domain::{Exhibit, LivecheckProbe};
use crate::pool::ConnectionPool;
use crate::runtime::ContainerRuntime;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LivecheckFailure {
    #[error("no successful probe after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },
    #[error("livecheck timed out after {0:?}")]
    TimedOut(Duration),
}

/// Polls a backend until it is ready to serve traffic
pub struct LivecheckRunner {
    runtime: Arc<dyn ContainerRuntime>,
    pool: Arc<ConnectionPool>,
}

impl LivecheckRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, pool: Arc<ConnectionPool>) -> Self {
        Self { runtime, pool }
    }

    /// Probe until ready. Returns on the first success; fails once the
    /// attempt budget or the overall timeout is exhausted, never blocking
    /// past the configured timeout.
    pub async fn wait_ready(
        &self,
        exhibit: &Exhibit,
        instance_id: &str,
        address: &str,
    ) -> Result<(), LivecheckFailure> {
        let spec = &exhibit.livecheck;
        let budget = Duration::from_secs(spec.timeout_secs);
        let interval = Duration::from_millis(spec.interval_ms);

        let polling = async {
            for attempt in 1..=spec.max_attempts {
                if self.probe_once(exhibit, instance_id, address).await {
                    info!(
                        exhibit_id = %exhibit.id,
                        attempt,
                        address,
                        "Backend passed livecheck"
                    );
                    return Ok(());
                }
                debug!(exhibit_id = %exhibit.id, attempt, "Livecheck attempt failed");
                tokio::time::sleep(interval).await;
            }
            Err(LivecheckFailure::AttemptsExhausted {
                attempts: spec.max_attempts,
            })
        };

        match tokio::time::timeout(budget, polling).await {
            Ok(result) => result,
            Err(_) => Err(LivecheckFailure::TimedOut(budget)),
        }
    }

    async fn probe_once(&self, exhibit: &Exhibit, instance_id: &str, address: &str) -> bool {
        match &exhibit.livecheck.probe {
            LivecheckProbe::Http {
                path,
                expect_status,
            } => match self.pool.probe(address, path).await {
                // accept the whole status class, e.g. 200 accepts any 2xx
                Ok(status) => status.as_u16() / 100 == expect_status / 100,
                Err(e) => {
                    debug!(exhibit_id = %exhibit.id, address, error = %e, "HTTP probe failed");
                    false
                }
            },
            LivecheckProbe::Exec {
                command,
                expect_exit,
            } => match self.runtime.exec(instance_id, command).await {
                Ok(exit) => exit == *expect_exit,
                Err(e) => {
                    debug!(exhibit_id = %exhibit.id, instance_id, error = %e, "Exec probe failed");
                    false
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExhibitDefinition, LivecheckSpec};
    use crate::pool::PoolConfig;
    use crate::runtime::testing::MockRuntime;
    use crate::runtime::InstanceSpec;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    fn exhibit_with(probe: LivecheckProbe, max_attempts: u32, timeout_secs: u64) -> Exhibit {
        ExhibitDefinition {
            name: "demo".to_string(),
            image: "nginx:alpine".to_string(),
            args: Vec::new(),
            environment: HashMap::new(),
            port: 8080,
            livecheck: LivecheckSpec {
                probe,
                interval_ms: 10,
                timeout_secs,
                max_attempts,
            },
            idle_ttl_secs: 60,
        }
        .into_exhibit()
    }

    async fn instance(runtime: &MockRuntime) -> String {
        runtime
            .create_instance(&InstanceSpec {
                name: "galleria-demo".to_string(),
                image: "nginx:alpine".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                container_port: 8080,
                labels: HashMap::new(),
            })
            .await
            .unwrap()
    }

    fn runner(runtime: Arc<MockRuntime>) -> LivecheckRunner {
        LivecheckRunner::new(runtime, Arc::new(ConnectionPool::new(PoolConfig::default())))
    }

    #[tokio::test]
    async fn test_exec_probe_ready_on_expected_exit() {
        let runtime = Arc::new(MockRuntime::new());
        let instance_id = instance(&runtime).await;
        let exhibit = exhibit_with(
            LivecheckProbe::Exec {
                command: vec!["true".to_string()],
                expect_exit: 0,
            },
            3,
            5,
        );

        runner(Arc::clone(&runtime))
            .wait_ready(&exhibit, &instance_id, "127.0.0.1:1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exec_probe_exhausts_attempts_on_wrong_exit() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.exec_exit.store(1, Ordering::SeqCst);
        let instance_id = instance(&runtime).await;
        let exhibit = exhibit_with(
            LivecheckProbe::Exec {
                command: vec!["false".to_string()],
                expect_exit: 0,
            },
            3,
            5,
        );

        let result = runner(Arc::clone(&runtime))
            .wait_ready(&exhibit, &instance_id, "127.0.0.1:1")
            .await;
        assert!(matches!(
            result,
            Err(LivecheckFailure::AttemptsExhausted { attempts: 3 })
        ));
    }

    #[tokio::test]
    async fn test_http_probe_against_dead_address_times_out() {
        let runtime = Arc::new(MockRuntime::new());
        let instance_id = instance(&runtime).await;
        // Large attempt budget so the overall timeout fires first
        let exhibit = exhibit_with(
            LivecheckProbe::Http {
                path: "/".to_string(),
                expect_status: 200,
            },
            10_000,
            1,
        );

        let result = runner(Arc::clone(&runtime))
            .wait_ready(&exhibit, &instance_id, "127.0.0.1:9")
            .await;
        assert!(matches!(result, Err(LivecheckFailure::TimedOut(_))));
    }
}
