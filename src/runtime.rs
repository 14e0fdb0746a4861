//! Container runtime client: trait seam plus the Docker implementation

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Label carrying the owning exhibit id on every gateway-managed instance
pub const EXHIBIT_LABEL: &str = "galleria.exhibit";
/// Label carrying the container port the backend listens on
pub const PORT_LABEL: &str = "galleria.port";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("container runtime error: {0}")]
    Api(String),
}

/// What to run for one exhibit backend
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub container_port: u16,
    pub labels: HashMap<String, String>,
}

/// Observed state of a backend instance
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// Container network address, when attached to a network
    pub ip: Option<String>,
    /// Published ports: container port to host port
    pub host_ports: HashMap<u16, u16>,
    pub labels: HashMap<String, String>,
}

/// Abstract contract over the container runtime. The gateway core only
/// consumes this; tests substitute an in-memory implementation.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start an instance, returning its runtime identifier
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, RuntimeError>;
    /// Stop and remove an instance. Removing an already-gone instance is Ok.
    async fn remove_instance(&self, instance_id: &str) -> Result<(), RuntimeError>;
    async fn inspect_instance(&self, instance_id: &str) -> Result<InstanceInfo, RuntimeError>;
    /// List instances carrying the given label
    async fn list_instances(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<InstanceInfo>, RuntimeError>;
    /// Run a command inside the instance and return its exit status
    async fn exec(&self, instance_id: &str, command: &[String]) -> Result<i64, RuntimeError>;
}

/// Docker-backed runtime
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon.
    ///
    /// Connection priority: explicit `docker_host`, then `DOCKER_HOST`,
    /// then the platform socket defaults.
    pub async fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, RuntimeError> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let port_key = format!("{}/tcp", spec.container_port);

        // Publish to an ephemeral host port on the loopback interface; the
        // host-network resolver reads the binding back after start.
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: None,
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let cmd = if spec.args.is_empty() {
            None
        } else {
            Some(spec.args.clone())
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd,
            env: Some(env),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| RuntimeError::Api(format!("create '{}': {}", spec.name, e)))?;

        let instance_id = response.id;

        self.client
            .start_container(&instance_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::Api(format!("start '{}': {}", spec.name, e)))?;

        info!(
            instance_id,
            name = %spec.name,
            image = %spec.image,
            "Started backend instance"
        );
        Ok(instance_id)
    }

    async fn remove_instance(&self, instance_id: &str) -> Result<(), RuntimeError> {
        let stop_options = StopContainerOptions { t: 10 };
        match self
            .client
            .stop_container(instance_id, Some(stop_options))
            .await
        {
            Ok(_) => {}
            // 304: already stopped, 404: already gone
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            })
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(RuntimeError::Api(format!("stop '{}': {}", instance_id, e))),
        }

        let remove_options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .client
            .remove_container(instance_id, Some(remove_options))
            .await
        {
            Ok(_) => {
                info!(instance_id, "Removed backend instance");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(instance_id, "Instance already gone");
                Ok(())
            }
            Err(e) => {
                warn!(instance_id, error = %e, "Failed to remove instance");
                Err(RuntimeError::Api(format!(
                    "remove '{}': {}",
                    instance_id, e
                )))
            }
        }
    }

    async fn inspect_instance(&self, instance_id: &str) -> Result<InstanceInfo, RuntimeError> {
        let response = match self.client.inspect_container(instance_id, None).await {
            Ok(r) => r,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(RuntimeError::NotFound(instance_id.to_string())),
            Err(e) => {
                return Err(RuntimeError::Api(format!(
                    "inspect '{}': {}",
                    instance_id, e
                )))
            }
        };

        let running = response
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        let name = response
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();

        let labels = response
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();

        let mut host_ports = HashMap::new();
        let mut ip = None;
        if let Some(settings) = response.network_settings {
            if let Some(ports) = settings.ports {
                for (key, bindings) in ports {
                    let container_port = key
                        .split('/')
                        .next()
                        .and_then(|p| p.parse::<u16>().ok());
                    let host_port = bindings
                        .unwrap_or_default()
                        .into_iter()
                        .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()));
                    if let (Some(c), Some(h)) = (container_port, host_port) {
                        host_ports.insert(c, h);
                    }
                }
            }
            if let Some(networks) = settings.networks {
                ip = networks
                    .values()
                    .find_map(|n| n.ip_address.clone())
                    .filter(|a| !a.is_empty());
            }
        }

        Ok(InstanceInfo {
            id: response.id.unwrap_or_else(|| instance_id.to_string()),
            name,
            running,
            ip,
            host_ports,
            labels,
        })
    }

    async fn list_instances(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<InstanceInfo>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", label_key, label_value)],
        );

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Api(format!("list instances: {}", e)))?;

        let instances = summaries
            .into_iter()
            .map(|summary| {
                let mut host_ports = HashMap::new();
                for port in summary.ports.unwrap_or_default() {
                    if let Some(public) = port.public_port {
                        host_ports.insert(port.private_port, public);
                    }
                }

                let ip = summary
                    .network_settings
                    .and_then(|s| s.networks)
                    .and_then(|networks| {
                        networks
                            .values()
                            .find_map(|n| n.ip_address.clone())
                            .filter(|a| !a.is_empty())
                    });

                InstanceInfo {
                    id: summary.id.unwrap_or_default(),
                    name: summary
                        .names
                        .unwrap_or_default()
                        .first()
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    running: summary.state.as_deref() == Some("running"),
                    ip,
                    host_ports,
                    labels: summary.labels.unwrap_or_default(),
                }
            })
            .collect();

        Ok(instances)
    }

    async fn exec(&self, instance_id: &str, command: &[String]) -> Result<i64, RuntimeError> {
        let options = CreateExecOptions::<String> {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(instance_id, options)
            .await
            .map_err(|e| RuntimeError::Api(format!("create exec in '{}': {}", instance_id, e)))?;

        let started = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::Api(format!("start exec in '{}': {}", instance_id, e)))?;

        // Drain the output stream so the exec completes before inspection
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                if let Err(e) = chunk {
                    debug!(instance_id, error = %e, "exec output stream error");
                    break;
                }
            }
        }

        let inspected = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::Api(format!("inspect exec in '{}': {}", instance_id, e)))?;

        inspected
            .exit_code
            .ok_or_else(|| RuntimeError::Api(format!("exec in '{}' has no exit code", instance_id)))
    }
}
