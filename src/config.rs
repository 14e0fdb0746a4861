use crate::resolver::ResolverStrategy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Address resolution settings
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Lifecycle event transport settings
    #[serde(default)]
    pub eventing: EventingConfig,

    /// Distributed lock tuning
    #[serde(default)]
    pub lock: LockConfig,

    /// Proxy path tuning
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Idle-eviction sweep settings
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Container runtime connection
    #[serde(default)]
    pub docker: DockerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Externally-known hostname clients use to reach the gateway; together
    /// with the port this is the host rewritten into response bodies
    #[serde(default = "default_public_hostname")]
    pub public_hostname: String,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    /// The `host:port` spelled into rewritten links
    pub fn public_host(&self) -> String {
        format!("{}:{}", self.public_hostname, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            public_hostname: default_public_hostname(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    /// Resolution strategy, chosen by deployment topology
    #[serde(default = "default_resolver_strategy")]
    pub strategy: ResolverStrategy,

    /// Bounded address cache capacity (default: 1000)
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            strategy: default_resolver_strategy(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Which lifecycle event transport to wire in at startup
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EventingBackend {
    /// Drop events; the proxy dispatches provisioning in-task
    None,
    /// In-process broadcast bus (single replica)
    #[default]
    Channel,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventingConfig {
    #[serde(default)]
    pub backend: EventingBackend,

    /// Broadcast channel capacity (default: 64)
    #[serde(default = "default_eventing_capacity")]
    pub capacity: usize,
}

impl Default for EventingConfig {
    fn default() -> Self {
        Self {
            backend: EventingBackend::default(),
            capacity: default_eventing_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    /// Deadline for one acquisition in seconds (default: 5)
    #[serde(default = "default_lock_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Delay between acquisition attempts in milliseconds (default: 50)
    #[serde(default = "default_lock_retry_interval")]
    pub retry_interval_ms: u64,

    /// Lease lifetime in seconds; must exceed the longest provisioning
    /// critical section (default: 120)
    #[serde(default = "default_lock_lease_ttl")]
    pub lease_ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: default_lock_acquire_timeout(),
            retry_interval_ms: default_lock_retry_interval(),
            lease_ttl_secs: default_lock_lease_ttl(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Seconds a request waits for an on-demand start (default: 60)
    #[serde(default = "default_start_wait_timeout")]
    pub start_wait_timeout_secs: u64,

    /// Runtime-info poll interval in milliseconds while waiting (default: 250)
    #[serde(default = "default_start_poll_interval")]
    pub start_poll_interval_ms: u64,

    /// Outbound request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            start_wait_timeout_secs: default_start_wait_timeout(),
            start_poll_interval_ms: default_start_poll_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CleanupConfig {
    /// Sweep interval in seconds (default: 10)
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DockerConfig {
    /// Docker daemon address, e.g. `unix:///var/run/docker.sock` or
    /// `tcp://host:2375`; falls back to DOCKER_HOST and platform defaults
    pub host: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields the
    /// defaults so a bare `galleria` starts out of the box.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config '{}': {}", path.display(), e))?;
        Ok(config)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server.pool_idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup.interval_secs)
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_public_hostname() -> String {
    "localhost".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_resolver_strategy() -> ResolverStrategy {
    ResolverStrategy::HostNetwork
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_eventing_capacity() -> usize {
    64
}

fn default_lock_acquire_timeout() -> u64 {
    5
}

fn default_lock_retry_interval() -> u64 {
    50
}

fn default_lock_lease_ttl() -> u64 {
    120
}

fn default_start_wait_timeout() -> u64 {
    60
}

fn default_start_poll_interval() -> u64 {
    250
}

fn default_request_timeout() -> u64 {
    30
}

fn default_cleanup_interval() -> u64 {
    10
}
