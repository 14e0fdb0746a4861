use galleria::api::{ApiServer, GatewayServices};
use galleria::cleanup::ExhibitCleanupService;
use galleria::config::{Config, EventingBackend};
use galleria::eventing::{ChannelEventing, Eventing, NoopEventing};
use galleria::exhibit::ExhibitService;
use galleria::handler::{spawn_event_consumer, ProvisionerHandler};
use galleria::livecheck::LivecheckRunner;
use galleria::lock::{LockService, LockSettings};
use galleria::pool::{ConnectionPool, PoolConfig};
use galleria::provisioner::{ApplicationProvisioner, PlaceholderTemplateResolver};
use galleria::proxy::{ApplicationProxy, ProxySettings};
use galleria::resolver::ApplicationResolver;
use galleria::rewrite::RewriteService;
use galleria::runtime::{ContainerRuntime, DockerRuntime};
use galleria::runtime_info::{LastAccessedService, RuntimeInfoService};
use galleria::state::{MemoryStateStore, StateStore};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("galleria=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("galleria.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // State store and locks. The bundled store is in-memory; multi-replica
    // deployments plug a networked StateStore in here.
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    info!("Using in-memory state store");

    let locks = Arc::new(LockService::new(
        Arc::clone(&store),
        LockSettings {
            acquire_timeout: Duration::from_secs(config.lock.acquire_timeout_secs),
            retry_interval: Duration::from_millis(config.lock.retry_interval_ms),
            lease_ttl: Duration::from_secs(config.lock.lease_ttl_secs),
        },
    ));

    let exhibits = Arc::new(ExhibitService::new(Arc::clone(&store), Arc::clone(&locks)));
    let runtime_info = Arc::new(RuntimeInfoService::new(
        Arc::clone(&store),
        Arc::clone(&locks),
    ));
    let last_accessed = Arc::new(LastAccessedService::new(Arc::clone(&store)));

    // Container runtime
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::new(config.docker.host.as_deref()).await?);

    // Resolver, selected by deployment topology
    let cache_capacity = NonZeroUsize::new(config.resolver.cache_capacity.max(1))
        .expect("capacity clamped to at least 1");
    let resolver = Arc::new(ApplicationResolver::new(
        Arc::clone(&runtime),
        config.resolver.strategy,
        cache_capacity,
    ));
    info!(strategy = ?config.resolver.strategy, capacity = %cache_capacity, "Resolver configured");

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.pool_idle_timeout(),
    }));

    let provisioner = Arc::new(ApplicationProvisioner::new(
        Arc::clone(&store),
        Arc::clone(&locks),
        Arc::clone(&runtime),
        Arc::clone(&resolver),
        LivecheckRunner::new(Arc::clone(&runtime), Arc::clone(&pool)),
        Arc::new(PlaceholderTemplateResolver),
    ));
    let handler = Arc::new(ProvisionerHandler::new(
        Arc::clone(&exhibits),
        Arc::clone(&provisioner),
    ));

    // Event bus, selected by configuration
    let eventing: Arc<dyn Eventing> = match config.eventing.backend {
        EventingBackend::None => Arc::new(NoopEventing),
        EventingBackend::Channel => Arc::new(ChannelEventing::new(config.eventing.capacity)),
    };
    if eventing.delivers() {
        spawn_event_consumer(
            Arc::clone(&eventing),
            Arc::clone(&handler),
            shutdown_rx.clone(),
        );
    }
    info!(backend = ?config.eventing.backend, "Eventing configured");

    let rewrites = Arc::new(RewriteService::new(config.server.public_host()));
    let proxy = Arc::new(ApplicationProxy::new(
        Arc::clone(&resolver),
        Arc::clone(&runtime_info),
        Arc::clone(&last_accessed),
        rewrites,
        Arc::clone(&eventing),
        Arc::clone(&handler),
        Arc::clone(&pool),
        ProxySettings {
            start_wait_timeout: Duration::from_secs(config.proxy.start_wait_timeout_secs),
            start_poll_interval: Duration::from_millis(config.proxy.start_poll_interval_ms),
            request_timeout: Duration::from_secs(config.proxy.request_timeout_secs),
        },
    ));

    // Idle-eviction sweep on its own background task
    let cleanup = Arc::new(ExhibitCleanupService::new(
        Arc::clone(&exhibits),
        Arc::clone(&runtime_info),
        Arc::clone(&last_accessed),
        Arc::clone(&provisioner),
    ));
    tokio::spawn(Arc::clone(&cleanup).run(config.cleanup_interval(), shutdown_rx.clone()));

    let services = Arc::new(GatewayServices {
        exhibits,
        runtime_info,
        provisioner,
        handler,
        proxy,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let server = ApiServer::bind(addr, services, shutdown_rx).await?;
    info!(public_host = %config.server.public_host(), "Gateway starting");

    // Graceful shutdown on ctrl-c
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run().await
}
