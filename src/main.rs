use containergate::binding::ContainerBinding;
use containergate::config::Config;
use containergate::docker::DockerPlatform;
use containergate::pool::{ConnectionPool, PoolConfig};
use containergate::proxy::ProxyServer;
use containergate::router::Router;
use containergate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
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
                .add_directive("containergate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let pool = Arc::new(ConnectionPool::new(pool_config));

    let platform = DockerPlatform::connect(config.container.docker_host.as_deref(), pool).await?;
    let binding_name = config.container.binding.clone();
    platform.register(ContainerBinding::worker(binding_name.as_str()), config.container.clone());

    // The watcher outlives the server so the final stop still reaches the hooks
    let (watcher_tx, watcher_rx) = watch::channel(false);
    let lifecycle_handle = platform.watch_lifecycle(watcher_rx);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let router = Arc::new(Router::new(binding_name, platform.clone()));
    let server = ProxyServer::new(bind_addr, router, shutdown_rx.clone());

    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), &mut server_handle).await;

    if config.container.stop_on_shutdown {
        info!("Stopping container...");
        // Returns once each container has stopped; the watcher drains delivered events before exiting
        platform.stop_all().await;
    }

    let _ = watcher_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), lifecycle_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        binding = %config.container.binding,
        image = %config.container.image,
        container = %config.container.container_name(),
        pull_policy = ?config.container.pull_policy,
        "Container binding"
    );
    info!(
        ready_path = %config.container.ready_path,
        startup_timeout_secs = config.container.startup_timeout_secs,
        ready_check_interval_ms = config.container.ready_check_interval_ms,
        "Readiness settings"
    );
    info!(
        shutdown_grace_period_secs = config.container.shutdown_grace_period_secs,
        stop_on_shutdown = config.container.stop_on_shutdown,
        "Shutdown settings"
    );
}
