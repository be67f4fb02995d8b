//! # Courier Server
//!
//! Worker process: runs the task pool and serves health probes, the task
//! monitor and Prometheus metrics over HTTP.

use anyhow::Context;
use courier_config::{AppConfig, ConfigLoader, ObservabilityConfig};
use courier_jobs::Lifecycle;
use courier_server::{app, handlers, startup};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match load_config().await {
        Ok(config) => config,
        Err(e) => {
            startup::init_logging(&ObservabilityConfig::default());
            error!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    startup::init_logging(&config.observability);

    info!("Starting Courier Server...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.environment);

    if let Err(e) = run(config).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

async fn load_config() -> anyhow::Result<AppConfig> {
    let loader = ConfigLoader::from_default_location().context("Failed to load configuration")?;
    Ok(loader.get().await)
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let metrics = startup::install_metrics(&config.observability).context("Failed to install metrics recorder")?;

    let lifecycle = Lifecycle::with_redis(config.clone())?;
    handlers::register(&lifecycle);

    // Fail fast on an unreachable broker before binding the port.
    lifecycle.ensure_started().await.context("Failed to start worker pool")?;

    let router = app::build_router(&lifecycle, &config, metrics).await?;

    let addr = config.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    startup::print_startup_info(&config);

    let stopped = lifecycle.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move { stopped.stopped().await });

    let serve = async {
        let result = server.await;
        // A failed HTTP server takes the pool down with it.
        lifecycle.shutdown().await;
        result
    };

    let (served, ran) = tokio::join!(serve, lifecycle.run());
    served.context("HTTP server error")?;
    ran?;

    info!("Server shutdown complete");
    Ok(())
}
