//! Process setup: logging, metrics recorder and startup banner.

use courier_config::{AppConfig, ObservabilityConfig};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured filter.
pub fn init_logging(config: &ObservabilityConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("Logging already initialised: {}", e);
    }
}

/// Installs the Prometheus recorder when metrics are enabled.
pub fn install_metrics(config: &ObservabilityConfig) -> anyhow::Result<Option<PrometheusHandle>> {
    if !config.metrics_enabled {
        return Ok(None);
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    courier_jobs::register_metrics();
    Ok(Some(handle))
}

/// Prints where the process can be reached.
pub fn print_startup_info(config: &AppConfig) {
    let separator = "=".repeat(60);
    let addr = config.server.addr();
    info!("{}", separator);
    info!("Health:    http://{}/health", addr);
    if config.monitor.enabled {
        info!(
            "Monitor:   http://{}{}{}",
            addr,
            config.monitor.path,
            if config.monitor.readonly { " (read-only)" } else { "" }
        );
    }
    if config.observability.metrics_enabled {
        info!("Metrics:   http://{}/metrics", addr);
    }
    info!(
        "Workers:   {} slots over {:?}",
        config.worker.concurrency,
        config.queues.weights
    );
    info!("{}", separator);
}
