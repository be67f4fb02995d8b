//! Application configuration structures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Queue names and weights.
    #[serde(default)]
    pub queues: QueuesConfig,

    /// Task defaults and retry backoff.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Monitor exposure configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging and metrics configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Key prefix for all task-related keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    /// Returns the connection timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "courier".to_string()
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent execution slots.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Idle polling interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Grace period for in-flight tasks on shutdown, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Extra lease time granted beyond a task's timeout, in seconds.
    #[serde(default = "default_lease_grace")]
    pub lease_grace_secs: u64,

    /// How often due scheduled and retry tasks are promoted, in milliseconds.
    #[serde(default = "default_forward_interval")]
    pub forward_interval_ms: u64,

    /// How often expired leases are recovered, in milliseconds.
    #[serde(default = "default_recover_interval")]
    pub recover_interval_ms: u64,

    /// Install SIGINT/SIGTERM handlers when the pool starts.
    #[serde(default = "default_handle_signals")]
    pub handle_signals: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            lease_grace_secs: default_lease_grace(),
            forward_interval_ms: default_forward_interval(),
            recover_interval_ms: default_recover_interval(),
            handle_signals: default_handle_signals(),
        }
    }
}

impl WorkerConfig {
    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Returns lease grace as Duration.
    pub fn lease_grace(&self) -> Duration {
        Duration::from_secs(self.lease_grace_secs)
    }

    /// Returns forwarder interval as Duration.
    pub fn forward_interval(&self) -> Duration {
        Duration::from_millis(self.forward_interval_ms)
    }

    /// Returns recoverer interval as Duration.
    pub fn recover_interval(&self) -> Duration {
        Duration::from_millis(self.recover_interval_ms)
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
        .max(4)
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_shutdown_timeout() -> u64 {
    8
}

fn default_lease_grace() -> u64 {
    30
}

fn default_forward_interval() -> u64 {
    1000
}

fn default_recover_interval() -> u64 {
    60_000
}

fn default_handle_signals() -> bool {
    true
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesConfig {
    /// Queue name to relative weight.
    #[serde(default = "default_weights")]
    pub weights: BTreeMap<String, u32>,

    /// Drain higher-weight queues completely before lower ones.
    #[serde(default)]
    pub strict_priority: bool,

    /// Queue used when a task does not name one.
    #[serde(default = "default_queue")]
    pub default_queue: String,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            weights: default_weights(),
            strict_priority: false,
            default_queue: default_queue(),
        }
    }
}

fn default_weights() -> BTreeMap<String, u32> {
    BTreeMap::from([
        ("critical".to_string(), 6),
        ("default".to_string(), 3),
        ("low".to_string(), 1),
    ])
}

fn default_queue() -> String {
    "default".to_string()
}

/// Task defaults and retry backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Default maximum number of retries.
    #[serde(default = "default_max_retry")]
    pub default_max_retry: u32,

    /// Default task timeout in seconds.
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,

    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum retry delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Random jitter as a fraction of the delay (0.0 to 1.0).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retry: default_max_retry(),
            default_timeout_secs: default_timeout(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    /// Returns default timeout as Duration.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

fn default_max_retry() -> u32 {
    25
}

fn default_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_initial_delay() -> u64 {
    1000 // 1 second
}

fn default_max_delay() -> u64 {
    3_600_000 // 1 hour
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

/// Monitor exposure configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Mount the monitor on the HTTP server.
    #[serde(default = "default_monitor_enabled")]
    pub enabled: bool,

    /// Mount path.
    #[serde(default = "default_monitor_path")]
    pub path: String,

    /// Disable mutating monitor actions.
    #[serde(default)]
    pub readonly: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitor_enabled(),
            path: default_monitor_path(),
            readonly: false,
        }
    }
}

fn default_monitor_enabled() -> bool {
    true
}

fn default_monitor_path() -> String {
    "/monitor".to_string()
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// Returns the bind address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging and metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Emit JSON log lines instead of the pretty format.
    #[serde(default)]
    pub json_logs: bool,

    /// Install the Prometheus recorder and serve `/metrics`.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            json_logs: false,
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

fn default_log_filter() -> String {
    "info,courier=debug,tower_http=debug".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights() {
        let config = QueuesConfig::default();
        assert_eq!(config.weights.get("critical"), Some(&6));
        assert_eq!(config.weights.get("default"), Some(&3));
        assert_eq!(config.weights.get("low"), Some(&1));
        assert!(!config.strict_priority);
    }

    #[test]
    fn test_worker_durations() {
        let config = WorkerConfig {
            poll_interval_ms: 250,
            shutdown_timeout_secs: 3,
            ..WorkerConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(3));
        assert!(config.concurrency >= 4);
    }

    #[test]
    fn test_server_addr() {
        assert_eq!(ServerConfig::default().addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"worker": {"concurrency": 2}}"#).unwrap();
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.worker.poll_interval_ms, 1000);
        assert_eq!(config.redis.key_prefix, "courier");
        assert_eq!(config.monitor.path, "/monitor");
    }
}
