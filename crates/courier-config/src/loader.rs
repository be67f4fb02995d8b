//! Configuration loader with layered sources.

use crate::{AppConfig, ConfigError, ConfigValidator};
use config::{Config, Environment, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Environment variable prefix for overrides, e.g. `COURIER_WORKER__CONCURRENCY=20`.
pub const ENV_PREFIX: &str = "COURIER";

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local, uncommitted overrides
    /// 4. Environment variables with `COURIER_` prefix
    pub fn new(config_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, ConfigError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    ///
    /// The previous configuration is kept if the new one fails to load or validate.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let new_config = Self::load_config(&self.config_dir)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    fn load_config(config_dir: &Path) -> Result<AppConfig, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment = std::env::var(format!("{ENV_PREFIX}_ENVIRONMENT"))
            .unwrap_or_else(|_| "development".to_string());

        info!(environment = %environment, "Loading configuration");

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = config_dir.join(format!("{name}.toml"));
            if path.exists() {
                debug!("Loading config from: {}", path.display());
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let app_config: AppConfig = builder.build()?.try_deserialize()?;

        ConfigValidator::validate(&app_config).map_err(ConfigError::Invalid)?;

        Ok(app_config)
    }

    /// Gets a specific configuration value by dotted key path.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_loads_defaults_from_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::new(dir.path()).unwrap();
        let config = loader.get().await;
        assert_eq!(config.queues.default_queue, "default");
        assert_eq!(config.redis.key_prefix, "courier");
    }

    #[tokio::test]
    async fn test_layers_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
[worker]
concurrency = 3
poll_interval_ms = 200

[queues]
strict_priority = true
default_queue = "mail"

[queues.weights]
mail = 5
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("local.toml"),
            "[worker]\nconcurrency = 7\n",
        )
        .unwrap();

        let loader = ConfigLoader::new(dir.path()).unwrap();
        let config = loader.get().await;
        assert_eq!(config.worker.concurrency, 7);
        assert_eq!(config.worker.poll_interval_ms, 200);
        assert!(config.queues.strict_priority);
        assert_eq!(config.queues.weights.len(), 1);
        assert_eq!(config.queues.weights.get("mail"), Some(&5));

        let concurrency: Option<usize> = loader.get_value("worker.concurrency").await;
        assert_eq!(concurrency, Some(7));
    }

    #[tokio::test]
    async fn test_invalid_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[worker]\nconcurrency = 0\n",
        )
        .unwrap();

        let err = ConfigLoader::new(dir.path()).err().unwrap();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_env_override_uses_single_underscore_after_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("COURIER_SERVER__PORT", "9191");
        let loaded = ConfigLoader::new(dir.path());
        std::env::remove_var("COURIER_SERVER__PORT");

        assert_eq!(loaded.unwrap().get().await.server.port, 9191);
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.toml");
        fs::write(&path, "[monitor]\nreadonly = false\n").unwrap();

        let loader = ConfigLoader::new(dir.path()).unwrap();
        assert!(!loader.get().await.monitor.readonly);

        fs::write(&path, "[monitor]\nreadonly = true\n").unwrap();
        loader.reload().await.unwrap();
        assert!(loader.get().await.monitor.readonly);
    }
}
