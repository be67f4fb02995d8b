//! Configuration validation module.
//!
//! Every section is checked and all problems are reported together, so a
//! misconfigured deployment fails at startup rather than on the first task.

use crate::AppConfig;
use std::fmt;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Worker concurrency must be at least one slot.
    ZeroConcurrency,
    /// At least one queue must be configured.
    NoQueues,
    /// Queue weights must be positive.
    ZeroWeight { queue: String },
    /// Default queue must be one of the configured queues.
    UnknownDefaultQueue { queue: String },
    /// Timeout or interval value must be positive.
    NonPositiveTimeout { name: String, value: u64 },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Pool size must be positive.
    InvalidPoolSize { value: usize },
    /// Jitter factor must be between 0.0 and 1.0.
    InvalidJitter { value: f64 },
    /// Backoff multiplier must be at least 1.0.
    InvalidMultiplier { value: f64 },
    /// Monitor path must start with `/`.
    InvalidMonitorPath { value: String },
    /// Retry delay cap exceeds the supported maximum.
    RetryDelayTooLarge { value: u64, max: u64 },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroConcurrency => write!(f, "Worker concurrency must be at least 1"),
            Self::NoQueues => write!(f, "At least one queue must be configured"),
            Self::ZeroWeight { queue } => {
                write!(f, "Queue '{}' must have a positive weight", queue)
            }
            Self::UnknownDefaultQueue { queue } => {
                write!(f, "Default queue '{}' is not a configured queue", queue)
            }
            Self::NonPositiveTimeout { name, value } => {
                write!(f, "Timeout '{}' must be positive, got {}", name, value)
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::InvalidPoolSize { value } => {
                write!(f, "Invalid pool size: {} (must be at least 1)", value)
            }
            Self::InvalidJitter { value } => {
                write!(
                    f,
                    "Invalid jitter factor: {} (must be between 0.0 and 1.0)",
                    value
                )
            }
            Self::InvalidMultiplier { value } => {
                write!(f, "Invalid backoff multiplier: {} (must be >= 1.0)", value)
            }
            Self::InvalidMonitorPath { value } => {
                write!(f, "Monitor path '{}' must start with '/'", value)
            }
            Self::RetryDelayTooLarge { value, max } => {
                write!(f, "retry.max_delay_ms is {}, must be at most {}", value, max)
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug)]
pub struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the validation errors.
    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Converts to Result, returning Err with all errors if any exist.
    pub fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    const REDIS_SCHEMES: &'static [&'static str] = &["redis", "rediss", "unix", "redis+unix"];

    /// Upper bound on `retry.max_delay_ms`: 30 days.
    pub const MAX_RETRY_DELAY_MS: u64 = 30 * 24 * 60 * 60 * 1000;

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::new();

        Self::validate_redis(&config.redis, &mut result);
        Self::validate_worker(&config.worker, &mut result);
        Self::validate_queues(&config.queues, &mut result);
        Self::validate_retry(&config.retry, &mut result);
        Self::validate_monitor(&config.monitor, &mut result);

        result.into_result()
    }

    fn validate_redis(config: &crate::RedisConfig, result: &mut ValidationResult) {
        match Url::parse(&config.url) {
            Ok(url) if Self::REDIS_SCHEMES.contains(&url.scheme()) => {}
            Ok(url) => result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            }),
            Err(e) => result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: e.to_string(),
            }),
        }

        if config.pool_size == 0 {
            result.add_error(ConfigValidationError::InvalidPoolSize {
                value: config.pool_size,
            });
        }

        if config.connect_timeout_secs == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "redis.connect_timeout_secs".to_string(),
                value: 0,
            });
        }
    }

    fn validate_worker(config: &crate::WorkerConfig, result: &mut ValidationResult) {
        if config.concurrency == 0 {
            result.add_error(ConfigValidationError::ZeroConcurrency);
        }

        let intervals = [
            ("worker.poll_interval_ms", config.poll_interval_ms),
            ("worker.forward_interval_ms", config.forward_interval_ms),
            ("worker.recover_interval_ms", config.recover_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                result.add_error(ConfigValidationError::NonPositiveTimeout {
                    name: name.to_string(),
                    value,
                });
            }
        }
    }

    fn validate_queues(config: &crate::QueuesConfig, result: &mut ValidationResult) {
        if config.weights.is_empty() {
            result.add_error(ConfigValidationError::NoQueues);
            return;
        }

        for (queue, weight) in &config.weights {
            if *weight == 0 {
                result.add_error(ConfigValidationError::ZeroWeight {
                    queue: queue.clone(),
                });
            }
        }

        if !config.weights.contains_key(&config.default_queue) {
            result.add_error(ConfigValidationError::UnknownDefaultQueue {
                queue: config.default_queue.clone(),
            });
        }
    }

    fn validate_retry(config: &crate::RetryConfig, result: &mut ValidationResult) {
        if config.default_timeout_secs == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "retry.default_timeout_secs".to_string(),
                value: 0,
            });
        }

        if !(0.0..=1.0).contains(&config.jitter_factor) {
            result.add_error(ConfigValidationError::InvalidJitter {
                value: config.jitter_factor,
            });
        }

        if config.multiplier < 1.0 || config.multiplier.is_nan() {
            result.add_error(ConfigValidationError::InvalidMultiplier {
                value: config.multiplier,
            });
        }

        if config.max_delay_ms > Self::MAX_RETRY_DELAY_MS {
            result.add_error(ConfigValidationError::RetryDelayTooLarge {
                value: config.max_delay_ms,
                max: Self::MAX_RETRY_DELAY_MS,
            });
        }
    }

    fn validate_monitor(config: &crate::MonitorConfig, result: &mut ValidationResult) {
        if !config.enabled {
            return;
        }

        if !config.path.starts_with('/') {
            result.add_error(ConfigValidationError::InvalidMonitorPath {
                value: config.path.clone(),
            });
        }
    }
}

/// Formats validation errors for display.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}
