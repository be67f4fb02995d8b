//! Configuration error types.

use crate::ConfigValidationError;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(String),

    /// The configuration was loaded but failed validation.
    #[error("Invalid configuration: {}", format_errors(.0))]
    Invalid(Vec<ConfigValidationError>),
}

fn format_errors(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}
