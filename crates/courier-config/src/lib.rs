//! # Courier Config
//!
//! Configuration management for the Courier task queue.
//! Configuration is layered from TOML files and `COURIER_` environment
//! variables, then validated before anything is started.

mod app_config;
mod error;
mod loader;
mod validation;

pub use app_config::*;
pub use error::*;
pub use loader::*;
pub use validation::*;
