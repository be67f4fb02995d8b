//! # Courier Server Library
//!
//! Building blocks of the worker process: task handlers, the HTTP router
//! and process setup.

pub mod app;
pub mod handlers;
pub mod startup;
