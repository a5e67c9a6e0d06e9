//! Shared library for the twitter-connector workspace.
//!
//! This crate provides the ambient pieces every binary needs:
//! - Configuration management
//! - Logging infrastructure

pub mod config;
pub mod logging;

// Re-export commonly used types
pub use config::{BackendMode, Config};
pub use logging::LogConfig;

/// Common result type using anyhow::Error
pub type Result<T> = anyhow::Result<T>;
