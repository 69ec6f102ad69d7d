//! Stevedore Core - Foundational Types
//!
//! This crate provides the error taxonomy, configuration and event types
//! shared by the stevedore image runtime and its command-line frontend.

pub mod config;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{LogLevel, MismatchPolicy, RegistryConfig, RuntimeConfig};
pub use error::{ImageError, Result};
pub use event::{EventEmitter, ImageEvent};

/// Stevedore version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
