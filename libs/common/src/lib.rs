//! Shared service plumbing for the gateway probe
//!
//! Provides the pieces every binary in the workspace needs:
//! - logging bootstrap (console + optional daily rolling file)
//! - shutdown signal handling
//! - configuration value lookup helpers

pub mod config_loader;
pub mod logging;
pub mod shutdown;

// Re-export common dependencies
pub use anyhow;
pub use tokio;
