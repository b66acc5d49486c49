//! hostmon core - shared types for the monitoring agent
//!
//! This crate provides the pieces the daemon (`hostmond`) is assembled from:
//! the validated [`AgentConfig`] and its loader, the host admission
//! [`SecurityPolicy`], and the [`MetricRegistry`] seam with its built-in
//! implementation.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`
//! outside tests.

pub mod config;
pub mod error;
pub mod key;
pub mod metrics;
pub mod security;

// Re-exports for convenience
pub use config::{AgentConfig, DEFAULT_CONFIG_PATH};
pub use error::{ConfigError, ConfigResult, PolicyError};
pub use key::MetricKey;
pub use metrics::{AgentMetrics, MetricRegistry, MetricValue, NOT_SUPPORTED};
pub use security::{HostPattern, SecurityDecision, SecurityPolicy};
