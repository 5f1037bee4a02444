//! Shared configuration, error types, handles, and metrics for `vq` crates.
//!
//! Architecture role:
//! - defines the client configuration passed from connections to queries
//! - provides the common [`VqError`] / [`Result`] contracts
//! - hosts the prometheus registry each connection records into
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::ClientConfig;
pub use error::{Result, VqError};
pub use ids::*;
pub use metrics::MetricsRegistry;
