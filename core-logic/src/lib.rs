//! # Core Logic - Shared Utilities for the Dispatch Workspace
//!
//! Ambient building blocks used by every chain crate in the workspace:
//! typed errors, endpoint/proxy configuration, logging, metrics, retry
//! helpers and the process shutdown signal.
//!
//! ## Modules
//!
//! - [`config`] - Endpoint and proxy configuration structures
//! - [`error`] - Startup configuration errors (thiserror)
//! - [`metrics`] - In-memory task/endpoint metrics collection
//! - [`utils`] - Logger, proxy file loading, retry and shutdown helpers

pub mod config;
pub mod error;
pub mod metrics;
pub(crate) mod utils;

pub use config::{EndpointConfig, ProxyConfig};
pub use error::ConfigError;
pub use metrics::{MetricsCollector, MetricsSnapshot};

pub use utils::{
    load_proxies, parse_proxy_line, setup_logger, setup_quiet_logger, shutdown_token,
    LoggerOptions, TASK_RESULT_TARGET,
};

pub use utils::retry::{is_transient_error, with_retry_if, RetryConfig};
