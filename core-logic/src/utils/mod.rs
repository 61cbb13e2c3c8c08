//! # Utilities Module
//!
//! Internal utility modules for the core-logic crate.
//! These modules are marked as `pub(crate)` to enforce API boundaries.

pub(crate) mod logger;
pub(crate) mod proxy_manager;
pub(crate) mod retry;
pub(crate) mod runner;

pub use logger::{setup_logger, setup_quiet_logger, LoggerOptions, TASK_RESULT_TARGET};
pub use proxy_manager::{load_proxies, parse_proxy_line};
pub use runner::shutdown_token;
