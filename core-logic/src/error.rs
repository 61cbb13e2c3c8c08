//! # Core Error Types
//!
//! Configuration errors shared by every chain crate.

use thiserror::Error;

/// Configuration-related errors
///
/// These are the only errors allowed to stop the process, and only at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid RPC URL format: '{url}'")]
    InvalidRpcUrl { url: String },

    #[error("Missing required configuration field: '{field}'")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid proxy line {line}: '{content}'")]
    InvalidProxyLine { line: usize, content: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("I/O error reading {path}: {msg}")]
    IoError { path: String, msg: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_value_message() {
        let err = ConfigError::invalid("worker_count", "must be > 0");
        assert_eq!(
            err.to_string(),
            "Invalid value for 'worker_count': must be > 0"
        );
    }
}
