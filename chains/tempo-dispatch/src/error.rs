//! Error taxonomy of the dispatch engine.
//!
//! Only [`DispatchError::SequenceRejected`] is retried inside the engine (once,
//! on the same lane after invalidation). [`DispatchError::Config`] is the only
//! error allowed to stop the process, and only at startup.

use crate::types::{EndpointId, Lane, Owner};
use core_logic::{ConfigError, is_transient_error};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("no owner became available within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("sequence rejected for {owner} lane {lane}: {reason}")]
    SequenceRejected {
        owner: Owner,
        lane: Lane,
        reason: String,
    },

    #[error("no healthy endpoint available")]
    EndpointUnavailable,

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("lane {lane} authorization failed for {owner}: {reason}")]
    LaneAuthorizationFailed {
        owner: Owner,
        lane: Lane,
        reason: String,
    },

    #[error("transport error on {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("task failed: {0}")]
    TaskLogic(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Flat classification carried by [`Outcome`](crate::types::Outcome) and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    PoolExhausted,
    SequenceRejected,
    EndpointUnavailable,
    Timeout,
    LaneAuthorizationFailed,
    Transport,
    TaskLogic,
    Config,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::PoolExhausted => "pool_exhausted",
            ErrorClass::SequenceRejected => "sequence_rejected",
            ErrorClass::EndpointUnavailable => "endpoint_unavailable",
            ErrorClass::Timeout => "timeout",
            ErrorClass::LaneAuthorizationFailed => "lane_authorization_failed",
            ErrorClass::Transport => "transport",
            ErrorClass::TaskLogic => "task_logic",
            ErrorClass::Config => "config",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DispatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DispatchError::PoolExhausted { .. } => ErrorClass::PoolExhausted,
            DispatchError::SequenceRejected { .. } => ErrorClass::SequenceRejected,
            DispatchError::EndpointUnavailable => ErrorClass::EndpointUnavailable,
            DispatchError::Timeout { .. } => ErrorClass::Timeout,
            DispatchError::LaneAuthorizationFailed { .. } => ErrorClass::LaneAuthorizationFailed,
            DispatchError::Transport { .. } => ErrorClass::Transport,
            DispatchError::TaskLogic(_) => ErrorClass::TaskLogic,
            DispatchError::Config(_) => ErrorClass::Config,
        }
    }

    pub fn transport(endpoint: EndpointId, reason: impl fmt::Display) -> Self {
        DispatchError::Transport {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure should count against the endpoint that carried it.
    pub fn is_endpoint_fault(&self) -> bool {
        matches!(
            self,
            DispatchError::Transport { .. } | DispatchError::Timeout { .. }
        )
    }
}

/// Node / transport messages that mean the sequence slot was stale.
const SEQUENCE_PATTERNS: [&str; 4] = [
    "nonce too low",
    "nonce too high",
    "invalid nonce",
    "already known",
];

/// Proxy and socket level failures that point at the route, not the chain.
const TRANSPORT_PATTERNS: [&str; 7] = [
    "tunnel error",
    "connect",
    "connection closed",
    "connection reset",
    "error sending request",
    "proxy",
    "407",
];

/// Messages that mean the route itself is broken and should be banned at once.
const HARD_TRANSPORT_PATTERNS: [&str; 3] = ["tunnel error", "407", "proxy authentication"];

/// Maps a task error to its class.
///
/// Typed [`DispatchError`]s anywhere in the chain win; free-form errors from
/// task code fall back to message matching, and default to `TaskLogic`.
pub fn classify_error(error: &anyhow::Error) -> ErrorClass {
    if let Some(dispatch) = error.chain().find_map(|e| e.downcast_ref::<DispatchError>()) {
        return dispatch.class();
    }

    let msg = format!("{:#}", error).to_lowercase();
    if SEQUENCE_PATTERNS.iter().any(|p| msg.contains(p)) {
        ErrorClass::SequenceRejected
    } else if msg.contains("timed out") || msg.contains("timeout") {
        ErrorClass::Timeout
    } else if TRANSPORT_PATTERNS.iter().any(|p| msg.contains(p)) || is_transient_error(error) {
        // Rate limits and busy nodes count against the route as well
        ErrorClass::Transport
    } else {
        ErrorClass::TaskLogic
    }
}

/// True when a node message says the submitted sequence was stale or invalid.
pub fn is_sequence_rejection(message: &str) -> bool {
    let msg = message.to_lowercase();
    SEQUENCE_PATTERNS.iter().any(|p| msg.contains(p))
}

/// True when a transport failure should ban the endpoint immediately.
pub fn is_hard_transport_failure(message: &str) -> bool {
    let msg = message.to_lowercase();
    HARD_TRANSPORT_PATTERNS.iter().any(|p| msg.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    #[test]
    fn typed_errors_are_classified_through_context() {
        let err = anyhow::Error::new(DispatchError::SequenceRejected {
            owner: Address::ZERO,
            lane: 3,
            reason: "stale".into(),
        })
        .context("submitting transfer");

        assert_eq!(classify_error(&err), ErrorClass::SequenceRejected);
    }

    #[test]
    fn free_form_messages_fall_back_to_patterns() {
        let rejected = anyhow::anyhow!("server returned: nonce too low: next nonce 5");
        let tunnel = anyhow::anyhow!("error sending request: tunnel error");
        let logic = anyhow::anyhow!("insufficient balance for transfer");

        assert_eq!(classify_error(&rejected), ErrorClass::SequenceRejected);
        assert_eq!(classify_error(&tunnel), ErrorClass::Transport);
        assert_eq!(classify_error(&logic), ErrorClass::TaskLogic);
    }

    #[test]
    fn rate_limits_count_as_transport() {
        let limited = anyhow::anyhow!("429 Too Many Requests");
        let busy = anyhow::anyhow!("node busy, try again");

        assert_eq!(classify_error(&limited), ErrorClass::Transport);
        assert_eq!(classify_error(&busy), ErrorClass::Transport);
    }

    #[test]
    fn hard_failures_are_proxy_level() {
        assert!(is_hard_transport_failure("tunnel error: unsuccessful"));
        assert!(is_hard_transport_failure("HTTP 407 Proxy Authentication Required"));
        assert!(!is_hard_transport_failure("connection reset by peer"));
    }

    #[test]
    fn endpoint_faults() {
        assert!(DispatchError::Timeout { timeout_ms: 10 }.is_endpoint_fault());
        assert!(!DispatchError::TaskLogic("x".into()).is_endpoint_fault());
        assert_eq!(
            DispatchError::EndpointUnavailable.class().to_string(),
            "endpoint_unavailable"
        );
    }
}
