//! Error types for the observer core.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for observer core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller mistake (empty topic, malformed entity id). Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The topic/observer/observable relationship does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already registered as observable for topic: {topic}")]
    AlreadyRegistered { topic: String },

    /// Malformed filter expression, reported with the offending predicate.
    #[error("Filter compile error in `{predicate}`: {reason}")]
    Compile { predicate: String, reason: String },

    /// Storage or transport hiccup. Retried by [`crate::retry::RetryPolicy`].
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("{operation} failed after {attempts} attempts: {last}")]
    TimeoutExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Mailbox for {recipient} is full: {existing} queued + {incoming} incoming > capacity {capacity}")]
    Capacity {
        recipient: String,
        capacity: usize,
        existing: usize,
        incoming: usize,
    },

    /// Non-transient failure reported by a downstream peer.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Aggregate of the per-target failures of one fan-out.
    #[error("Delivery failed for {} target(s): {}", .0.len(), summarize(.0))]
    Delivery(Vec<TargetFailure>),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,
}

impl CoreError {
    /// Whether the failure class is retried by the retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }

    pub(crate) fn compile(predicate: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Compile {
            predicate: predicate.into(),
            reason: reason.into(),
        }
    }
}

/// One failed delivery target inside a [`CoreError::Delivery`] aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFailure {
    /// `entityURI` of the target.
    pub target: String,
    pub error: String,
}

impl TargetFailure {
    /// Failure of `target` described by `error`.
    pub fn new(target: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            target: target.into(),
            error: error.to_string(),
        }
    }
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.target, self.error)
    }
}

fn summarize(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CoreError::Deserialization(e.to_string())
    }
}

/// Result type for observer core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(CoreError::Transient("conflict".into()).is_transient());
        assert!(!CoreError::NotFound("topic".into()).is_transient());
        assert!(!CoreError::Remote("boom".into()).is_transient());
        assert!(!CoreError::TimeoutExhausted {
            operation: "notify".into(),
            attempts: 3,
            last: "down".into(),
        }
        .is_transient());
    }

    #[test]
    fn test_delivery_message_lists_targets() {
        let err = CoreError::Delivery(vec![
            TargetFailure {
                target: "svc://a/1".into(),
                error: "full".into(),
            },
            TargetFailure {
                target: "svc://a/2".into(),
                error: "rejected".into(),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("2 target(s)"));
        assert!(text.contains("svc://a/1 (full)"));
        assert!(text.contains("svc://a/2 (rejected)"));
    }
}
