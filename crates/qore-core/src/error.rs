// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the QoreDB dispatch core
//!
//! Adapter-specific failures are mapped to these unified error types so the
//! dispatcher and its receivers see one consistent taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all dispatch operations
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineError {
    #[error("Request already registered: {request_id}")]
    AlreadyExists { request_id: String },

    #[error("Request not found: {request_id}")]
    RequestNotFound { request_id: String },

    #[error("Connector not found: {connector}")]
    ConnectorNotFound { connector: String },

    #[error("Connector '{connector}' is shutting down")]
    ShuttingDown { connector: String },

    #[error("Request already closed: {request_id}")]
    AlreadyClosed { request_id: String },

    #[error("Request not yet started: {request_id}")]
    NotYetStarted { request_id: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Query execution error: {message}")]
    ExecutionError { message: String },

    #[error("{message}")]
    ShapeMismatch { message: String },

    #[error("Expected {expected} columns, but the source returned {actual}")]
    ColumnCountMismatch { expected: usize, actual: usize },

    #[error("Connector '{connector}' is immutable: update commands are not permitted")]
    ReadOnly { connector: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Source did not stop within {grace_ms}ms of cancellation; resources were forcibly released")]
    CancelTimeout { grace_ms: u64 },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn already_exists(id: impl ToString) -> Self {
        Self::AlreadyExists {
            request_id: id.to_string(),
        }
    }

    pub fn request_not_found(id: impl ToString) -> Self {
        Self::RequestNotFound {
            request_id: id.to_string(),
        }
    }

    pub fn connector_not_found(connector: impl Into<String>) -> Self {
        Self::ConnectorNotFound {
            connector: connector.into(),
        }
    }

    pub fn shutting_down(connector: impl Into<String>) -> Self {
        Self::ShuttingDown {
            connector: connector.into(),
        }
    }

    pub fn already_closed(id: impl ToString) -> Self {
        Self::AlreadyClosed {
            request_id: id.to_string(),
        }
    }

    pub fn not_yet_started(id: impl ToString) -> Self {
        Self::NotYetStarted {
            request_id: id.to_string(),
        }
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch { message: msg.into() }
    }

    pub fn read_only(connector: impl Into<String>) -> Self {
        Self::ReadOnly {
            connector: connector.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// Contract errors raised by the caller of the dispatcher; never retried.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists { .. }
                | Self::RequestNotFound { .. }
                | Self::ConnectorNotFound { .. }
                | Self::AlreadyClosed { .. }
                | Self::NotYetStarted { .. }
        )
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message_is_verbatim() {
        let err = EngineError::shape_mismatch("Expected 2 result set columns, but was 1.");
        assert_eq!(err.to_string(), "Expected 2 result set columns, but was 1.");
    }

    #[test]
    fn test_contract_violations() {
        assert!(EngineError::already_exists("s.q.0").is_contract_violation());
        assert!(EngineError::not_yet_started("s.q.0").is_contract_violation());
        assert!(!EngineError::Cancelled.is_contract_violation());
        assert!(!EngineError::execution_error("boom").is_contract_violation());
    }

    #[test]
    fn test_error_serializes_with_variant_tag() {
        let json = serde_json::to_string(&EngineError::Timeout { timeout_ms: 10 }).unwrap();
        assert_eq!(json, r#"{"Timeout":{"timeout_ms":10}}"#);
    }
}
