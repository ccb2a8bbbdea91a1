//! CivicGuard error types
//!
//! Errors follow the security error taxonomy: reject-only content,
//! isolation violations and fail-closed infrastructure failures each have
//! their own variant so that callers (and the HTTP layer) can map them to a
//! structured rejection without leaking the detection that triggered it.

use crate::patterns::ThreatKind;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a piece of content was refused outright instead of sanitized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// Instruction-override or role-spoofing text in AI-adjacent content
    PromptInjection,
    /// Template payload designed to execute when rendered later
    DeferredExecution,
    /// Content exceeds the policy's size ceiling
    Oversized,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PromptInjection => write!(f, "prompt-injection"),
            Self::DeferredExecution => write!(f, "deferred-execution"),
            Self::Oversized => write!(f, "oversized"),
        }
    }
}

/// CivicGuard error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Content refused; there is no safe sanitized form
    #[error("Content rejected: {reason}")]
    Rejected {
        reason: RejectReason,
        threat: Option<ThreatKind>,
    },

    /// Resolved access crossed a tenant boundary
    #[error("Isolation violation: tenant {requester} denied access to {target}")]
    IsolationViolation { requester: String, target: String },

    /// No valid tenant-bound session
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Query Guard refused a query spec
    #[error("Query rejected: {0}")]
    QueryRejected(String),

    /// Query exceeded its execution ceiling and was cancelled
    #[error("Query exceeded execution ceiling of {0} ms")]
    QueryTimeout(u64),

    /// Session is blocked by the exfiltration monitor
    #[error("Session blocked: {0}")]
    SessionBlocked(String),

    /// Tenant identifier or registry error
    #[error("Tenant error: {0}")]
    Tenant(String),

    /// Audit write or read failure
    #[error("Audit error: {0}")]
    Audit(String),

    /// Baseline store or comparison failure
    #[error("Baseline error: {0}")]
    Baseline(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for CivicGuard operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status and public error body for this error.
    ///
    /// Security rejections carry a generic message; the specific detection
    /// only ever appears in the audit trail.
    pub fn to_api(&self) -> (StatusCode, ApiError) {
        match self {
            Error::Rejected { .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ApiError::new(
                    "CONTENT_REJECTED",
                    "Content was blocked for a security reason",
                ),
            ),
            Error::QueryRejected(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ApiError::new("QUERY_REJECTED", "Query was blocked for a security reason"),
            ),
            Error::IsolationViolation { .. } => (
                StatusCode::FORBIDDEN,
                ApiError::new("ACCESS_DENIED", "Access denied"),
            ),
            Error::SessionBlocked(_) => (
                StatusCode::FORBIDDEN,
                ApiError::new("ACCESS_DENIED", "Request was blocked for a security reason"),
            ),
            Error::Unauthenticated(_) => (
                StatusCode::UNAUTHORIZED,
                ApiError::new("UNAUTHENTICATED", "A valid tenant session is required"),
            ),
            Error::Tenant(msg) => (StatusCode::BAD_REQUEST, ApiError::bad_request(msg.clone())),
            Error::QueryTimeout(_) | Error::Audit(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiError::new(
                    "SECURITY_UNAVAILABLE",
                    "Security checks could not be completed; the operation was blocked",
                ),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::internal("Internal error"),
            ),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, body) = self.to_api();
        (status, Json(body)).into_response()
    }
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

/// API error detail
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_does_not_leak_reason() {
        let err = Error::Rejected {
            reason: RejectReason::PromptInjection,
            threat: Some(ThreatKind::PromptInjection),
        };
        let (status, body) = err.to_api();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.error.code, "CONTENT_REJECTED");
        assert!(!body.error.message.to_lowercase().contains("prompt"));
    }

    #[test]
    fn test_isolation_violation_is_forbidden() {
        let err = Error::IsolationViolation {
            requester: "malmo".to_string(),
            target: "stockholm:data:residents".to_string(),
        };
        let (status, body) = err.to_api();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.error.code, "ACCESS_DENIED");
        assert!(!body.error.message.contains("stockholm"));
    }

    #[test]
    fn test_infrastructure_failures_fail_closed() {
        assert_eq!(
            Error::Audit("disk full".into()).to_api().0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::QueryTimeout(1000).to_api().0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_api_error_serialization() {
        let err = ApiError::bad_request("unknown content type");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"code\":\"BAD_REQUEST\""));
        assert!(json.contains("unknown content type"));
    }
}
