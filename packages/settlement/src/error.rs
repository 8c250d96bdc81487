//! Error taxonomy for the settlement core.
//!
//! `SettlementError` is what every state-machine operation returns; the HTTP
//! layer maps it onto status codes in `api::error`. Collaborator failures
//! (ledger, collateral system, vault, attestation oracle) arrive as
//! `ClientError` and are wrapped with the name of the service that failed.

use thiserror::Error;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Network, timeout or node-side transient failure
    #[error("transport error: {0}")]
    Transport(String),
    /// The service answered but refused the request (revert, engine result, 4xx)
    #[error("rejected: {reason}")]
    Rejected { reason: String },
    /// The queried object does not exist (yet)
    #[error("not found: {0}")]
    NotFound(String),
    /// The response could not be decoded into the expected shape
    #[error("decode error: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettlementError {
    /// Bad input, unknown vault/position, insufficient shares
    #[error("{0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The record is not in a state that allows the operation
    #[error("{message}")]
    InvalidState {
        message: String,
        current: String,
        expected: Vec<String>,
    },

    /// Payment is confirmed, so the bridge is past the point where it can
    /// be cancelled
    #[error("{message}")]
    CancellationClosed { message: String, current: String },

    /// Ledger evidence, proof or signature did not check out
    #[error("verification failed: {0}")]
    Verification(String),

    /// A single-use cancellation message was presented twice
    #[error("cancellation message already used: {0}")]
    Replay(String),

    /// Ledger validation polling exhausted its attempts
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{service} error: {source}")]
    External {
        service: &'static str,
        #[source]
        source: ClientError,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T, E = SettlementError> = std::result::Result<T, E>;

impl SettlementError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn verification(message: impl Into<String>) -> Self {
        Self::Verification(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(
        message: impl Into<String>,
        current: impl ToString,
        expected: &[&str],
    ) -> Self {
        Self::InvalidState {
            message: message.into(),
            current: current.to_string(),
            expected: expected.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn external(service: &'static str, source: ClientError) -> Self {
        Self::External { service, source }
    }

    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::CancellationClosed { .. } => "CANCELLATION_CLOSED",
            Self::Verification(_) => "VERIFICATION_FAILED",
            Self::Replay(_) => "REPLAYED_CANCELLATION",
            Self::Timeout(_) => "VALIDATION_TIMEOUT",
            Self::External { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Unavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether a background step failing with this error may be retried
    /// later by the sweeper or by reconciliation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::External { .. } | Self::Unavailable(_) | Self::Storage(_)
        )
    }

    /// Current status carried by `InvalidState`, surfaced as `currentStatus`.
    pub fn current_status(&self) -> Option<&str> {
        match self {
            Self::InvalidState { current, .. } | Self::CancellationClosed { current, .. } => {
                Some(current.as_str())
            }
            _ => None,
        }
    }
}

impl From<sqlx::Error> for SettlementError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SettlementError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(
            SettlementError::not_found("bridge", "abc").code(),
            "NOT_FOUND"
        );
        assert_eq!(
            SettlementError::Replay("cancel:1:2".into()).code(),
            "REPLAYED_CANCELLATION"
        );
    }

    #[test]
    fn test_invalid_state_carries_current_status() {
        let err = SettlementError::invalid_state(
            "minting has started",
            "xrpl_confirmed",
            &["pending", "awaiting_payment"],
        );
        assert_eq!(err.current_status(), Some("xrpl_confirmed"));
        assert_eq!(err.to_string(), "minting has started");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SettlementError::Timeout("ledger".into()).is_retryable());
        assert!(
            SettlementError::external("fdc", ClientError::Transport("reset".into())).is_retryable()
        );
        assert!(!SettlementError::verification("bad memo").is_retryable());
        assert!(!SettlementError::validation("bad amount").is_retryable());
    }

    #[test]
    fn test_external_display_names_service() {
        let err = SettlementError::external("asset_manager", ClientError::rejected("paused"));
        assert_eq!(err.to_string(), "asset_manager error: rejected: paused");
    }
}
