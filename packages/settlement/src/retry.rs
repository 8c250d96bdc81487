//! Retry and backoff for calls to external collaborators
//!
//! Ledger RPC, verifier and DA-layer requests are stateless and safe to
//! repeat; this module decides which failures are worth repeating and how
//! long to wait in between.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ClientError;

/// Retry configuration for one external call
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries at all; used by tests and by callers that poll on their own.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// Permanent failure - do not retry (revert, malformed response)
    Permanent,
}

/// Classify a raw error message
pub fn classify_message(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
        || error_lower.contains("toobusy")
        || error_lower.contains("notready")
    {
        return ErrorClass::Transient;
    }

    ErrorClass::Permanent
}

/// Classify a collaborator error
pub fn classify_error(error: &ClientError) -> ErrorClass {
    match error {
        ClientError::Transport(_) => ErrorClass::Transient,
        ClientError::Rejected { reason } => classify_message(reason),
        ClientError::NotFound(_) | ClientError::Decode(_) => ErrorClass::Permanent,
    }
}

/// Execute `operation` until it succeeds, fails permanently or runs out of
/// attempts. The closure receives the 0-indexed attempt number.
pub async fn with_retry<F, T, Fut>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T, ClientError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 0u32;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if classify_error(&e) == ErrorClass::Permanent {
                    debug!(call = what, error = %e, "Permanent error, not retrying");
                    return Err(e);
                }
                if !config.should_retry(attempt) {
                    warn!(call = what, attempts = attempt + 1, error = %e, "Retries exhausted");
                    return Err(e);
                }
                let backoff = config.backoff_for_attempt(attempt);
                warn!(
                    call = what,
                    attempt = attempt + 1,
                    max = config.max_retries,
                    ?backoff,
                    error = %e,
                    "Retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        };

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            classify_error(&ClientError::Transport("connection reset".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_error(&ClientError::rejected("tooBusy")),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_error(&ClientError::rejected("execution reverted: invalid proof")),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_error(&ClientError::Decode("missing field".into())),
            ErrorClass::Permanent
        );
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        };

        let result = with_retry(&config, "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ClientError::Transport("timeout".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_permanent() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryConfig::default(), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::rejected("execution reverted")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
