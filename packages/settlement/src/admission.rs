//! Admission control: readiness gate, operator capability and the rate
//! limit budgets applied by the router.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::ApiConfig;
use crate::metrics;

/// Header carrying the operator key on recovery endpoints
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Closed until storage and the execution-chain client are initialized.
#[derive(Debug, Default)]
pub struct ReadinessGate {
    ready: AtomicBool,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        metrics::set_up(true);
    }

    pub fn mark_unready(&self) {
        self.ready.store(false, Ordering::SeqCst);
        metrics::set_up(false);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Middleware rejecting traffic with 503 while the gate is closed.
pub async fn require_ready(State(gate): State<Arc<ReadinessGate>>, request: Request, next: Next) -> Response {
    if !gate.is_ready() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "service is starting, collaborators are not initialized yet",
                "code": "UNAVAILABLE",
            })),
        )
            .into_response();
    }
    next.run(request).await
}

/// Shared secret required by operator recovery endpoints.
#[derive(Clone)]
pub struct OperatorKey(Arc<str>);

impl std::fmt::Debug for OperatorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OperatorKey(<redacted>)")
    }
}

impl OperatorKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Compare in time independent of where the first mismatch is.
    pub fn matches(&self, presented: &str) -> bool {
        let expected = self.0.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        expected
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        headers
            .get(ADMIN_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |presented| self.matches(presented))
    }
}

/// Middleware admitting only requests carrying the operator key.
pub async fn require_operator(State(key): State<OperatorKey>, request: Request, next: Next) -> Response {
    if !key.authorize(request.headers()) {
        warn!(path = %request.uri().path(), "Operator endpoint called without a valid key");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "unauthorized: operator key required",
                "code": "UNAUTHORIZED",
            })),
        )
            .into_response();
    }
    next.run(request).await
}

/// Per-client request budgets. Fund-moving writes get the strict one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub write_per_min: u32,
    pub read_per_min: u32,
}

impl RateLimits {
    pub fn from_config(api: &ApiConfig) -> Self {
        Self {
            write_per_min: api.rate_limit_write_per_min,
            read_per_min: api.rate_limit_read_per_min,
        }
    }

    /// Time to replenish one request of a `per_min` budget.
    pub fn replenish_period(per_min: u32) -> Duration {
        Duration::from_millis(60_000 / u64::from(per_min.max(1)))
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            write_per_min: 10,
            read_per_min: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_operator_key_matches_exactly() {
        let key = OperatorKey::new("0123456789abcdef0123456789abcdef");
        assert!(key.matches("0123456789abcdef0123456789abcdef"));
        assert!(!key.matches("0123456789abcdef0123456789abcdeX"));
        assert!(!key.matches("0123456789abcdef"));
        assert!(!key.matches(""));
        assert_eq!(format!("{:?}", key), "OperatorKey(<redacted>)");
    }

    #[test]
    fn test_authorize_reads_header() {
        let key = OperatorKey::new("s3cret-s3cret-s3cret-s3cret-s3cret");
        let mut headers = HeaderMap::new();
        assert!(!key.authorize(&headers));
        headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_static("s3cret-s3cret-s3cret-s3cret-s3cret"));
        assert!(key.authorize(&headers));
    }

    #[test]
    fn test_gate_starts_closed() {
        let gate = ReadinessGate::new();
        assert!(!gate.is_ready());
        gate.mark_ready();
        assert!(gate.is_ready());
        gate.mark_unready();
        assert!(!gate.is_ready());
    }

    #[test]
    fn test_replenish_period() {
        assert_eq!(RateLimits::replenish_period(10), Duration::from_secs(6));
        assert_eq!(RateLimits::replenish_period(120), Duration::from_millis(500));
        assert_eq!(RateLimits::replenish_period(0), Duration::from_secs(60));
    }
}
