//! HTTP API
//!
//! Deposit bridges under `/bridges`, redemptions under `/withdrawals`,
//! operator recovery under `/admin` plus the per-record recovery actions,
//! and the ops endpoints (`/health`, `/healthz`, `/readyz`, `/metrics`).
//!
//! Everything except the ops endpoints sits behind the readiness gate.
//! Fund-moving writes share the strict rate-limit budget, status polling
//! the relaxed one. Operator routes also require `x-admin-key`.

pub mod admin;
pub mod bridges;
pub mod error;
pub mod ops;
pub mod withdrawals;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use eyre::{eyre, Result as EyreResult};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tracing::info;

use crate::admission::{require_operator, require_ready, OperatorKey, RateLimits, ReadinessGate};
use crate::bridge::BridgeService;
use crate::cancellation::CancellationService;
use crate::db::Store;
use crate::recovery::RecoveryService;
use crate::redemption::RedemptionService;
use crate::worker::JobQueue;

pub use error::{ApiError, ApiResult, ErrorResponse};

/// Shared handler state
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub bridges: Arc<BridgeService>,
    pub redemptions: Arc<RedemptionService>,
    pub recovery: Arc<RecoveryService>,
    pub cancellation: Arc<CancellationService>,
    pub queue: JobQueue,
    pub gate: Arc<ReadinessGate>,
}

pub type SharedState = Arc<AppState>;

/// Build the full router.
pub fn router(state: SharedState, operator_key: OperatorKey, limits: RateLimits) -> EyreResult<Router> {
    let write_limit = GovernorConfigBuilder::default()
        .per_millisecond(RateLimits::replenish_period(limits.write_per_min).as_millis() as u64)
        .burst_size(limits.write_per_min.max(1))
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .ok_or_else(|| eyre!("Invalid write rate limit: {}/min", limits.write_per_min))?;
    let read_limit = GovernorConfigBuilder::default()
        .per_millisecond(RateLimits::replenish_period(limits.read_per_min).as_millis() as u64)
        .burst_size(limits.read_per_min.max(1))
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .ok_or_else(|| eyre!("Invalid read rate limit: {}/min", limits.read_per_min))?;
    let operator_limit = GovernorConfigBuilder::default()
        .per_millisecond(RateLimits::replenish_period(limits.read_per_min).as_millis() as u64)
        .burst_size(limits.read_per_min.max(1))
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .ok_or_else(|| eyre!("Invalid read rate limit: {}/min", limits.read_per_min))?;

    let writes = Router::new()
        .route("/bridges", post(bridges::create))
        .route("/bridges/{id}/reconcile-payment", post(bridges::reconcile_payment))
        .route("/bridges/{id}/submit-payment", post(bridges::submit_payment))
        .route("/bridges/{id}/cancel-request", post(bridges::cancel_request))
        .route("/bridges/{id}/cancel", post(bridges::cancel))
        .route("/withdrawals", post(withdrawals::create))
        .layer(GovernorLayer::new(write_limit));

    let reads = Router::new()
        .route("/bridges/quote", get(bridges::quote))
        .route("/bridges/{id}/status", get(bridges::status))
        .route("/withdrawals/{id}/status", get(withdrawals::status))
        .layer(GovernorLayer::new(read_limit));

    // Key check runs before the budget is spent
    let operator = Router::new()
        .route("/bridges/{id}/retry-proof", post(admin::retry_proof))
        .route("/bridges/{id}/recover-proof", post(admin::recover_proof))
        .route("/bridges/{id}/reconcile", post(admin::reconcile_bridge))
        .route("/withdrawals/{id}/retry", post(admin::retry_withdrawal))
        .route("/withdrawals/{id}/complete", post(admin::complete_withdrawal))
        .route("/admin/recoverable", get(admin::recoverable))
        .route("/admin/reconcile-all", post(admin::reconcile_all))
        .layer(GovernorLayer::new(operator_limit))
        .layer(middleware::from_fn_with_state(operator_key, require_operator));

    let gated = Router::new()
        .merge(writes)
        .merge(reads)
        .merge(operator)
        .layer(middleware::from_fn_with_state(state.gate.clone(), require_ready))
        .with_state(state.clone());

    let ops = Router::new()
        .route("/health", get(ops::health))
        .route("/healthz", get(ops::healthz))
        .route("/readyz", get(ops::readyz))
        .route("/metrics", get(ops::metrics))
        .with_state(state);

    Ok(ops.merge(gated))
}

/// Serve `router` until `shutdown` resolves.
pub async fn serve<F>(router: Router, bind_address: &str, port: u16, shutdown: F) -> EyreResult<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;

    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!("API server stopped");
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::testing::Harness;
    use crate::worker::{job_queue, Job};
    use axum::body::Body;
    use axum::http::{Request, Response};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    pub const ADMIN_KEY: &str = "test-admin-key-0123456789abcdef";

    pub struct TestApi {
        pub harness: Harness,
        pub router: Router,
        pub gate: Arc<ReadinessGate>,
        pub jobs: mpsc::Receiver<Job>,
    }

    impl TestApi {
        pub fn new() -> Self {
            Self::with_limits(RateLimits { write_per_min: 100, read_per_min: 100 })
        }

        pub fn with_limits(limits: RateLimits) -> Self {
            let harness = Harness::new();
            let (queue, jobs) = job_queue(64);
            let gate = Arc::new(ReadinessGate::new());
            gate.mark_ready();
            let state = Arc::new(AppState {
                store: harness.store.clone(),
                bridges: harness.bridges.clone(),
                redemptions: harness.redemptions.clone(),
                recovery: harness.recovery.clone(),
                cancellation: harness.cancellation.clone(),
                queue,
                gate: gate.clone(),
            });
            let router = router(state, OperatorKey::new(ADMIN_KEY), limits).expect("router builds");
            Self { harness, router, gate, jobs }
        }

        pub async fn send(&self, request: Request<Body>) -> Response<Body> {
            self.router.clone().oneshot(request).await.expect("router is infallible")
        }

        pub fn drain_jobs(&mut self) -> Vec<Job> {
            let mut jobs = Vec::new();
            while let Ok(job) = self.jobs.try_recv() {
                jobs.push(job);
            }
            jobs
        }
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .expect("valid request")
    }

    pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::from(body.to_string()))
            .expect("valid request")
    }

    pub fn admin_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        let mut request = post_json(uri, body);
        request
            .headers_mut()
            .insert(crate::admission::ADMIN_KEY_HEADER, ADMIN_KEY.parse().expect("valid header"));
        request
    }

    pub fn admin_get(uri: &str) -> Request<Body> {
        let mut request = get(uri);
        request
            .headers_mut()
            .insert(crate::admission::ADMIN_KEY_HEADER, ADMIN_KEY.parse().expect("valid header"));
        request
    }

    pub async fn json_body(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body readable");
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_gate_closed_rejects_api_but_not_ops() {
        let api = TestApi::new();
        api.gate.mark_unready();

        let response = api.send(get("/bridges/quote?vaultId=fxrp-core&amount=20")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["code"], "UNAVAILABLE");

        let response = api.send(get("/healthz")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = api.send(get("/readyz")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_write_budget_is_enforced() {
        let api = TestApi::with_limits(crate::admission::RateLimits {
            write_per_min: 2,
            read_per_min: 100,
        });
        let body = json!({ "walletAddress": "not-an-address", "vaultId": "fxrp-core", "amount": "20" });

        for _ in 0..2 {
            let response = api.send(post_json("/bridges", body.clone())).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        let response = api.send(post_json("/bridges", body)).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // Reads have their own budget
        let response = api.send(get("/bridges/quote?vaultId=fxrp-core&amount=20")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_operator_routes_need_key() {
        let api = TestApi::new();
        let response = api.send(get("/admin/recoverable")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = api.send(admin_get("/admin/recoverable")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
