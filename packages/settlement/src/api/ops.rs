//! Health, probes and Prometheus metrics

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tracing::warn;

use super::SharedState;
use crate::db::StoreStats;

/// Health check response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub ready: bool,
    pub store_reachable: bool,
    #[serde(flatten)]
    pub stats: StoreStats,
}

pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let (store_reachable, stats) = match state.store.stats().await {
        Ok(stats) => (true, stats),
        Err(e) => {
            warn!(error = %e, "Health check could not read store stats");
            (false, StoreStats::default())
        }
    };
    let ready = state.gate.is_ready();
    Json(HealthResponse {
        status: if ready && store_reachable { "healthy" } else { "degraded" },
        ready,
        store_reachable,
        stats,
    })
}

/// Liveness probe (always returns OK if server is running)
pub async fn healthz() -> &'static str {
    "OK"
}

/// Readiness probe: gate open and store answering.
pub async fn readyz(State(state): State<SharedState>) -> (StatusCode, &'static str) {
    if !state.gate.is_ready() {
        return (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY");
    }
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(e) => {
            warn!(error = %e, "Readiness probe failed to reach the store");
            (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY")
        }
    }
}

/// Prometheus metrics endpoint
pub async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_health_reports_counters() {
        let api = TestApi::new();
        api.harness.reserved_bridge("20").await;

        let response = api.send(get("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["activeBridges"], 1);
    }

    #[tokio::test]
    async fn test_probes() {
        let api = TestApi::new();
        assert_eq!(api.send(get("/healthz")).await.status(), StatusCode::OK);
        assert_eq!(api.send(get("/readyz")).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_text_format() {
        let api = TestApi::new();
        let response = api.send(get("/metrics")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("settlement_up"));
    }
}
