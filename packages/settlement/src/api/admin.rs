//! Operator recovery endpoints

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    Json,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{ApiResult, SharedState};
use crate::bridge::MintOutcome;
use crate::recovery::{ReconcileReport, Reconciled, RecoverableRecords};
use crate::redemption::RedemptionStatusView;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxHashRequest {
    pub xrpl_tx_hash: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverableParams {
    pub stale_secs: Option<i64>,
}

pub async fn retry_proof(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<MintOutcome>> {
    let Path(id) = id?;
    info!(bridge_id = %id, "Operator retry-proof");
    Ok(Json(state.recovery.retry_proof(id).await?))
}

pub async fn recover_proof(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<TxHashRequest>, JsonRejection>,
) -> ApiResult<Json<MintOutcome>> {
    let Path(id) = id?;
    let Json(request) = payload?;
    Ok(Json(state.recovery.recover_proof(id, &request.xrpl_tx_hash).await?))
}

pub async fn reconcile_bridge(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<Reconciled>> {
    let Path(id) = id?;
    Ok(Json(state.recovery.reconcile_bridge(id).await?))
}

pub async fn retry_withdrawal(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<RedemptionStatusView>> {
    let Path(id) = id?;
    info!(redemption_id = %id, "Operator retry");
    Ok(Json(state.recovery.retry_redemption(id).await?))
}

pub async fn complete_withdrawal(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<TxHashRequest>, JsonRejection>,
) -> ApiResult<Json<RedemptionStatusView>> {
    let Path(id) = id?;
    let Json(request) = payload?;
    Ok(Json(state.recovery.complete_redemption(id, &request.xrpl_tx_hash).await?))
}

pub async fn recoverable(
    State(state): State<SharedState>,
    params: Result<Query<RecoverableParams>, QueryRejection>,
) -> ApiResult<Json<RecoverableRecords>> {
    let Query(params) = params?;
    Ok(Json(state.recovery.recoverable(params.stale_secs).await?))
}

pub async fn reconcile_all(State(state): State<SharedState>) -> ApiResult<Json<ReconcileReport>> {
    Ok(Json(state.recovery.reconcile_all().await?))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use uuid::Uuid;

    const PAY: &str = "D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4D4";
    const PAYOUT: &str = "E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5E5";

    #[tokio::test]
    async fn test_retry_proof_mints_confirmed_bridge() {
        let api = TestApi::new();
        let id = api.harness.confirmed_bridge("20", PAY).await;

        let response = api.send(admin_post(&format!("/bridges/{}/retry-proof", id), json!({}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["outcome"], "completed");

        // Nothing left to retry
        let response = api.send(admin_post(&format!("/bridges/{}/retry-proof", id), json!({}))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["currentStatus"], "completed");
    }

    #[tokio::test]
    async fn test_recover_proof_needs_hash() {
        let api = TestApi::new();
        let id = api.harness.reserved_bridge("20").await;
        let response = api
            .send(admin_post(&format!("/bridges/{}/recover-proof", id), json!({})))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        api.harness.pay(id, PAY).await;
        let response = api
            .send(admin_post(
                &format!("/bridges/{}/recover-proof", id),
                json!({ "xrplTxHash": PAY }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["outcome"], "completed");
    }

    #[tokio::test]
    async fn test_reconcile_unknown_bridge() {
        let api = TestApi::new();
        let response = api
            .send(admin_post(&format!("/bridges/{}/reconcile", Uuid::new_v4()), json!({})))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_complete_withdrawal_with_payout_hash() {
        let api = TestApi::new();
        let (id, _) = api.harness.pending_redemption(20).await;
        api.harness.redemptions.process(id).await.unwrap();
        api.harness.agent_pays(id, PAYOUT).await;

        let response = api
            .send(admin_post(
                &format!("/withdrawals/{}/complete", id),
                json!({ "xrplTxHash": PAYOUT }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["xrplTxHash"], PAYOUT);
    }

    #[tokio::test]
    async fn test_recoverable_lists_stale_records() {
        let api = TestApi::new();
        api.harness.reserved_bridge("20").await;
        api.harness.pending_redemption(20).await;

        let response = api.send(admin_get("/admin/recoverable?staleSecs=0")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["bridges"].as_array().unwrap().len(), 1);
        assert_eq!(body["redemptions"].as_array().unwrap().len(), 1);

        let response = api.send(admin_get("/admin/recoverable?staleSecs=-5")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reconcile_all_reports() {
        let api = TestApi::new();
        let response = api.send(admin_post("/admin/reconcile-all", json!({}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["failures"], 0);
        assert_eq!(body["expired"], 0);
    }
}
