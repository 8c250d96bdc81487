//! Deposit bridge endpoints

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiResult, SharedState};
use crate::bridge::{BridgeQuote, BridgeStatusView, CreateBridgeRequest, CreatedBridge};
use crate::cancellation::{CancelChallenge, CancelRequest, Cancelled};
use crate::types::BridgeStatus;
use crate::worker::Job;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteParams {
    pub vault_id: String,
    pub amount: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilePaymentRequest {
    pub xrpl_tx_hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPaymentRequest {
    pub signed_tx_blob: String,
}

pub async fn quote(
    State(state): State<SharedState>,
    params: Result<Query<QuoteParams>, QueryRejection>,
) -> ApiResult<Json<BridgeQuote>> {
    let Query(params) = params?;
    let quote = state.bridges.quote(&params.vault_id, &params.amount).await?;
    Ok(Json(quote))
}

pub async fn create(
    State(state): State<SharedState>,
    payload: Result<Json<CreateBridgeRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreatedBridge>)> {
    let Json(request) = payload?;
    let created = state.bridges.create(&request).await?;
    state.queue.enqueue(Job::ReserveBridge(created.bridge_id));
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn status(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<BridgeStatusView>> {
    let Path(id) = id?;
    Ok(Json(state.bridges.status(id).await?))
}

fn enqueue_mint(state: &SharedState, view: &BridgeStatusView) {
    if view.status == BridgeStatus::XrplConfirmed {
        state.queue.enqueue(Job::MintBridge(view.bridge_id));
    }
}

pub async fn reconcile_payment(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<ReconcilePaymentRequest>, JsonRejection>,
) -> ApiResult<Json<BridgeStatusView>> {
    let Path(id) = id?;
    let Json(request) = payload?;
    let view = state.bridges.confirm_payment(id, &request.xrpl_tx_hash).await?;
    enqueue_mint(&state, &view);
    Ok(Json(view))
}

pub async fn submit_payment(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<SubmitPaymentRequest>, JsonRejection>,
) -> ApiResult<Json<BridgeStatusView>> {
    let Path(id) = id?;
    let Json(request) = payload?;
    let view = state.bridges.submit_payment(id, &request.signed_tx_blob).await?;
    enqueue_mint(&state, &view);
    Ok(Json(view))
}

pub async fn cancel_request(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<CancelChallenge>> {
    let Path(id) = id?;
    Ok(Json(state.cancellation.issue(id).await?))
}

pub async fn cancel(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<CancelRequest>, JsonRejection>,
) -> ApiResult<Json<Cancelled>> {
    let Path(id) = id?;
    let Json(request) = payload?;
    Ok(Json(state.cancellation.cancel(id, &request).await?))
}
