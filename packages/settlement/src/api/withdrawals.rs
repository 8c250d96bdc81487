//! Redemption endpoints

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::{ApiResult, SharedState};
use crate::redemption::{CreateRedemptionRequest, CreatedRedemption, RedemptionStatusView};
use crate::worker::Job;

pub async fn create(
    State(state): State<SharedState>,
    payload: Result<Json<CreateRedemptionRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreatedRedemption>)> {
    let Json(request) = payload?;
    let created = state.redemptions.create(&request).await?;
    state.queue.enqueue(Job::ProcessRedemption(created.redemption_id));
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn status(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<RedemptionStatusView>> {
    let Path(id) = id?;
    Ok(Json(state.redemptions.status(id).await?))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::testing::{OTHER_ADDRESS, SHARES_PER_DROP, USER_ADDRESS};
    use crate::worker::Job;
    use axum::http::StatusCode;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_create_and_poll_status() {
        let mut api = TestApi::new();
        // 50 XRP position with 20 XRP already reserved
        let (_, position_id) = api.harness.pending_redemption(20).await;

        let shares = (20_000_000 * SHARES_PER_DROP).to_string();
        let response = api
            .send(post_json(
                "/withdrawals",
                json!({ "positionId": position_id, "shareAmount": shares, "userAddress": USER_ADDRESS }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["status"], "pending");
        let id: Uuid = body["redemptionId"].as_str().unwrap().parse().unwrap();
        assert_eq!(api.drain_jobs(), vec![Job::ProcessRedemption(id)]);

        let response = api.send(get(&format!("/withdrawals/{}/status", id))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["userStatus"], "processing");
        assert_eq!(body["currentStep"], "Queued");
    }

    #[tokio::test]
    async fn test_foreign_position_is_rejected() {
        let api = TestApi::new();
        let (_, position_id) = api.harness.pending_redemption(10).await;

        let response = api
            .send(post_json(
                "/withdrawals",
                json!({ "positionId": position_id, "shareAmount": "1000", "userAddress": OTHER_ADDRESS }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "VALIDATION_ERROR");
    }
}
