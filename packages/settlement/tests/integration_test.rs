//! Integration tests for the FXRP settlement service
//!
//! Drive the HTTP router, the worker and the sweeper together against the
//! in-memory store and the scripted collaborators from `settlement::testing`.
//! Postgres-backed store tests live next to `PgStore` and are ignored unless
//! DATABASE_URL points at a disposable database:
//!
//! Run with: cargo test -p fxrp-settlement -- --ignored

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use settlement::admission::{OperatorKey, RateLimits, ReadinessGate};
use settlement::api::{router, AppState};
use settlement::bridge::CreateBridgeRequest;
use settlement::db::Store;
use settlement::testing::{Harness, USER_ADDRESS};
use settlement::types::{BridgeStatus, RedemptionStatus};
use settlement::worker::{job_queue, Job, JobQueue, Sweeper, Worker};

const ADMIN_KEY: &str = "integration-admin-key-0123456789abcdef";
const PAYMENT: &str = "A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1A1";

struct Service {
    harness: Harness,
    router: Router,
    queue: JobQueue,
    shutdown: mpsc::Sender<()>,
    worker: tokio::task::JoinHandle<()>,
}

impl Service {
    fn start() -> Self {
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
            queue: queue.clone(),
            gate,
        });
        let router = router(state, OperatorKey::new(ADMIN_KEY), RateLimits::default()).unwrap();

        let (shutdown, shutdown_rx) = mpsc::channel(1);
        let worker = Worker::new(harness.bridges.clone(), harness.redemptions.clone(), queue.clone(), 4);
        let worker = tokio::spawn(worker.run(jobs, shutdown_rx));

        Self {
            harness,
            router,
            queue,
            shutdown,
            worker,
        }
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.call(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .header("x-forwarded-for", "198.51.100.20")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.call(
            Request::builder()
                .uri(uri)
                .header("x-forwarded-for", "198.51.100.20")
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    async fn wait_for_bridge(&self, id: Uuid, wanted: BridgeStatus) -> BridgeStatus {
        let mut status = BridgeStatus::Pending;
        for _ in 0..200 {
            status = self.harness.bridges.get(id).await.unwrap().status;
            if status == wanted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        status
    }

    async fn stop(self) {
        self.shutdown.send(()).await.unwrap();
        self.worker.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bridge_settles_through_api_and_worker() {
    let service = Service::start();

    let (status, created) = service
        .post(
            "/bridges",
            json!({ "walletAddress": USER_ADDRESS, "vaultId": "fxrp-core", "amount": "30" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let id: Uuid = created["bridgeId"].as_str().unwrap().parse().unwrap();

    assert_eq!(
        service.wait_for_bridge(id, BridgeStatus::AwaitingPayment).await,
        BridgeStatus::AwaitingPayment
    );
    let (_, view) = service.get(&format!("/bridges/{}/status", id)).await;
    assert!(view["paymentRequest"]["destination"].is_string());
    assert!(view["feeBreakdown"].is_object());

    service.harness.pay(id, PAYMENT).await;
    let (status, _) = service
        .post(
            &format!("/bridges/{}/reconcile-payment", id),
            json!({ "xrplTxHash": PAYMENT }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        service.wait_for_bridge(id, BridgeStatus::Completed).await,
        BridgeStatus::Completed
    );
    let (_, view) = service.get(&format!("/bridges/{}/status", id)).await;
    assert!(view["positionId"].is_string());
    assert!(view["depositTxHash"].is_string());
    assert_eq!(service.harness.vault.script.calls("deposit"), 1);

    // Reporting the same hash again changes nothing
    let (status, view) = service
        .post(
            &format!("/bridges/{}/reconcile-payment", id),
            json!({ "xrplTxHash": PAYMENT }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "completed");
    assert_eq!(service.harness.vault.script.calls("deposit"), 1);

    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_mint_jobs_deposit_once() {
    let service = Service::start();
    let id = service.harness.confirmed_bridge("20", PAYMENT).await;

    for _ in 0..4 {
        assert!(service.queue.enqueue(Job::MintBridge(id)));
    }
    assert_eq!(
        service.wait_for_bridge(id, BridgeStatus::Completed).await,
        BridgeStatus::Completed
    );
    // Let the losing jobs finish
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(service.harness.vault.script.calls("deposit"), 1);
    let position_id = service.harness.bridges.get(id).await.unwrap().position_id.unwrap();
    let position = service.harness.store.get_position(position_id).await.unwrap().unwrap();
    assert!(position.shares > 0);

    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redemption_processing_redeems_once() {
    let h = Harness::new();
    let (id, _) = h.pending_redemption(20).await;

    let (a, b) = tokio::join!(h.redemptions.process(id), h.redemptions.process(id));
    assert!(a.is_ok());
    assert!(b.is_ok());

    assert_eq!(h.vault.script.calls("redeem"), 1);
    assert_eq!(h.collateral.redemptions().len(), 1);
    assert_eq!(
        h.redemptions.get(id).await.unwrap().status,
        RedemptionStatus::AwaitingProof
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweeper_picks_up_work_without_a_job() {
    let service = Service::start();
    // Created directly, so nothing was enqueued
    let created = service
        .harness
        .bridges
        .create(&CreateBridgeRequest {
            wallet_address: USER_ADDRESS.into(),
            vault_id: "fxrp-core".into(),
            amount: "20".into(),
            position_id: None,
        })
        .await
        .unwrap();

    let sweeper = Sweeper::new(
        service.harness.store.clone(),
        service.harness.bridges.clone(),
        service.queue.clone(),
        Duration::from_secs(60),
    );
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.enqueued, 1);

    assert_eq!(
        service.wait_for_bridge(created.bridge_id, BridgeStatus::AwaitingPayment).await,
        BridgeStatus::AwaitingPayment
    );

    // The client pays but never reports the hash
    service.harness.pay(created.bridge_id, PAYMENT).await;
    sweeper.sweep_once().await.unwrap();
    assert_eq!(
        service.wait_for_bridge(created.bridge_id, BridgeStatus::Completed).await,
        BridgeStatus::Completed
    );

    service.stop().await;
}

#[tokio::test]
async fn test_operator_recovery_requires_key() {
    let service = Service::start();
    let (status, body) = service.post("/admin/reconcile-all", json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let response = service
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/reconcile-all")
                .header("x-admin-key", ADMIN_KEY)
                .header("x-forwarded-for", "198.51.100.20")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    service.stop().await;
}
