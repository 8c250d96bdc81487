//! Wallet-signed bridge cancellation
//!
//! The server issues `cancel:{bridge_id}:{unix_ms}`. The wallet signs a
//! no-op AccountSet carrying that message as a memo and returns the signed
//! blob. A cancellation is accepted only when the blob's own signature
//! verifies, its signer is the bridge wallet, the memo is a fresh message
//! for this bridge, and that message was never used before.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Bridge, BridgePatch, Store};
use crate::error::{Result, SettlementError};
use crate::metrics;
use crate::types::BridgeStatus;
use crate::xrpl::address::{address_from_public_key, encode_classic_address};
use crate::xrpl::codec::{decode_signed_transaction_hex, TT_ACCOUNT_SET};
use crate::xrpl::signature::verify_transaction;

const MEMO_TYPE: &str = "text/plain";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelChallenge {
    pub bridge_id: Uuid,
    pub message: String,
    /// Last moment a signature over `message` is accepted
    pub expires_at: DateTime<Utc>,
    /// Unsigned AccountSet for the wallet to sign
    pub tx_json: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub wallet_address: String,
    pub signed_tx_blob: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancelled {
    pub bridge_id: Uuid,
    pub status: BridgeStatus,
    pub cancelled_at: DateTime<Utc>,
}

pub fn cancel_message(bridge_id: Uuid, at: DateTime<Utc>) -> String {
    format!("cancel:{}:{}", bridge_id, at.timestamp_millis())
}

/// Timestamp of a `cancel:{bridge_id}:{ms}` message for `bridge_id`.
fn message_timestamp(message: &str, bridge_id: Uuid) -> Option<i64> {
    let prefix = format!("cancel:{}:", bridge_id);
    let ms = message.strip_prefix(&prefix)?;
    if ms.is_empty() || !ms.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    ms.parse().ok()
}

fn ensure_cancellable(bridge: &Bridge) -> Result<()> {
    match bridge.status {
        status if status.is_cancellable() => Ok(()),
        BridgeStatus::XrplConfirmed | BridgeStatus::Minting => Err(SettlementError::CancellationClosed {
            message: "payment is confirmed and minting has started; the bridge can no longer be cancelled"
                .to_string(),
            current: bridge.status.to_string(),
        }),
        other => Err(SettlementError::invalid_state(
            format!("bridge is {} and cannot be cancelled", other),
            other,
            &BridgeStatus::CANCELLABLE.map(|s| s.as_str()),
        )),
    }
}

pub struct CancellationService {
    store: Arc<dyn Store>,
    window: chrono::Duration,
}

impl CancellationService {
    pub fn new(store: Arc<dyn Store>, window: chrono::Duration) -> Self {
        Self { store, window }
    }

    async fn bridge(&self, id: Uuid) -> Result<Bridge> {
        self.store
            .get_bridge(id)
            .await?
            .ok_or_else(|| SettlementError::not_found("bridge", id))
    }

    /// Issue a fresh cancellation message for a bridge that can still be
    /// cancelled.
    pub async fn issue(&self, id: Uuid) -> Result<CancelChallenge> {
        self.issue_at(id, Utc::now()).await
    }

    pub async fn issue_at(&self, id: Uuid, now: DateTime<Utc>) -> Result<CancelChallenge> {
        let bridge = self.bridge(id).await?;
        ensure_cancellable(&bridge)?;

        let message = cancel_message(id, now);
        let tx_json = json!({
            "TransactionType": "AccountSet",
            "Account": bridge.wallet_address,
            "Memos": [{
                "Memo": {
                    "MemoType": hex::encode_upper(MEMO_TYPE),
                    "MemoData": hex::encode_upper(&message),
                }
            }],
        });

        Ok(CancelChallenge {
            bridge_id: id,
            message,
            expires_at: now + self.window,
            tx_json,
        })
    }

    pub async fn cancel(&self, id: Uuid, request: &CancelRequest) -> Result<Cancelled> {
        self.cancel_at(id, request, Utc::now()).await
    }

    /// Verify a signed cancellation as of `now` and cancel the bridge.
    pub async fn cancel_at(
        &self,
        id: Uuid,
        request: &CancelRequest,
        now: DateTime<Utc>,
    ) -> Result<Cancelled> {
        let result = self.verify_and_cancel(id, request, now).await;
        match &result {
            Ok(_) => metrics::record_cancellation("cancelled"),
            Err(SettlementError::Replay(_)) => metrics::record_cancellation("replay"),
            Err(e) => {
                warn!(bridge_id = %id, error = %e, "Cancellation rejected");
                metrics::record_cancellation("rejected");
            }
        }
        result
    }

    async fn verify_and_cancel(
        &self,
        id: Uuid,
        request: &CancelRequest,
        now: DateTime<Utc>,
    ) -> Result<Cancelled> {
        let bridge = self.bridge(id).await?;
        // A resubmitted message for a cancelled bridge must surface as a replay
        if bridge.status != BridgeStatus::Cancelled {
            ensure_cancellable(&bridge)?;
        }

        if request.wallet_address.trim() != bridge.wallet_address {
            return Err(SettlementError::Unauthorized(
                "wallet does not own this bridge".to_string(),
            ));
        }

        let tx = decode_signed_transaction_hex(&request.signed_tx_blob)?;
        verify_transaction(&tx)?;
        let signer = address_from_public_key(&tx.signing_pub_key);
        if signer != bridge.wallet_address || encode_classic_address(&tx.account) != bridge.wallet_address {
            return Err(SettlementError::verification(
                "cancellation is not signed by the bridge wallet",
            ));
        }

        if tx.transaction_type != TT_ACCOUNT_SET {
            return Err(SettlementError::verification(
                "cancellation must be signed as an AccountSet transaction",
            ));
        }

        let (message, issued_ms) = tx
            .memos
            .iter()
            .filter_map(|m| m.data_utf8())
            .find_map(|data| message_timestamp(data, id).map(|ms| (data.to_string(), ms)))
            .ok_or_else(|| {
                SettlementError::verification("no cancellation message for this bridge in the memos")
            })?;

        let issued_at = DateTime::from_timestamp_millis(issued_ms)
            .ok_or_else(|| SettlementError::verification("cancellation timestamp is out of range"))?;
        if issued_at > now {
            return Err(SettlementError::verification(
                "cancellation timestamp is in the future",
            ));
        }
        if now - issued_at > self.window {
            return Err(SettlementError::verification(format!(
                "cancellation message expired; messages are valid for {} seconds",
                self.window.num_seconds()
            )));
        }

        if !self
            .store
            .consume_cancel_nonce(id, &message, issued_at + self.window)
            .await?
        {
            return Err(SettlementError::Replay(message));
        }
        ensure_cancellable(&bridge)?;

        let patch = BridgePatch {
            status: Some(BridgeStatus::Cancelled),
            error: Some("cancelled by wallet".to_string()),
            cancelled_at: Some(now),
            ..Default::default()
        };
        if !self
            .store
            .update_bridge_if(id, &BridgeStatus::CANCELLABLE, &patch)
            .await?
        {
            let current = self.bridge(id).await?;
            return Err(SettlementError::invalid_state(
                "bridge advanced while the cancellation was verified",
                current.status,
                &BridgeStatus::CANCELLABLE.map(|s| s.as_str()),
            ));
        }

        metrics::record_bridge_transition(BridgeStatus::Cancelled.as_str());
        info!(bridge_id = %id, tx_hash = %tx.hash, "Bridge cancelled by wallet");
        Ok(Cancelled {
            bridge_id: id,
            status: BridgeStatus::Cancelled,
            cancelled_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, NewBridge};
    use crate::types::SettlementKind;
    use crate::xrpl::codec::tests::{
        CANCEL_MESSAGE, ED25519_ACCOUNT_SET, ED25519_ADDRESS, SECP_ACCOUNT_SET, SECP_ADDRESS,
        SECP_PAYMENT,
    };

    const BRIDGE_ID: &str = "7f1b3c8e-2d4a-4e5b-9c6d-0a1b2c3d4e5f";
    const ISSUED_MS: i64 = 1_760_000_000_000;

    fn issued() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ISSUED_MS).unwrap()
    }

    async fn setup(wallet: &str) -> (Arc<MemoryStore>, CancellationService, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let id = Uuid::parse_str(BRIDGE_ID).unwrap();
        store
            .insert_bridge(&NewBridge {
                id,
                wallet_address: wallet.to_string(),
                vault_id: "fxrp-core".into(),
                position_id: None,
                settlement: SettlementKind::AttestedMint,
                requested_drops: 10_000_000,
                rounded_drops: 10_000_000,
                lots: 1,
                expected_fxrp_drops: 10_000_000,
                expires_at: issued() + chrono::Duration::minutes(30),
            })
            .await
            .unwrap();
        let service = CancellationService::new(store.clone(), chrono::Duration::minutes(5));
        (store, service, id)
    }

    fn request(wallet: &str, blob: &str) -> CancelRequest {
        CancelRequest {
            wallet_address: wallet.to_string(),
            signed_tx_blob: blob.to_string(),
        }
    }

    #[test]
    fn test_message_timestamp_is_scoped_to_bridge() {
        let id = Uuid::parse_str(BRIDGE_ID).unwrap();
        assert_eq!(message_timestamp(CANCEL_MESSAGE, id), Some(ISSUED_MS));
        assert_eq!(message_timestamp(CANCEL_MESSAGE, Uuid::new_v4()), None);
        assert_eq!(message_timestamp(&format!("cancel:{}:", id), id), None);
        assert_eq!(message_timestamp(&format!("cancel:{}:12x", id), id), None);
        assert_eq!(cancel_message(id, issued()), CANCEL_MESSAGE);
    }

    #[tokio::test]
    async fn test_issue_builds_account_set() {
        let (_, service, id) = setup(SECP_ADDRESS).await;
        let challenge = service.issue_at(id, issued()).await.unwrap();
        assert_eq!(challenge.message, CANCEL_MESSAGE);
        assert_eq!(challenge.tx_json["TransactionType"], "AccountSet");
        assert_eq!(
            challenge.tx_json["Memos"][0]["Memo"]["MemoData"],
            hex::encode_upper(CANCEL_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_valid_signature_cancels() {
        let (store, service, id) = setup(SECP_ADDRESS).await;
        let now = issued() + chrono::Duration::seconds(30);

        let done = service
            .cancel_at(id, &request(SECP_ADDRESS, SECP_ACCOUNT_SET), now)
            .await
            .unwrap();
        assert_eq!(done.status, BridgeStatus::Cancelled);

        let bridge = store.get_bridge(id).await.unwrap().unwrap();
        assert_eq!(bridge.status, BridgeStatus::Cancelled);
        assert_eq!(bridge.cancelled_at, Some(now));
    }

    #[tokio::test]
    async fn test_resubmitted_cancellation_is_a_replay() {
        let (_, service, id) = setup(SECP_ADDRESS).await;
        let now = issued() + chrono::Duration::seconds(30);
        let req = request(SECP_ADDRESS, SECP_ACCOUNT_SET);

        service.cancel_at(id, &req, now).await.unwrap();
        let err = service
            .cancel_at(id, &req, now + chrono::Duration::seconds(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Replay(_)));
    }

    #[tokio::test]
    async fn test_ed25519_wallet_cancels() {
        let (_, service, id) = setup(ED25519_ADDRESS).await;
        let now = issued() + chrono::Duration::seconds(1);
        service
            .cancel_at(id, &request(ED25519_ADDRESS, ED25519_ACCOUNT_SET), now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_used_message_is_a_replay() {
        let (store, service, id) = setup(SECP_ADDRESS).await;
        let now = issued() + chrono::Duration::seconds(30);
        store
            .consume_cancel_nonce(id, CANCEL_MESSAGE, issued() + chrono::Duration::minutes(5))
            .await
            .unwrap();

        let err = service
            .cancel_at(id, &request(SECP_ADDRESS, SECP_ACCOUNT_SET), now)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Replay(_)));
        let bridge = store.get_bridge(id).await.unwrap().unwrap();
        assert_eq!(bridge.status, BridgeStatus::Pending);
    }

    #[tokio::test]
    async fn test_freshness_window() {
        let (_, service, id) = setup(SECP_ADDRESS).await;
        let req = request(SECP_ADDRESS, SECP_ACCOUNT_SET);

        let stale = issued() + chrono::Duration::minutes(5) + chrono::Duration::seconds(1);
        assert!(matches!(
            service.cancel_at(id, &req, stale).await,
            Err(SettlementError::Verification(_))
        ));

        let early = issued() - chrono::Duration::seconds(1);
        let err = service.cancel_at(id, &req, early).await.unwrap_err();
        assert!(err.to_string().contains("future"));
    }

    #[tokio::test]
    async fn test_signer_must_own_bridge() {
        let (_, service, id) = setup(SECP_ADDRESS).await;
        let now = issued() + chrono::Duration::seconds(30);

        // Signed by another wallet, claimed for this one
        let err = service
            .cancel_at(id, &request(SECP_ADDRESS, ED25519_ACCOUNT_SET), now)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Verification(_)));

        let err = service
            .cancel_at(id, &request(ED25519_ADDRESS, ED25519_ACCOUNT_SET), now)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_payment_is_not_a_cancellation() {
        let (_, service, id) = setup(SECP_ADDRESS).await;
        let now = issued() + chrono::Duration::seconds(30);
        let err = service
            .cancel_at(id, &request(SECP_ADDRESS, SECP_PAYMENT), now)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("AccountSet"));
    }

    #[tokio::test]
    async fn test_minting_bridge_is_past_cancellation() {
        let (store, service, id) = setup(SECP_ADDRESS).await;
        store
            .update_bridge_if(id, &[BridgeStatus::Pending], &BridgePatch::status(BridgeStatus::Minting))
            .await
            .unwrap();

        let now = issued() + chrono::Duration::seconds(30);
        let err = service
            .cancel_at(id, &request(SECP_ADDRESS, SECP_ACCOUNT_SET), now)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::CancellationClosed { .. }));
        assert_eq!(err.current_status(), Some("minting"));
        assert!(err.to_string().contains("minting has started"));
        assert!(service.issue(id).await.is_err());
    }
}
