//! Payment request builder
//!
//! Derives the XRPL payment a wallet must sign from the persisted route.
//! Nothing here is recomputed from the rounded request: amount and fee are
//! the reservation's own base and fee.

use serde::Serialize;
use serde_json::{json, Value};

use crate::amounts::{format_drops, FeeBreakdown};
use crate::attestation::ProofExpectation;
use crate::db::Bridge;
use crate::xrpl::PaymentExpectation;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub destination: String,
    /// XRP, six decimals
    pub amount: String,
    pub amount_drops: String,
    /// Payment reference as MemoData hex (no prefix, upper case)
    pub memo: Option<String>,
    /// Unsigned transaction ready for a wallet to autofill and sign
    pub tx_json: Value,
}

fn memo_hex(reference: &str) -> String {
    reference.trim_start_matches("0x").to_uppercase()
}

/// Payment instruction and fee terms for a routed bridge; `None` until a
/// route is assigned.
pub fn build_payment_request(bridge: &Bridge) -> Option<(PaymentRequest, FeeBreakdown)> {
    let route = bridge.route()?;
    let fees = FeeBreakdown::from_reservation(
        route.reserved_base_drops,
        route.reserved_fee_drops,
        route.fee_bps,
    );
    let memo = route.payment_reference.as_deref().map(memo_hex);

    let mut tx_json = json!({
        "TransactionType": "Payment",
        "Account": bridge.wallet_address,
        "Destination": route.agent_underlying_address,
        "Amount": fees.total_drops.to_string(),
    });
    if let Some(memo) = &memo {
        tx_json["Memos"] = json!([{ "Memo": { "MemoData": memo } }]);
    }

    let request = PaymentRequest {
        destination: route.agent_underlying_address,
        amount: format_drops(fees.total_drops),
        amount_drops: fees.total_drops.to_string(),
        memo,
        tx_json,
    };
    Some((request, fees))
}

/// What the user's payment must satisfy to confirm `bridge`.
pub fn payment_expectation(bridge: &Bridge) -> Option<PaymentExpectation> {
    let route = bridge.route()?;
    Some(PaymentExpectation {
        destination: route.agent_underlying_address,
        min_drops: route.reserved_base_drops.saturating_add(route.reserved_fee_drops),
        source: Some(bridge.wallet_address.clone()),
        payment_reference: route.payment_reference,
    })
}

/// What the attestation of the confirmed payment must carry.
pub fn proof_expectation(bridge: &Bridge) -> Option<ProofExpectation> {
    let route = bridge.route()?;
    Some(ProofExpectation {
        tx_hash: bridge.xrpl_tx_hash.clone()?,
        min_received_drops: route.reserved_base_drops.saturating_add(route.reserved_fee_drops),
        payment_reference: route.payment_reference,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, NewBridge, ReservedRoute, Store};
    use crate::types::SettlementKind;
    use chrono::Utc;
    use uuid::Uuid;

    async fn routed_bridge(route: Option<ReservedRoute>) -> Bridge {
        let store = MemoryStore::new();
        let bridge = store
            .insert_bridge(&NewBridge {
                id: Uuid::new_v4(),
                wallet_address: "rQrFNnvPGNNMqRcVRMbtBK3hpYaPzoa8K9".into(),
                vault_id: "fxrp-core".into(),
                position_id: None,
                settlement: SettlementKind::AttestedMint,
                requested_drops: 20_000_000,
                rounded_drops: 20_000_000,
                lots: 2,
                expected_fxrp_drops: 20_000_000,
                expires_at: Utc::now(),
            })
            .await
            .unwrap();
        let mut bridge = bridge;
        if let Some(route) = route {
            bridge.request_id = Some(route.request_id);
            bridge.agent_vault_address = Some(route.agent_vault_address);
            bridge.agent_underlying_address = Some(route.agent_underlying_address);
            bridge.payment_reference = route.payment_reference;
            bridge.reserved_base_drops = Some(route.reserved_base_drops);
            bridge.reserved_fee_drops = Some(route.reserved_fee_drops);
            bridge.fee_bps = Some(route.fee_bps);
        }
        bridge
    }

    fn route() -> ReservedRoute {
        ReservedRoute {
            request_id: "42".into(),
            agent_vault_address: "0x1111111111111111111111111111111111111111".into(),
            agent_underlying_address: "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh".into(),
            payment_reference: Some(format!("0x4642505266410001{:048x}", 42)),
            reserved_base_drops: 20_000_000,
            reserved_fee_drops: 50_000,
            fee_bps: 25,
        }
    }

    #[tokio::test]
    async fn test_no_request_before_reservation() {
        let bridge = routed_bridge(None).await;
        assert!(build_payment_request(&bridge).is_none());
        assert!(payment_expectation(&bridge).is_none());
    }

    #[tokio::test]
    async fn test_request_uses_reserved_amounts() {
        let bridge = routed_bridge(Some(route())).await;
        let (request, fees) = build_payment_request(&bridge).unwrap();

        assert_eq!(request.destination, "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh");
        assert_eq!(request.amount, "20.050000");
        assert_eq!(request.amount_drops, "20050000");
        assert_eq!(fees.base_drops + fees.fee_drops, fees.total_drops);
        assert!((fees.fee_percentage - 0.0025).abs() < 1e-12);

        let memo = request.memo.unwrap();
        assert!(!memo.starts_with("0X"));
        assert_eq!(memo.len(), 64);
        assert_eq!(request.tx_json["Amount"], "20050000");
        assert_eq!(request.tx_json["Memos"][0]["Memo"]["MemoData"], memo.as_str());
    }

    #[tokio::test]
    async fn test_expectation_binds_sender_and_reference() {
        let bridge = routed_bridge(Some(route())).await;
        let expected = payment_expectation(&bridge).unwrap();
        assert_eq!(expected.min_drops, 20_050_000);
        assert_eq!(expected.source.as_deref(), Some("rQrFNnvPGNNMqRcVRMbtBK3hpYaPzoa8K9"));
        assert_eq!(expected.payment_reference, route().payment_reference);
    }
}
