//! Settlement strategies
//!
//! One deposit state machine serves every vault. What differs per vault is
//! how a payment route is assigned and how FXRP is released once the XRP
//! payment is confirmed; the vault's `settlement` field picks the strategy.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::attestation::AttestationProof;
use crate::db::{Bridge, ReservedRoute};
use crate::error::{ClientError, Result, SettlementError};
use crate::evm::CollateralClient;
use crate::metrics;
use crate::types::{BridgeStatus, SettlementKind};
use crate::vaults::VaultConfig;

/// FXRP made available for the vault deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub fxrp_drops: u64,
    pub mint_tx_hash: Option<String>,
}

#[async_trait]
pub trait SettlementStrategy: Send + Sync {
    fn kind(&self) -> SettlementKind;

    /// Status held while the route is being assigned
    fn routing_status(&self) -> BridgeStatus;

    /// Whether release needs an attestation proof of the payment
    fn requires_proof(&self) -> bool;

    async fn assign_route(&self, bridge: &Bridge, vault: &VaultConfig) -> Result<ReservedRoute>;

    async fn release(&self, bridge: &Bridge, proof: Option<&AttestationProof>) -> Result<Release>;

    /// Whether an interrupted release already took effect. Only meaningful
    /// for a bridge left in `minting` without a recorded mint transaction.
    async fn release_settled(&self, bridge: &Bridge) -> Result<bool>;
}

fn collateral_error(e: ClientError) -> SettlementError {
    metrics::record_external_error("asset_manager");
    SettlementError::external("asset_manager", e)
}

fn reservation_id(bridge: &Bridge) -> Result<&str> {
    bridge.request_id.as_deref().ok_or_else(|| {
        SettlementError::invalid_state(
            "bridge has no collateral reservation",
            bridge.status,
            &[BridgeStatus::AwaitingPayment.as_str()],
        )
    })
}

// ============================================================================
// FAssets attested mint
// ============================================================================

/// Collateral reservation with an FAssets agent, minting against an FDC
/// payment proof.
pub struct AttestedMint {
    collateral: Arc<dyn CollateralClient>,
}

impl AttestedMint {
    pub fn new(collateral: Arc<dyn CollateralClient>) -> Self {
        Self { collateral }
    }
}

#[async_trait]
impl SettlementStrategy for AttestedMint {
    fn kind(&self) -> SettlementKind {
        SettlementKind::AttestedMint
    }

    fn routing_status(&self) -> BridgeStatus {
        BridgeStatus::ReservingCollateral
    }

    fn requires_proof(&self) -> bool {
        true
    }

    async fn assign_route(&self, bridge: &Bridge, _vault: &VaultConfig) -> Result<ReservedRoute> {
        let reservation = self
            .collateral
            .reserve_collateral(bridge.lots)
            .await
            .map_err(collateral_error)?;

        if reservation.value_uba != bridge.rounded_drops {
            // Lot size changed between quote and reservation; the
            // reservation amounts are what the agent will check
            warn!(
                bridge_id = %bridge.id,
                reserved = reservation.value_uba,
                rounded = bridge.rounded_drops,
                "Reserved value differs from rounded amount"
            );
        }

        info!(
            bridge_id = %bridge.id,
            reservation_id = %reservation.reservation_id,
            agent_vault = %reservation.agent_vault,
            fee_bps = reservation.fee_bps,
            "Collateral reserved"
        );

        Ok(ReservedRoute {
            request_id: reservation.reservation_id,
            agent_vault_address: reservation.agent_vault,
            agent_underlying_address: reservation.agent_underlying_address,
            payment_reference: Some(reservation.payment_reference),
            reserved_base_drops: reservation.value_uba,
            reserved_fee_drops: reservation.fee_uba,
            fee_bps: reservation.fee_bps,
        })
    }

    async fn release(&self, bridge: &Bridge, proof: Option<&AttestationProof>) -> Result<Release> {
        let proof = proof.ok_or_else(|| {
            SettlementError::verification("minting requires an attestation proof")
        })?;
        let reservation_id = reservation_id(bridge)?;

        // Dry run first so a stale or mismatched proof reports the
        // contract's reason instead of a bare revert
        match self
            .collateral
            .simulate_execute_minting(proof, reservation_id)
            .await
        {
            Ok(()) => {}
            Err(ClientError::Rejected { reason }) => {
                return Err(SettlementError::verification(format!(
                    "executeMinting would revert: {}",
                    reason
                )))
            }
            Err(e) => return Err(collateral_error(e)),
        }

        let receipt = self
            .collateral
            .execute_minting(proof, reservation_id)
            .await
            .map_err(collateral_error)?;

        info!(
            bridge_id = %bridge.id,
            tx_hash = %receipt.tx_hash,
            minted_uba = receipt.minted_uba,
            "FXRP minted"
        );
        Ok(Release {
            fxrp_drops: receipt.minted_uba,
            mint_tx_hash: Some(receipt.tx_hash),
        })
    }

    async fn release_settled(&self, bridge: &Bridge) -> Result<bool> {
        // executeMinting consumes the reservation
        let reservation = self
            .collateral
            .reservation(reservation_id(bridge)?)
            .await
            .map_err(collateral_error)?;
        Ok(reservation.is_none())
    }
}

// ============================================================================
// Escrow
// ============================================================================

/// Payment to the vault's own XRPL escrow account; FXRP for the deposit
/// comes from operator inventory, so no proof or mint is involved.
#[derive(Debug, Default)]
pub struct Escrow;

/// 32-byte memo binding an escrow payment to one bridge
pub fn escrow_payment_reference(bridge: &Bridge) -> String {
    format!("0x{:0>64}", hex::encode(bridge.id.as_bytes()))
}

#[async_trait]
impl SettlementStrategy for Escrow {
    fn kind(&self) -> SettlementKind {
        SettlementKind::Escrow
    }

    fn routing_status(&self) -> BridgeStatus {
        BridgeStatus::Bridging
    }

    fn requires_proof(&self) -> bool {
        false
    }

    async fn assign_route(&self, bridge: &Bridge, vault: &VaultConfig) -> Result<ReservedRoute> {
        let escrow_address = vault.escrow_address.clone().ok_or_else(|| {
            SettlementError::validation(format!("vault {} has no escrow address", vault.id))
        })?;

        Ok(ReservedRoute {
            request_id: bridge.id.to_string(),
            agent_vault_address: vault.vault_address.clone(),
            agent_underlying_address: escrow_address,
            payment_reference: Some(escrow_payment_reference(bridge)),
            reserved_base_drops: bridge.rounded_drops,
            reserved_fee_drops: 0,
            fee_bps: 0,
        })
    }

    async fn release(&self, bridge: &Bridge, _proof: Option<&AttestationProof>) -> Result<Release> {
        Ok(Release {
            fxrp_drops: bridge.reserved_base_drops.unwrap_or(bridge.rounded_drops),
            mint_tx_hash: None,
        })
    }

    async fn release_settled(&self, _bridge: &Bridge) -> Result<bool> {
        Ok(true)
    }
}

/// Strategy per settlement kind.
#[derive(Clone)]
pub struct Strategies {
    attested_mint: Arc<dyn SettlementStrategy>,
    escrow: Arc<dyn SettlementStrategy>,
}

impl Strategies {
    pub fn new(collateral: Arc<dyn CollateralClient>) -> Self {
        Self {
            attested_mint: Arc::new(AttestedMint::new(collateral)),
            escrow: Arc::new(Escrow),
        }
    }

    pub fn for_kind(&self, kind: SettlementKind) -> Arc<dyn SettlementStrategy> {
        match kind {
            SettlementKind::AttestedMint => self.attested_mint.clone(),
            SettlementKind::Escrow => self.escrow.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_proof, FakeCollateral, AGENT_ADDRESS};
    use chrono::Utc;
    use uuid::Uuid;

    const LOT: u64 = 10_000_000;

    fn bridge(settlement: SettlementKind) -> Bridge {
        let now = Utc::now();
        Bridge {
            id: Uuid::new_v4(),
            request_id: None,
            wallet_address: "rQrFNnvPGNNMqRcVRMbtBK3hpYaPzoa8K9".into(),
            vault_id: "fxrp-core".into(),
            position_id: None,
            settlement,
            requested_drops: 12_300_000,
            rounded_drops: LOT,
            lots: 1,
            expected_fxrp_drops: LOT,
            reserved_base_drops: None,
            reserved_fee_drops: None,
            fee_bps: None,
            agent_vault_address: None,
            agent_underlying_address: None,
            payment_reference: None,
            xrpl_tx_hash: None,
            mint_tx_hash: None,
            deposit_tx_hash: None,
            attestation_round: None,
            attestation_request: None,
            proof: None,
            shares_minted: None,
            status: BridgeStatus::Pending,
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            reserved_at: None,
            xrpl_confirmed_at: None,
            completed_at: None,
            cancelled_at: None,
            expires_at: now,
        }
    }

    fn vault(settlement: SettlementKind) -> VaultConfig {
        VaultConfig {
            id: "fxrp-core".into(),
            name: "FXRP Core".into(),
            vault_address: format!("0x{}", "ab".repeat(20)),
            settlement,
            escrow_address: Some("rB6wx8967rBa1GGQmeChv5EhQbc6Q444jT".into()),
            available: true,
        }
    }

    fn with_route(mut bridge: Bridge, route: &ReservedRoute) -> Bridge {
        bridge.request_id = Some(route.request_id.clone());
        bridge.agent_vault_address = Some(route.agent_vault_address.clone());
        bridge.agent_underlying_address = Some(route.agent_underlying_address.clone());
        bridge.payment_reference = route.payment_reference.clone();
        bridge.reserved_base_drops = Some(route.reserved_base_drops);
        bridge.reserved_fee_drops = Some(route.reserved_fee_drops);
        bridge.fee_bps = Some(route.fee_bps);
        bridge
    }

    #[tokio::test]
    async fn test_attested_mint_route_comes_from_reservation() {
        let collateral = Arc::new(FakeCollateral::new(LOT));
        let strategy = AttestedMint::new(collateral.clone());
        let route = strategy
            .assign_route(&bridge(SettlementKind::AttestedMint), &vault(SettlementKind::AttestedMint))
            .await
            .unwrap();

        assert_eq!(route.agent_underlying_address, AGENT_ADDRESS);
        assert_eq!(route.reserved_base_drops, LOT);
        assert_eq!(route.reserved_fee_drops, 25_000);
        assert_eq!(route.fee_bps, 25);
        assert!(route.payment_reference.unwrap().starts_with("0x4642505266410001"));
    }

    #[tokio::test]
    async fn test_attested_mint_surfaces_simulated_revert() {
        let collateral = Arc::new(FakeCollateral::new(LOT));
        let strategy = AttestedMint::new(collateral.clone());
        let b = bridge(SettlementKind::AttestedMint);
        let route = strategy.assign_route(&b, &vault(SettlementKind::AttestedMint)).await.unwrap();
        let b = with_route(b, &route);
        let proof = sample_proof(&"AB".repeat(32), LOT, None, 100);

        collateral
            .script
            .fail("simulate_mint", ClientError::rejected("invalid payment reference"));
        let err = strategy.release(&b, Some(&proof)).await.unwrap_err();
        assert!(matches!(err, SettlementError::Verification(ref m) if m.contains("invalid payment reference")));
        assert_eq!(collateral.script.calls("mint"), 0);

        collateral.script.clear("simulate_mint");
        let release = strategy.release(&b, Some(&proof)).await.unwrap();
        assert_eq!(release.fxrp_drops, LOT);
        assert!(release.mint_tx_hash.is_some());
        assert!(strategy.release_settled(&b).await.unwrap());
    }

    #[tokio::test]
    async fn test_attested_mint_requires_proof() {
        let strategy = AttestedMint::new(Arc::new(FakeCollateral::new(LOT)));
        let err = strategy
            .release(&bridge(SettlementKind::AttestedMint), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Verification(_)));
    }

    #[tokio::test]
    async fn test_escrow_routes_to_vault_escrow_without_fee() {
        let b = bridge(SettlementKind::Escrow);
        let route = Escrow.assign_route(&b, &vault(SettlementKind::Escrow)).await.unwrap();

        assert_eq!(route.agent_underlying_address, "rB6wx8967rBa1GGQmeChv5EhQbc6Q444jT");
        assert_eq!(route.reserved_fee_drops, 0);
        assert_eq!(route.request_id, b.id.to_string());
        assert_eq!(route.payment_reference.as_ref().unwrap().len(), 66);

        let release = Escrow.release(&with_route(b, &route), None).await.unwrap();
        assert_eq!(release.fxrp_drops, LOT);
        assert_eq!(release.mint_tx_hash, None);
    }

    #[test]
    fn test_routing_status_per_kind() {
        let strategies = Strategies::new(Arc::new(FakeCollateral::new(LOT)));
        assert_eq!(
            strategies.for_kind(SettlementKind::AttestedMint).routing_status(),
            BridgeStatus::ReservingCollateral
        );
        assert_eq!(
            strategies.for_kind(SettlementKind::Escrow).routing_status(),
            BridgeStatus::Bridging
        );
    }
}
