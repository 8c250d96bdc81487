//! Deposit bridge state machine
//!
//! ```text
//! pending → reserving_collateral | bridging → awaiting_payment
//!         → xrpl_confirmed → minting → completed
//! ```
//!
//! Every transition is a conditional update on the stored status; a step
//! that loses the update does nothing further. Creation returns before any
//! collateral is reserved, the worker drives `reserve` and `mint`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::amounts::{format_drops, minting_fee_drops, parse_xrp, round_to_lots, FeeBreakdown, LotRounding};
use crate::attestation::{check_attestation, AttestationProof, AttestationTicket, ProofOutcome, ProofService};
use crate::config::Config;
use crate::db::{ActivityKind, Bridge, BridgePatch, NewActivity, NewBridge, PositionCredit, Store};
use crate::error::{ClientError, Result, SettlementError};
use crate::evm::{CollateralClient, VaultClient};
use crate::metrics;
use crate::payment::{build_payment_request, payment_expectation, proof_expectation, PaymentRequest};
use crate::strategy::Strategies;
use crate::types::{BridgeStatus, SettlementKind};
use crate::vaults::VaultRegistry;
use crate::xrpl::address::{encode_classic_address, is_valid_classic_address};
use crate::xrpl::codec::{decode_signed_transaction_hex, TT_PAYMENT};
use crate::xrpl::{
    await_validation, find_payment, normalize_tx_hash, verify_payment, LedgerClient, ValidationOutcome,
};

/// Expired bridges moved per cleanup pass
const CLEANUP_BATCH: i64 = 500;
/// Recent wallet transactions scanned for an unreported payment
const PAYMENT_SCAN_LIMIT: u32 = 50;

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub ttl: chrono::Duration,
    pub confirm_attempts: u32,
    pub confirm_interval: Duration,
}

impl BridgeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ttl: chrono::Duration::seconds(config.bridge.ttl_secs as i64),
            confirm_attempts: config.xrpl.confirm_attempts,
            confirm_interval: config.xrpl.confirm_interval(),
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::minutes(30),
            confirm_attempts: 15,
            confirm_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBridgeRequest {
    pub wallet_address: String,
    pub vault_id: String,
    /// XRP decimal string
    pub amount: String,
    #[serde(default)]
    pub position_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedBridge {
    pub bridge_id: Uuid,
    pub rounded_amount: String,
    pub lot_rounding: LotRounding,
    pub status: BridgeStatus,
    pub settlement: SettlementKind,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeQuote {
    pub vault_id: String,
    pub settlement: SettlementKind,
    pub lot_rounding: LotRounding,
    pub agent_vault_address: Option<String>,
    pub fee_bps: u32,
    pub estimated_fee: String,
    pub estimated_total: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatusView {
    pub bridge_id: Uuid,
    pub status: BridgeStatus,
    pub wallet_address: String,
    pub vault_id: String,
    pub settlement: SettlementKind,
    pub requested_amount: String,
    pub rounded_amount: String,
    pub lots: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_request: Option<PaymentRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_breakdown: Option<FeeBreakdown>,
    pub agent_vault_address: Option<String>,
    pub agent_underlying_address: Option<String>,
    pub xrpl_tx_hash: Option<String>,
    pub mint_tx_hash: Option<String>,
    pub deposit_tx_hash: Option<String>,
    pub position_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub is_expired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BridgeStatusView {
    pub fn new(bridge: &Bridge, now: DateTime<Utc>) -> Self {
        let (payment_request, fee_breakdown) = match build_payment_request(bridge) {
            Some((request, fees)) => {
                let payable = bridge.status == BridgeStatus::AwaitingPayment;
                (payable.then_some(request), Some(fees))
            }
            None => (None, None),
        };

        Self {
            bridge_id: bridge.id,
            status: bridge.status,
            wallet_address: bridge.wallet_address.clone(),
            vault_id: bridge.vault_id.clone(),
            settlement: bridge.settlement,
            requested_amount: format_drops(bridge.requested_drops),
            rounded_amount: format_drops(bridge.rounded_drops),
            lots: bridge.lots,
            payment_request,
            fee_breakdown,
            agent_vault_address: bridge.agent_vault_address.clone(),
            agent_underlying_address: bridge.agent_underlying_address.clone(),
            xrpl_tx_hash: bridge.xrpl_tx_hash.clone(),
            mint_tx_hash: bridge.mint_tx_hash.clone(),
            deposit_tx_hash: bridge.deposit_tx_hash.clone(),
            position_id: bridge.position_id,
            expires_at: bridge.expires_at,
            is_expired: bridge.is_expired_at(now),
            error: bridge.error.clone(),
            retry_count: bridge.retry_count,
            created_at: bridge.created_at,
            updated_at: bridge.updated_at,
            completed_at: bridge.completed_at,
        }
    }
}

/// Result of one mint attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MintOutcome {
    #[serde(rename_all = "camelCase")]
    Completed { position_id: Uuid, shares: String },
    /// The attestation round has not finalized; the ticket is stored
    #[serde(rename_all = "camelCase")]
    AwaitingProof { voting_round: u64 },
    /// Another worker holds the bridge, or it already moved past this step
    Skipped { status: BridgeStatus },
}

/// FXRP a bridge releases into the vault when no mint receipt is at hand.
pub fn released_drops(bridge: &Bridge) -> u64 {
    bridge
        .reserved_base_drops
        .unwrap_or(bridge.expected_fxrp_drops)
}

pub struct BridgeService {
    store: Arc<dyn Store>,
    ledger: Arc<dyn LedgerClient>,
    collateral: Arc<dyn CollateralClient>,
    vault_client: Arc<dyn VaultClient>,
    proofs: Arc<ProofService>,
    strategies: Strategies,
    vaults: Arc<VaultRegistry>,
    settings: BridgeSettings,
}

impl BridgeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<dyn LedgerClient>,
        collateral: Arc<dyn CollateralClient>,
        vault_client: Arc<dyn VaultClient>,
        proofs: Arc<ProofService>,
        vaults: Arc<VaultRegistry>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            strategies: Strategies::new(collateral.clone()),
            store,
            ledger,
            collateral,
            vault_client,
            proofs,
            vaults,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn strategies(&self) -> &Strategies {
        &self.strategies
    }

    pub async fn get(&self, id: Uuid) -> Result<Bridge> {
        self.store
            .get_bridge(id)
            .await?
            .ok_or_else(|| SettlementError::not_found("bridge", id))
    }

    pub async fn status(&self, id: Uuid) -> Result<BridgeStatusView> {
        let bridge = self.get(id).await?;
        Ok(BridgeStatusView::new(&bridge, Utc::now()))
    }

    async fn lot_size(&self) -> Result<u64> {
        self.collateral.lot_size_drops().await.map_err(|e| {
            metrics::record_external_error("asset_manager");
            SettlementError::external("asset_manager", e)
        })
    }

    /// Lot rounding and current fee terms, without persisting anything.
    pub async fn quote(&self, vault_id: &str, amount: &str) -> Result<BridgeQuote> {
        let vault = self.vaults.require_available(vault_id)?;
        let requested = parse_xrp(amount)?;
        let rounding = round_to_lots(requested, self.lot_size().await?)?;

        let (agent_vault_address, fee_bps) = match vault.settlement {
            SettlementKind::AttestedMint => {
                let quote = self.collateral.quote(rounding.lots).await.map_err(|e| {
                    metrics::record_external_error("asset_manager");
                    SettlementError::external("asset_manager", e)
                })?;
                (Some(quote.agent_vault), quote.fee_bps)
            }
            SettlementKind::Escrow => (None, 0),
        };
        let fee = minting_fee_drops(rounding.rounded_drops, fee_bps);

        Ok(BridgeQuote {
            vault_id: vault.id.clone(),
            settlement: vault.settlement,
            agent_vault_address,
            fee_bps,
            estimated_fee: format_drops(fee),
            estimated_total: format_drops(rounding.rounded_drops.saturating_add(fee)),
            lot_rounding: rounding,
        })
    }

    /// Validate and persist a `pending` bridge. Collateral is reserved later
    /// by the worker.
    pub async fn create(&self, request: &CreateBridgeRequest) -> Result<CreatedBridge> {
        let wallet = request.wallet_address.trim();
        if !is_valid_classic_address(wallet) {
            return Err(SettlementError::validation("walletAddress is not a valid XRPL address"));
        }
        let vault = self.vaults.require_available(&request.vault_id)?;
        let requested = parse_xrp(&request.amount)?;
        let rounding = round_to_lots(requested, self.lot_size().await?)?;

        if let Some(position_id) = request.position_id {
            let position = self
                .store
                .get_position(position_id)
                .await?
                .ok_or_else(|| SettlementError::validation(format!("unknown position {}", position_id)))?;
            if position.wallet_address != wallet || position.vault_id != vault.id {
                return Err(SettlementError::validation(
                    "position does not belong to this wallet and vault",
                ));
            }
        }

        let now = Utc::now();
        let bridge = self
            .store
            .insert_bridge(&NewBridge {
                id: Uuid::new_v4(),
                wallet_address: wallet.to_string(),
                vault_id: vault.id.clone(),
                position_id: request.position_id,
                settlement: vault.settlement,
                requested_drops: rounding.requested_drops,
                rounded_drops: rounding.rounded_drops,
                lots: rounding.lots,
                expected_fxrp_drops: rounding.rounded_drops,
                expires_at: now + self.settings.ttl,
            })
            .await?;

        metrics::record_bridge_created(&vault.id);
        info!(
            bridge_id = %bridge.id,
            wallet = %bridge.wallet_address,
            vault_id = %bridge.vault_id,
            requested = %rounding.requested_amount,
            rounded = %rounding.rounded_amount,
            lots = rounding.lots,
            "Bridge created"
        );

        Ok(CreatedBridge {
            bridge_id: bridge.id,
            rounded_amount: rounding.rounded_amount.clone(),
            lot_rounding: rounding,
            status: bridge.status,
            settlement: bridge.settlement,
            expires_at: bridge.expires_at,
        })
    }

    /// Assign a payment route to a `pending` bridge. Any failure while the
    /// route is being assigned ends the bridge in `failed`.
    pub async fn reserve(&self, id: Uuid) -> Result<()> {
        let bridge = self.get(id).await?;
        if bridge.status != BridgeStatus::Pending {
            debug!(bridge_id = %id, status = %bridge.status, "Bridge is past reservation, skipping");
            return Ok(());
        }
        if bridge.is_expired_at(Utc::now()) {
            debug!(bridge_id = %id, "Bridge expired before reservation, leaving it to cleanup");
            return Ok(());
        }

        let strategy = self.strategies.for_kind(bridge.settlement);
        let routing = strategy.routing_status();
        let claimed = self
            .store
            .update_bridge_if(id, &[BridgeStatus::Pending], &BridgePatch::status(routing))
            .await?;
        if !claimed {
            metrics::record_claim_conflict("bridge", "reserve");
            info!(bridge_id = %id, "Bridge already claimed for reservation");
            return Ok(());
        }
        metrics::record_bridge_transition(routing.as_str());

        let assigned = match self.vaults.get(&bridge.vault_id) {
            Ok(vault) => strategy.assign_route(&bridge, vault).await,
            Err(e) => Err(e),
        };

        match assigned {
            Ok(route) => {
                let patch = BridgePatch {
                    status: Some(BridgeStatus::AwaitingPayment),
                    route: Some(route),
                    reserved_at: Some(Utc::now()),
                    clear_error: true,
                    ..Default::default()
                };
                if self.store.update_bridge_if(id, &[routing], &patch).await? {
                    metrics::record_bridge_transition(BridgeStatus::AwaitingPayment.as_str());
                    info!(bridge_id = %id, "Bridge awaiting payment");
                } else {
                    warn!(bridge_id = %id, "Bridge left {} while its route was assigned", routing);
                }
                Ok(())
            }
            Err(e) => {
                warn!(bridge_id = %id, error = %e, "Route assignment failed");
                let failed = BridgePatch::failed(format!("reservation failed: {}", e));
                if self.store.update_bridge_if(id, &[routing], &failed).await? {
                    metrics::record_bridge_transition(BridgeStatus::Failed.as_str());
                }
                Err(e)
            }
        }
    }

    /// Verify a ledger payment for an `awaiting_payment` bridge and move it
    /// to `xrpl_confirmed`. Repeating the call with the confirmed hash is a
    /// no-op.
    pub async fn confirm_payment(&self, id: Uuid, tx_hash: &str) -> Result<BridgeStatusView> {
        self.confirm_from(id, tx_hash, &[BridgeStatus::AwaitingPayment]).await
    }

    /// Operator override of `confirm_payment` that also accepts a payment
    /// landing after the bridge expired. The ledger checks are the same.
    pub async fn recover_payment(&self, id: Uuid, tx_hash: &str) -> Result<BridgeStatusView> {
        self.confirm_from(id, tx_hash, &[BridgeStatus::AwaitingPayment, BridgeStatus::Expired])
            .await
    }

    async fn confirm_from(
        &self,
        id: Uuid,
        tx_hash: &str,
        accepted: &[BridgeStatus],
    ) -> Result<BridgeStatusView> {
        let hash = normalize_tx_hash(tx_hash)?;
        let bridge = self.get(id).await?;

        match bridge.status {
            status if accepted.contains(&status) => {}
            BridgeStatus::XrplConfirmed | BridgeStatus::Minting | BridgeStatus::Completed
                if bridge.xrpl_tx_hash.as_deref() == Some(hash.as_str()) =>
            {
                debug!(bridge_id = %id, tx_hash = %hash, "Payment already confirmed");
                return Ok(BridgeStatusView::new(&bridge, Utc::now()));
            }
            other => {
                return Err(SettlementError::invalid_state(
                    format!("bridge is {} and not awaiting payment", other),
                    other,
                    &[BridgeStatus::AwaitingPayment.as_str()],
                ))
            }
        }

        self.verify_ledger_payment(&bridge, &hash).await?;

        let patch = BridgePatch {
            status: Some(BridgeStatus::XrplConfirmed),
            xrpl_tx_hash: Some(hash.clone()),
            xrpl_confirmed_at: Some(Utc::now()),
            clear_error: true,
            ..Default::default()
        };
        let advanced = self.store.update_bridge_if(id, accepted, &patch).await?;

        let current = self.get(id).await?;
        if !advanced && current.xrpl_tx_hash.as_deref() != Some(hash.as_str()) {
            return Err(SettlementError::invalid_state(
                "bridge changed state while the payment was being verified",
                current.status,
                &[BridgeStatus::AwaitingPayment.as_str()],
            ));
        }
        if advanced {
            metrics::record_bridge_transition(BridgeStatus::XrplConfirmed.as_str());
            info!(bridge_id = %id, tx_hash = %hash, "XRPL payment confirmed");
        }
        Ok(BridgeStatusView::new(&current, Utc::now()))
    }

    /// Wait for validation of `hash` and check it against the bridge route.
    pub async fn verify_ledger_payment(&self, bridge: &Bridge, hash: &str) -> Result<()> {
        let expectation = payment_expectation(bridge).ok_or_else(|| {
            SettlementError::invalid_state(
                "bridge has no payment route yet",
                bridge.status,
                &[BridgeStatus::AwaitingPayment.as_str()],
            )
        })?;

        let outcome = await_validation(
            self.ledger.as_ref(),
            hash,
            self.settings.confirm_attempts,
            self.settings.confirm_interval,
        )
        .await?;

        let tx = match outcome {
            ValidationOutcome::Validated(tx) => tx,
            ValidationOutcome::Failed(tx) => {
                return Err(SettlementError::verification(format!(
                    "ledger transaction failed with {}",
                    tx.result_code.unwrap_or_else(|| "unknown".to_string())
                )))
            }
            ValidationOutcome::ValidationTimeout => {
                return Err(SettlementError::Timeout(format!(
                    "transaction {} was not validated after {} attempts",
                    hash, self.settings.confirm_attempts
                )))
            }
        };

        verify_payment(&tx, &expectation)?;
        Ok(())
    }

    /// Submit a wallet-signed payment blob for the bridge, then confirm it.
    pub async fn submit_payment(&self, id: Uuid, signed_blob: &str) -> Result<BridgeStatusView> {
        let bridge = self.get(id).await?;
        if bridge.status != BridgeStatus::AwaitingPayment {
            return Err(SettlementError::invalid_state(
                format!("bridge is {} and not awaiting payment", bridge.status),
                bridge.status,
                &[BridgeStatus::AwaitingPayment.as_str()],
            ));
        }

        let decoded = decode_signed_transaction_hex(signed_blob)?;
        if decoded.transaction_type != TT_PAYMENT {
            return Err(SettlementError::verification("signed transaction is not a Payment"));
        }
        if encode_classic_address(&decoded.account) != bridge.wallet_address {
            return Err(SettlementError::verification(
                "payment is not signed by the bridge wallet",
            ));
        }
        let destination = decoded.destination.as_ref().map(encode_classic_address);
        if destination.as_deref() != bridge.agent_underlying_address.as_deref() {
            return Err(SettlementError::verification(
                "payment destination does not match the assigned route",
            ));
        }

        let submitted = self.ledger.submit(signed_blob).await.map_err(|e| {
            metrics::record_external_error("xrpl");
            SettlementError::external("xrpl", e)
        })?;
        if !submitted.accepted {
            return Err(SettlementError::external(
                "xrpl",
                ClientError::rejected(submitted.engine_result),
            ));
        }
        info!(bridge_id = %id, tx_hash = %decoded.hash, engine_result = %submitted.engine_result, "Payment submitted");

        self.confirm_payment(id, &decoded.hash).await
    }

    /// Obtain the payment proof (when the strategy needs one), claim the
    /// bridge for minting, release FXRP and deposit it.
    pub async fn mint(&self, id: Uuid) -> Result<MintOutcome> {
        let bridge = self.get(id).await?;
        match bridge.status {
            BridgeStatus::XrplConfirmed => {}
            BridgeStatus::Minting | BridgeStatus::Completed => {
                debug!(bridge_id = %id, status = %bridge.status, "Bridge is already minting");
                return Ok(MintOutcome::Skipped { status: bridge.status });
            }
            other => {
                return Err(SettlementError::invalid_state(
                    format!("bridge is {} and cannot be minted", other),
                    other,
                    &[BridgeStatus::XrplConfirmed.as_str()],
                ))
            }
        }

        let strategy = self.strategies.for_kind(bridge.settlement);
        let proof = if strategy.requires_proof() {
            match self.bridge_proof(&bridge).await? {
                Ok(proof) => Some(proof),
                Err(voting_round) => return Ok(MintOutcome::AwaitingProof { voting_round }),
            }
        } else {
            None
        };

        let claimed = self
            .store
            .update_bridge_if(id, &[BridgeStatus::XrplConfirmed], &BridgePatch::status(BridgeStatus::Minting))
            .await?;
        if !claimed {
            metrics::record_claim_conflict("bridge", "mint");
            info!(bridge_id = %id, "Bridge already claimed for minting");
            let current = self.get(id).await?;
            return Ok(MintOutcome::Skipped { status: current.status });
        }
        metrics::record_bridge_transition(BridgeStatus::Minting.as_str());

        match strategy.release(&bridge, proof.as_ref()).await {
            Ok(release) => {
                if release.mint_tx_hash.is_some() {
                    let patch = BridgePatch {
                        mint_tx_hash: release.mint_tx_hash.clone(),
                        ..Default::default()
                    };
                    self.store
                        .update_bridge_if(id, &[BridgeStatus::Minting], &patch)
                        .await?;
                }
                let bridge = self.get(id).await?;
                self.deposit_and_complete(&bridge, release.fxrp_drops).await
            }
            Err(e) => {
                // A rejected dry run means nothing happened on-chain. Any
                // other failure may have minted, so the bridge only goes
                // back once the reservation is seen to still exist.
                let unminted = match &e {
                    SettlementError::Verification(_) => true,
                    _ => matches!(strategy.release_settled(&bridge).await, Ok(false)),
                };
                warn!(bridge_id = %id, error = %e, unminted, "Release failed");

                let patch = if unminted {
                    BridgePatch {
                        status: Some(BridgeStatus::XrplConfirmed),
                        error: Some(format!("mint failed: {}", e)),
                        bump_retry: true,
                        discard_proof: matches!(e, SettlementError::Verification(_)),
                        ..Default::default()
                    }
                } else {
                    BridgePatch {
                        error: Some(format!("mint outcome unknown: {}", e)),
                        bump_retry: true,
                        ..Default::default()
                    }
                };
                if self
                    .store
                    .update_bridge_if(id, &[BridgeStatus::Minting], &patch)
                    .await?
                    && unminted
                {
                    metrics::record_bridge_transition(BridgeStatus::XrplConfirmed.as_str());
                }
                Err(e)
            }
        }
    }

    /// The checked proof for a confirmed bridge, or the voting round still
    /// being waited on.
    async fn bridge_proof(&self, bridge: &Bridge) -> Result<std::result::Result<AttestationProof, u64>> {
        let id = bridge.id;
        let expectation = proof_expectation(bridge).ok_or_else(|| {
            SettlementError::invalid_state(
                "bridge has no confirmed payment",
                bridge.status,
                &[BridgeStatus::XrplConfirmed.as_str()],
            )
        })?;
        let stored_proof = bridge
            .proof
            .as_deref()
            .map(AttestationProof::from_json)
            .transpose()?;
        let ticket = AttestationTicket::from_stored(
            bridge.attestation_round,
            bridge.attestation_request.as_deref(),
        );

        let store = self.store.clone();
        let obtained = self
            .proofs
            .obtain(ticket, stored_proof, &expectation.tx_hash, "bridge", move |ticket| async move {
                let patch = BridgePatch {
                    attestation_round: Some(ticket.voting_round),
                    attestation_request: Some(ticket.request_bytes),
                    ..Default::default()
                };
                store
                    .update_bridge_if(id, &[BridgeStatus::XrplConfirmed], &patch)
                    .await?;
                Ok::<(), SettlementError>(())
            })
            .await;

        let (proof, fresh) = match obtained {
            Ok(ProofOutcome::Ready { proof, fresh }) => (proof, fresh),
            Ok(ProofOutcome::NotFinalized(ticket)) => {
                let patch = BridgePatch {
                    error: Some(format!(
                        "attestation round {} not finalized yet",
                        ticket.voting_round
                    )),
                    ..Default::default()
                };
                self.store
                    .update_bridge_if(id, &[BridgeStatus::XrplConfirmed], &patch)
                    .await?;
                return Ok(Err(ticket.voting_round));
            }
            Err(e) => {
                let patch = BridgePatch {
                    error: Some(format!("attestation failed: {}", e)),
                    bump_retry: true,
                    ..Default::default()
                };
                self.store
                    .update_bridge_if(id, &[BridgeStatus::XrplConfirmed], &patch)
                    .await?;
                return Err(e);
            }
        };

        if let Err(e) = check_attestation(&proof, &expectation) {
            warn!(bridge_id = %id, error = %e, "Attestation does not match the bridge, discarding it");
            let patch = BridgePatch {
                error: Some(e.to_string()),
                discard_proof: true,
                bump_retry: true,
                ..Default::default()
            };
            self.store
                .update_bridge_if(id, &[BridgeStatus::XrplConfirmed], &patch)
                .await?;
            return Err(e);
        }

        if fresh {
            let patch = BridgePatch {
                proof: Some(proof.to_json()?),
                ..Default::default()
            };
            self.store
                .update_bridge_if(id, &[BridgeStatus::XrplConfirmed], &patch)
                .await?;
        }
        Ok(Ok(proof))
    }

    /// Deposit released FXRP into the vault and credit the position. The
    /// bridge must be in `minting`. A recorded deposit is never repeated.
    pub async fn deposit_and_complete(&self, bridge: &Bridge, fxrp_drops: u64) -> Result<MintOutcome> {
        let id = bridge.id;
        let vault = self.vaults.get(&bridge.vault_id)?;

        let (deposit_tx_hash, shares) = match (&bridge.deposit_tx_hash, bridge.shares_minted) {
            (Some(hash), Some(shares)) => {
                debug!(bridge_id = %id, tx_hash = %hash, "Vault deposit already recorded");
                (hash.clone(), shares)
            }
            _ => {
                let receipt = match self.vault_client.deposit(&vault.vault_address, fxrp_drops).await {
                    Ok(receipt) => receipt,
                    Err(e) => {
                        metrics::record_external_error("vault");
                        let err = SettlementError::external("vault", e);
                        let patch = BridgePatch {
                            error: Some(format!("vault deposit failed: {}", err)),
                            bump_retry: true,
                            ..Default::default()
                        };
                        self.store
                            .update_bridge_if(id, &[BridgeStatus::Minting], &patch)
                            .await?;
                        return Err(err);
                    }
                };
                let patch = BridgePatch {
                    deposit_tx_hash: Some(receipt.tx_hash.clone()),
                    shares_minted: Some(receipt.shares),
                    ..Default::default()
                };
                self.store
                    .update_bridge_if(id, &[BridgeStatus::Minting], &patch)
                    .await?;
                info!(bridge_id = %id, tx_hash = %receipt.tx_hash, shares = %receipt.shares, "FXRP deposited into vault");
                (receipt.tx_hash, receipt.shares)
            }
        };

        let credit = PositionCredit {
            position_id: bridge.position_id,
            wallet_address: bridge.wallet_address.clone(),
            vault_id: bridge.vault_id.clone(),
            shares,
        };
        let patch = BridgePatch {
            status: Some(BridgeStatus::Completed),
            completed_at: Some(Utc::now()),
            clear_error: true,
            ..Default::default()
        };

        let Some(position) = self
            .store
            .complete_bridge(id, &[BridgeStatus::Minting], &patch, &credit)
            .await?
        else {
            metrics::record_claim_conflict("bridge", "complete");
            let current = self.get(id).await?;
            return Ok(MintOutcome::Skipped { status: current.status });
        };

        self.store
            .insert_activity(&NewActivity {
                wallet_address: bridge.wallet_address.clone(),
                vault_id: bridge.vault_id.clone(),
                kind: ActivityKind::Deposit,
                amount_drops: fxrp_drops,
                shares,
                reference_id: id,
                tx_hash: Some(deposit_tx_hash),
            })
            .await?;

        metrics::record_bridge_transition(BridgeStatus::Completed.as_str());
        info!(bridge_id = %id, position_id = %position.id, shares = %shares, "Bridge completed");
        Ok(MintOutcome::Completed {
            position_id: position.id,
            shares: shares.to_string(),
        })
    }

    /// Look for the bridge's payment among the wallet's recent ledger
    /// transactions and confirm it when found. Covers clients that paid but
    /// never reported the hash.
    pub async fn detect_payment(&self, id: Uuid) -> Result<Option<BridgeStatusView>> {
        let bridge = self.get(id).await?;
        if bridge.status != BridgeStatus::AwaitingPayment {
            return Ok(None);
        }
        let Some(expectation) = payment_expectation(&bridge) else {
            return Ok(None);
        };
        let txs = self
            .ledger
            .account_payments(&bridge.wallet_address, PAYMENT_SCAN_LIMIT)
            .await
            .map_err(|e| {
                metrics::record_external_error("xrpl");
                SettlementError::external("xrpl", e)
            })?;
        let Some(found) = find_payment(&txs, &expectation) else {
            return Ok(None);
        };
        info!(bridge_id = %id, tx_hash = %found.hash, "Unreported payment found on the ledger");
        let hash = found.hash.clone();
        self.confirm_payment(id, &hash).await.map(Some)
    }

    /// Finish a bridge left in `minting` by an interrupted worker. The
    /// caller must know no other worker is still on it.
    pub async fn resume_minting(&self, id: Uuid) -> Result<MintOutcome> {
        let bridge = self.get(id).await?;
        if bridge.status != BridgeStatus::Minting {
            return Ok(MintOutcome::Skipped { status: bridge.status });
        }

        let released = match &bridge.mint_tx_hash {
            Some(hash) => {
                let succeeded = self
                    .collateral
                    .transaction_succeeded(hash)
                    .await
                    .map_err(|e| SettlementError::external("asset_manager", e))?;
                match succeeded {
                    Some(true) => true,
                    Some(false) => false,
                    None => {
                        return Err(SettlementError::Timeout(format!(
                            "mint transaction {} has no receipt yet",
                            hash
                        )))
                    }
                }
            }
            None => self
                .strategies
                .for_kind(bridge.settlement)
                .release_settled(&bridge)
                .await?,
        };

        if released {
            info!(bridge_id = %id, "Release already happened, resuming at the vault deposit");
            return self.deposit_and_complete(&bridge, released_drops(&bridge)).await;
        }

        let patch = BridgePatch {
            status: Some(BridgeStatus::XrplConfirmed),
            error: Some("mint interrupted before FXRP was released".to_string()),
            bump_retry: true,
            ..Default::default()
        };
        if self
            .store
            .update_bridge_if(id, &[BridgeStatus::Minting], &patch)
            .await?
        {
            metrics::record_bridge_transition(BridgeStatus::XrplConfirmed.as_str());
            warn!(bridge_id = %id, "Interrupted mint rolled back to xrpl_confirmed");
        }
        self.mint(id).await
    }

    /// Move `pending`/`awaiting_payment` bridges past their expiry to
    /// `expired`. Returns how many were moved.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired = self.store.list_expired_bridges(now, CLEANUP_BATCH).await?;
        let mut moved = 0;
        for bridge in expired {
            let patch = BridgePatch {
                status: Some(BridgeStatus::Expired),
                error: Some("payment window expired".to_string()),
                ..Default::default()
            };
            if self
                .store
                .update_bridge_if(bridge.id, &BridgeStatus::EXPIRABLE, &patch)
                .await?
            {
                metrics::record_bridge_transition(BridgeStatus::Expired.as_str());
                info!(bridge_id = %bridge.id, expires_at = %bridge.expires_at, "Bridge expired");
                moved += 1;
            }
        }
        Ok(moved)
    }
}
