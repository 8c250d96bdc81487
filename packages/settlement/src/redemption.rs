//! Redemption state machine
//!
//! ```text
//! pending → redeeming_shares → redeemed_fxrp → redeeming_fxrp
//!         → awaiting_proof → xrpl_payout → xrpl_received → completed
//! ```
//!
//! `pending → redeeming_shares` is the claim that guards the share burn:
//! only the caller whose conditional update lands goes on to redeem. The
//! position is debited in the same store operation that records the vault
//! redemption, so a failed vault call leaves it intact.
//!
//! The user-facing status turns `completed` as soon as the XRP payout is
//! validated on the ledger. Confirming the payout on-chain is tracked
//! separately through `backend_status`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::amounts::format_drops;
use crate::attestation::{check_attestation, AttestationProof, AttestationTicket, ProofExpectation, ProofOutcome, ProofService};
use crate::config::Config;
use crate::db::{
    ActivityKind, NewActivity, NewRedemption, Redemption, RedemptionPatch, RedemptionTicketFields, Store,
};
use crate::error::{ClientError, Result, SettlementError};
use crate::evm::{CollateralClient, VaultClient};
use crate::metrics;
use crate::types::{BackendStatus, RedemptionStatus, UserStatus};
use crate::vaults::VaultRegistry;
use crate::xrpl::address::is_valid_classic_address;
use crate::xrpl::{
    await_validation, find_payment, normalize_tx_hash, verify_payment, LedgerClient, PaymentExpectation,
    ValidationOutcome,
};

#[derive(Debug, Clone)]
pub struct RedemptionSettings {
    pub confirm_attempts: u32,
    pub confirm_interval: Duration,
    /// Recent wallet transactions scanned for the agent's payout
    pub payout_scan_limit: u32,
}

impl RedemptionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confirm_attempts: config.xrpl.confirm_attempts,
            confirm_interval: config.xrpl.confirm_interval(),
            payout_scan_limit: 50,
        }
    }
}

impl Default for RedemptionSettings {
    fn default() -> Self {
        Self {
            confirm_attempts: 15,
            confirm_interval: Duration::from_secs(2),
            payout_scan_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRedemptionRequest {
    pub position_id: Uuid,
    /// Vault shares, integer string in the share token's base units
    pub share_amount: String,
    pub user_address: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRedemption {
    pub redemption_id: Uuid,
    pub status: RedemptionStatus,
    pub shares: String,
    /// FXRP the shares are worth right now
    pub estimated_fxrp: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionStatusView {
    pub redemption_id: Uuid,
    pub status: RedemptionStatus,
    pub user_status: UserStatus,
    pub backend_status: Option<BackendStatus>,
    pub current_step: &'static str,
    /// XRP paid out (or expected), else FXRP received from the vault
    pub amount: Option<String>,
    pub shares: String,
    pub wallet_address: String,
    pub vault_id: String,
    pub redemption_request_id: Option<u64>,
    pub payment_deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xrpl_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Redemption> for RedemptionStatusView {
    fn from(r: &Redemption) -> Self {
        Self {
            redemption_id: r.id,
            status: r.status,
            user_status: r.user_status,
            backend_status: r.backend_status,
            current_step: r.status.current_step(),
            amount: r.xrp_sent_drops.or(r.fxrp_received_drops).map(format_drops),
            shares: r.shares.to_string(),
            wallet_address: r.wallet_address.clone(),
            vault_id: r.vault_id.clone(),
            redemption_request_id: r.redemption_request_id,
            payment_deadline: r.payment_deadline,
            xrpl_tx_hash: r.xrpl_payout_tx_hash.clone(),
            error: r.last_error.clone(),
            retry_count: r.retry_count,
            created_at: r.created_at,
            updated_at: r.updated_at,
            completed_at: r.completed_at,
        }
    }
}

/// What the agent's XRP payout must look like.
pub fn payout_expectation(r: &Redemption) -> Option<PaymentExpectation> {
    Some(PaymentExpectation {
        destination: r.wallet_address.clone(),
        min_drops: r.xrp_sent_drops?,
        source: None,
        payment_reference: Some(r.payment_reference.clone()?),
    })
}

fn parse_shares(raw: &str) -> Result<u128> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SettlementError::validation("shareAmount must be a positive integer"));
    }
    let shares: u128 = trimmed
        .parse()
        .map_err(|_| SettlementError::validation("shareAmount is too large"))?;
    if shares == 0 {
        return Err(SettlementError::validation("shareAmount must be a positive integer"));
    }
    Ok(shares)
}

fn external(service: &'static str, e: ClientError) -> SettlementError {
    metrics::record_external_error(service);
    SettlementError::external(service, e)
}

pub struct RedemptionService {
    store: Arc<dyn Store>,
    ledger: Arc<dyn LedgerClient>,
    collateral: Arc<dyn CollateralClient>,
    vault_client: Arc<dyn VaultClient>,
    proofs: Arc<ProofService>,
    vaults: Arc<VaultRegistry>,
    settings: RedemptionSettings,
}

impl RedemptionService {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<dyn LedgerClient>,
        collateral: Arc<dyn CollateralClient>,
        vault_client: Arc<dyn VaultClient>,
        proofs: Arc<ProofService>,
        vaults: Arc<VaultRegistry>,
        settings: RedemptionSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            collateral,
            vault_client,
            proofs,
            vaults,
            settings,
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Redemption> {
        self.store
            .get_redemption(id)
            .await?
            .ok_or_else(|| SettlementError::not_found("redemption", id))
    }

    pub async fn status(&self, id: Uuid) -> Result<RedemptionStatusView> {
        Ok(RedemptionStatusView::from(&self.get(id).await?))
    }

    /// Validate ownership and share balance, then persist `pending`.
    pub async fn create(&self, request: &CreateRedemptionRequest) -> Result<CreatedRedemption> {
        let wallet = request.user_address.trim();
        if !is_valid_classic_address(wallet) {
            return Err(SettlementError::validation("userAddress is not a valid XRPL address"));
        }
        let shares = parse_shares(&request.share_amount)?;

        let position = self
            .store
            .get_position(request.position_id)
            .await?
            .ok_or_else(|| {
                SettlementError::validation(format!("unknown position {}", request.position_id))
            })?;
        if position.wallet_address != wallet {
            return Err(SettlementError::validation("position does not belong to this wallet"));
        }
        let vault = self.vaults.get(&position.vault_id)?;

        let estimated = self
            .vault_client
            .preview_redeem(&vault.vault_address, shares)
            .await
            .map_err(|e| external("vault", e))?;
        let lot_size = self
            .collateral
            .lot_size_drops()
            .await
            .map_err(|e| external("asset_manager", e))?;
        if estimated < lot_size {
            return Err(SettlementError::validation(format!(
                "shares are worth {} FXRP, below the minimum redemption of one lot ({} FXRP)",
                format_drops(estimated),
                format_drops(lot_size)
            )));
        }

        let redemption = self
            .store
            .insert_redemption(&NewRedemption {
                id: Uuid::new_v4(),
                position_id: position.id,
                wallet_address: wallet.to_string(),
                vault_id: position.vault_id.clone(),
                shares,
            })
            .await?;

        metrics::record_redemption_created();
        info!(
            redemption_id = %redemption.id,
            position_id = %position.id,
            shares = %shares,
            estimated_fxrp = estimated,
            "Redemption created"
        );

        Ok(CreatedRedemption {
            redemption_id: redemption.id,
            status: redemption.status,
            shares: shares.to_string(),
            estimated_fxrp: format_drops(estimated),
        })
    }

    /// Drive the redemption as far as it can go right now. Safe to call
    /// concurrently and repeatedly: every step starts with a claim on the
    /// stored status. Returns the status it stopped at.
    pub async fn process(&self, id: Uuid) -> Result<RedemptionStatus> {
        loop {
            let r = self.get(id).await?;
            let advanced = match r.status {
                RedemptionStatus::Pending => self.redeem_shares(&r).await?,
                RedemptionStatus::RedeemedFxrp => self.request_redemption(&r).await?,
                RedemptionStatus::AwaitingProof => self.detect_payout(&r).await?,
                RedemptionStatus::XrplPayout => self.verify_payout(&r).await?,
                RedemptionStatus::XrplReceived => self.confirm_payout(&r).await?,
                RedemptionStatus::RedeemingShares
                | RedemptionStatus::RedeemingFxrp
                | RedemptionStatus::Completed
                | RedemptionStatus::Failed => false,
            };
            if !advanced {
                return Ok(self.get(id).await?.status);
            }
        }
    }

    async fn redeem_shares(&self, r: &Redemption) -> Result<bool> {
        let id = r.id;
        let claimed = self
            .store
            .update_redemption_if(
                id,
                &[RedemptionStatus::Pending],
                &RedemptionPatch::status(RedemptionStatus::RedeemingShares),
            )
            .await?;
        if !claimed {
            metrics::record_claim_conflict("redemption", "redeem_shares");
            info!(redemption_id = %id, "Redemption already claimed");
            return Ok(false);
        }
        metrics::record_redemption_transition(RedemptionStatus::RedeemingShares.as_str());

        let redeemed = match self.vaults.get(&r.vault_id) {
            Ok(vault) => self
                .vault_client
                .redeem(&vault.vault_address, r.shares)
                .await
                .map_err(|e| external("vault", e)),
            Err(e) => Err(e),
        };

        let receipt = match redeemed {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(redemption_id = %id, error = %e, "Vault redeem failed, position untouched");
                self.fail(id, RedemptionStatus::RedeemingShares, format!("vault redeem failed: {}", e), None)
                    .await?;
                return Err(e);
            }
        };

        let patch = RedemptionPatch {
            status: Some(RedemptionStatus::RedeemedFxrp),
            fxrp_received_drops: Some(receipt.assets),
            vault_redeem_tx_hash: Some(receipt.tx_hash.clone()),
            shares_redeemed_at: Some(Utc::now()),
            ..Default::default()
        };
        let recorded = self
            .store
            .record_shares_redeemed(id, &patch, r.position_id, r.shares)
            .await?;
        if !recorded {
            warn!(redemption_id = %id, tx_hash = %receipt.tx_hash, "Redemption moved while shares were redeemed");
            return Ok(false);
        }

        metrics::record_redemption_transition(RedemptionStatus::RedeemedFxrp.as_str());
        info!(
            redemption_id = %id,
            tx_hash = %receipt.tx_hash,
            fxrp = %format_drops(receipt.assets),
            "Vault shares redeemed"
        );
        Ok(true)
    }

    async fn request_redemption(&self, r: &Redemption) -> Result<bool> {
        let id = r.id;
        let claimed = self
            .store
            .update_redemption_if(
                id,
                &[RedemptionStatus::RedeemedFxrp],
                &RedemptionPatch::status(RedemptionStatus::RedeemingFxrp),
            )
            .await?;
        if !claimed {
            metrics::record_claim_conflict("redemption", "redeem_fxrp");
            info!(redemption_id = %id, "Redemption request already claimed");
            return Ok(false);
        }
        metrics::record_redemption_transition(RedemptionStatus::RedeemingFxrp.as_str());

        let fxrp = r.fxrp_received_drops.unwrap_or_default();
        let requested = async {
            let lot_size = self
                .collateral
                .lot_size_drops()
                .await
                .map_err(|e| external("asset_manager", e))?;
            let lots = if lot_size == 0 { 0 } else { fxrp / lot_size };
            if lots == 0 {
                return Err(SettlementError::validation(format!(
                    "{} FXRP is below one lot",
                    format_drops(fxrp)
                )));
            }
            if fxrp % lot_size != 0 {
                debug!(redemption_id = %id, remainder = fxrp % lot_size, "FXRP below one lot stays with the operator");
            }
            let ticket = self
                .collateral
                .request_redemption(lots, &r.wallet_address)
                .await
                .map_err(|e| external("asset_manager", e))?;
            Ok((lots, ticket))
        }
        .await;

        let (lots, ticket) = match requested {
            Ok(done) => done,
            Err(e) => {
                warn!(redemption_id = %id, error = %e, "FXRP redemption request failed");
                let message = format!("FXRP redemption request failed: {}", e);
                self.fail(id, RedemptionStatus::RedeemingFxrp, message.clone(), Some(message))
                    .await?;
                return Err(e);
            }
        };

        // Position and activity history are only touched at completion, so
        // a stalled payout never shows up as a finished withdrawal
        let patch = RedemptionPatch {
            status: Some(RedemptionStatus::AwaitingProof),
            ticket: Some(RedemptionTicketFields {
                request_id: ticket.request_id,
                tx_hash: ticket.tx_hash.clone(),
                lots,
                xrp_expected_drops: ticket.expected_payout_drops(),
                payment_reference: ticket.payment_reference.clone(),
                agent_vault_address: ticket.agent_vault.clone(),
                payment_deadline: DateTime::from_timestamp(ticket.last_underlying_timestamp as i64, 0),
            }),
            redemption_requested_at: Some(Utc::now()),
            ..Default::default()
        };
        if !self
            .store
            .update_redemption_if(id, &[RedemptionStatus::RedeemingFxrp], &patch)
            .await?
        {
            warn!(redemption_id = %id, request_id = ticket.request_id, "Redemption moved while the request was made");
            return Ok(false);
        }

        metrics::record_redemption_transition(RedemptionStatus::AwaitingProof.as_str());
        info!(
            redemption_id = %id,
            request_id = ticket.request_id,
            agent_vault = %ticket.agent_vault,
            expected_xrp = %format_drops(ticket.expected_payout_drops()),
            "FXRP redemption requested, awaiting XRP payout"
        );
        Ok(true)
    }

    /// Look for the agent's payout among the wallet's recent transactions.
    async fn detect_payout(&self, r: &Redemption) -> Result<bool> {
        let Some(expectation) = payout_expectation(r) else {
            return Ok(false);
        };
        let txs = match self
            .ledger
            .account_payments(&r.wallet_address, self.settings.payout_scan_limit)
            .await
        {
            Ok(txs) => txs,
            Err(e) => {
                metrics::record_external_error("xrpl");
                warn!(redemption_id = %r.id, error = %e, "Payout scan failed");
                return Ok(false);
            }
        };

        let Some(payout) = find_payment(&txs, &expectation) else {
            debug!(redemption_id = %r.id, "No payout observed yet");
            return Ok(false);
        };
        info!(redemption_id = %r.id, tx_hash = %payout.hash, "Agent payout observed");
        self.mark_payout(r.id, &payout.hash).await
    }

    async fn mark_payout(&self, id: Uuid, hash: &str) -> Result<bool> {
        let patch = RedemptionPatch {
            status: Some(RedemptionStatus::XrplPayout),
            xrpl_payout_tx_hash: Some(hash.to_string()),
            ..Default::default()
        };
        let moved = self
            .store
            .update_redemption_if(
                id,
                &[RedemptionStatus::AwaitingProof, RedemptionStatus::XrplPayout],
                &patch,
            )
            .await?;
        if moved {
            metrics::record_redemption_transition(RedemptionStatus::XrplPayout.as_str());
        }
        Ok(moved)
    }

    /// Record a payout hash supplied by the client or an operator, then
    /// verify and confirm it like an observed one.
    pub async fn record_payout(&self, id: Uuid, tx_hash: &str) -> Result<RedemptionStatusView> {
        let hash = normalize_tx_hash(tx_hash)?;
        let r = self.get(id).await?;
        match r.status {
            RedemptionStatus::AwaitingProof | RedemptionStatus::XrplPayout => {}
            RedemptionStatus::XrplReceived | RedemptionStatus::Completed
                if r.xrpl_payout_tx_hash.as_deref() == Some(hash.as_str()) =>
            {
                self.process(id).await?;
                return self.status(id).await;
            }
            other => {
                return Err(SettlementError::invalid_state(
                    format!("redemption is {} and not awaiting a payout", other),
                    other,
                    &[
                        RedemptionStatus::AwaitingProof.as_str(),
                        RedemptionStatus::XrplPayout.as_str(),
                    ],
                ))
            }
        }

        if !self.mark_payout(id, &hash).await? {
            let current = self.get(id).await?;
            return Err(SettlementError::invalid_state(
                "redemption changed state while the payout was recorded",
                current.status,
                &[RedemptionStatus::AwaitingProof.as_str()],
            ));
        }
        let current = self.get(id).await?;
        self.verify_payout(&current).await?;
        self.process(id).await?;
        self.status(id).await
    }

    async fn verify_payout(&self, r: &Redemption) -> Result<bool> {
        let id = r.id;
        let hash = r.xrpl_payout_tx_hash.clone().unwrap_or_default();
        let expectation = payout_expectation(r).ok_or_else(|| {
            SettlementError::invalid_state(
                "redemption has no redemption request",
                r.status,
                &[RedemptionStatus::AwaitingProof.as_str()],
            )
        })?;

        let outcome = await_validation(
            self.ledger.as_ref(),
            &hash,
            self.settings.confirm_attempts,
            self.settings.confirm_interval,
        )
        .await?;

        let checked = match outcome {
            ValidationOutcome::Validated(tx) => verify_payment(&tx, &expectation)
                .map(|()| tx)
                .map_err(SettlementError::from),
            ValidationOutcome::Failed(tx) => Err(SettlementError::verification(format!(
                "payout transaction failed with {}",
                tx.result_code.unwrap_or_else(|| "unknown".to_string())
            ))),
            ValidationOutcome::ValidationTimeout => {
                return Err(SettlementError::Timeout(format!(
                    "payout {} was not validated after {} attempts",
                    hash, self.settings.confirm_attempts
                )))
            }
        };

        let tx = match checked {
            Ok(tx) => tx,
            Err(e) => {
                // Wrong hash: go back to waiting for the real payout
                warn!(redemption_id = %id, tx_hash = %hash, error = %e, "Payout rejected");
                let patch = RedemptionPatch {
                    status: Some(RedemptionStatus::AwaitingProof),
                    backend_error: Some(format!("payout {} rejected: {}", hash, e)),
                    ..Default::default()
                };
                self.store
                    .update_redemption_if(id, &[RedemptionStatus::XrplPayout], &patch)
                    .await?;
                return Err(e);
            }
        };

        let patch = RedemptionPatch {
            status: Some(RedemptionStatus::XrplReceived),
            user_status: Some(UserStatus::Completed),
            backend_status: Some(BackendStatus::Confirming),
            xrp_sent_drops: tx.received_drops(),
            xrpl_payout_at: Some(Utc::now()),
            clear_errors: true,
            ..Default::default()
        };
        if !self
            .store
            .update_redemption_if(id, &[RedemptionStatus::XrplPayout], &patch)
            .await?
        {
            return Ok(false);
        }

        metrics::record_redemption_transition(RedemptionStatus::XrplReceived.as_str());
        info!(
            redemption_id = %id,
            tx_hash = %hash,
            xrp = %format_drops(tx.received_drops().unwrap_or_default()),
            "XRP payout validated"
        );
        Ok(true)
    }

    /// Prove the payout to the collateral system. Failures only touch the
    /// backend status; the user already has their XRP.
    async fn confirm_payout(&self, r: &Redemption) -> Result<bool> {
        let id = r.id;
        let request_id = r.redemption_request_id.ok_or_else(|| {
            SettlementError::invalid_state(
                "redemption has no redemption request id",
                r.status,
                &[RedemptionStatus::AwaitingProof.as_str()],
            )
        })?;
        let expectation = ProofExpectation {
            tx_hash: r.xrpl_payout_tx_hash.clone().unwrap_or_default(),
            min_received_drops: r.xrp_sent_drops.unwrap_or_default(),
            payment_reference: r.payment_reference.clone(),
        };

        let Some(proof) = self.redemption_proof(r, &expectation).await? else {
            return Ok(false);
        };

        let confirmed = async {
            match self.collateral.simulate_confirm_redemption(&proof, request_id).await {
                Ok(()) => {}
                Err(ClientError::Rejected { reason }) => {
                    return Err(SettlementError::verification(format!(
                        "confirmRedemptionPayment would revert: {}",
                        reason
                    )))
                }
                Err(e) => return Err(external("asset_manager", e)),
            }
            self.collateral
                .confirm_redemption_payment(&proof, request_id)
                .await
                .map_err(|e| external("asset_manager", e))
        }
        .await;

        let confirm_tx_hash = match confirmed {
            Ok(hash) => hash,
            Err(e) => {
                self.backend_failed(id, format!("payout confirmation failed: {}", e))
                    .await?;
                return Err(e);
            }
        };

        let patch = RedemptionPatch {
            status: Some(RedemptionStatus::Completed),
            user_status: Some(UserStatus::Completed),
            backend_status: Some(BackendStatus::Confirmed),
            confirm_tx_hash: Some(confirm_tx_hash.clone()),
            completed_at: Some(Utc::now()),
            clear_errors: true,
            ..Default::default()
        };
        if !self
            .store
            .update_redemption_if(id, &[RedemptionStatus::XrplReceived], &patch)
            .await?
        {
            return Ok(false);
        }

        self.store
            .insert_activity(&NewActivity {
                wallet_address: r.wallet_address.clone(),
                vault_id: r.vault_id.clone(),
                kind: ActivityKind::Withdrawal,
                amount_drops: r.xrp_sent_drops.unwrap_or_default(),
                shares: r.shares,
                reference_id: id,
                tx_hash: r.xrpl_payout_tx_hash.clone(),
            })
            .await?;

        metrics::record_redemption_transition(RedemptionStatus::Completed.as_str());
        info!(redemption_id = %id, request_id, tx_hash = %confirm_tx_hash, "Redemption completed");
        Ok(true)
    }

    async fn redemption_proof(
        &self,
        r: &Redemption,
        expectation: &ProofExpectation,
    ) -> Result<Option<AttestationProof>> {
        let id = r.id;
        let stored = r
            .proof
            .as_deref()
            .map(AttestationProof::from_json)
            .transpose()?;
        let ticket = AttestationTicket::from_stored(r.attestation_round, r.attestation_request.as_deref());

        let store = self.store.clone();
        let obtained = self
            .proofs
            .obtain(ticket, stored, &expectation.tx_hash, "redemption", move |ticket| async move {
                let patch = RedemptionPatch {
                    attestation_round: Some(ticket.voting_round),
                    attestation_request: Some(ticket.request_bytes),
                    ..Default::default()
                };
                store
                    .update_redemption_if(id, &[RedemptionStatus::XrplReceived], &patch)
                    .await?;
                Ok::<(), SettlementError>(())
            })
            .await;

        let (proof, fresh) = match obtained {
            Ok(ProofOutcome::Ready { proof, fresh }) => (proof, fresh),
            Ok(ProofOutcome::NotFinalized(ticket)) => {
                debug!(redemption_id = %id, voting_round = ticket.voting_round, "Payout attestation not finalized");
                return Ok(None);
            }
            Err(e) => {
                self.backend_failed(id, format!("payout attestation failed: {}", e))
                    .await?;
                return Err(e);
            }
        };

        if let Err(e) = check_attestation(&proof, expectation) {
            let patch = RedemptionPatch {
                backend_status: Some(BackendStatus::Failed),
                backend_error: Some(e.to_string()),
                discard_proof: true,
                bump_retry: true,
                ..Default::default()
            };
            self.store
                .update_redemption_if(id, &[RedemptionStatus::XrplReceived], &patch)
                .await?;
            return Err(e);
        }

        if fresh {
            let patch = RedemptionPatch {
                proof: Some(proof.to_json()?),
                ..Default::default()
            };
            self.store
                .update_redemption_if(id, &[RedemptionStatus::XrplReceived], &patch)
                .await?;
        }
        Ok(Some(proof))
    }

    async fn backend_failed(&self, id: Uuid, message: String) -> Result<()> {
        warn!(redemption_id = %id, error = %message, "Payout confirmation needs attention");
        let patch = RedemptionPatch {
            backend_status: Some(BackendStatus::Failed),
            backend_error: Some(message),
            bump_retry: true,
            ..Default::default()
        };
        self.store
            .update_redemption_if(id, &[RedemptionStatus::XrplReceived], &patch)
            .await?;
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        from: RedemptionStatus,
        message: String,
        backend_error: Option<String>,
    ) -> Result<()> {
        let mut patch = RedemptionPatch::failed(message, Utc::now());
        if let Some(backend_error) = backend_error {
            patch.backend_status = Some(BackendStatus::Failed);
            patch.backend_error = Some(backend_error);
        }
        if self.store.update_redemption_if(id, &[from], &patch).await? {
            metrics::record_redemption_transition(RedemptionStatus::Failed.as_str());
        }
        Ok(())
    }
}
