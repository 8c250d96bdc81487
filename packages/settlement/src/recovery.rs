//! Reconciliation and operator recovery
//!
//! Every action here re-enters the bridge and redemption state machines;
//! nothing writes a status the state machines would not. Records still
//! inside their staleness window are left to the worker that holds them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bridge::{BridgeService, BridgeStatusView, MintOutcome};
use crate::config::Config;
use crate::db::{BridgePatch, Redemption, RedemptionPatch, Store};
use crate::error::{Result, SettlementError};
use crate::metrics;
use crate::redemption::{RedemptionService, RedemptionStatusView};
use crate::types::{BackendStatus, BridgeStatus, RedemptionStatus, UserStatus};

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    /// Age after which an in-flight step is considered abandoned
    pub stale_after: chrono::Duration,
    pub batch_size: i64,
}

impl RecoverySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stale_after: chrono::Duration::seconds(config.bridge.stale_after_secs as i64),
            ..Default::default()
        }
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            stale_after: chrono::Duration::minutes(15),
            batch_size: 100,
        }
    }
}

/// What reconciling one record did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciled {
    pub id: Uuid,
    pub before: String,
    pub after: String,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub expired: u64,
    pub bridges: Vec<Reconciled>,
    pub redemptions: Vec<Reconciled>,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverableRecords {
    pub stale_secs: i64,
    pub bridges: Vec<BridgeStatusView>,
    pub redemptions: Vec<RedemptionStatusView>,
}

pub struct RecoveryService {
    store: Arc<dyn Store>,
    bridges: Arc<BridgeService>,
    redemptions: Arc<RedemptionService>,
    settings: RecoverySettings,
}

impl RecoveryService {
    pub fn new(
        store: Arc<dyn Store>,
        bridges: Arc<BridgeService>,
        redemptions: Arc<RedemptionService>,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            store,
            bridges,
            redemptions,
            settings,
        }
    }

    fn is_stale(&self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - updated_at >= self.settings.stale_after
    }

    // ========================================================================
    // Bridges
    // ========================================================================

    /// Inspect a bridge and run the step its status calls for.
    pub async fn reconcile_bridge(&self, id: Uuid) -> Result<Reconciled> {
        let bridge = self.bridges.get(id).await?;
        let now = Utc::now();
        let before = bridge.status;

        let action = match bridge.status {
            BridgeStatus::Pending | BridgeStatus::AwaitingPayment if bridge.is_expired_at(now) => {
                "expired"
            }
            BridgeStatus::Pending => {
                self.bridges.reserve(id).await?;
                "reserve"
            }
            BridgeStatus::ReservingCollateral | BridgeStatus::Bridging => {
                if !self.is_stale(bridge.updated_at, now) {
                    "in_progress"
                } else {
                    let patch = BridgePatch::failed(format!(
                        "route assignment interrupted in {}",
                        bridge.status
                    ));
                    if self
                        .store
                        .update_bridge_if(id, &[bridge.status], &patch)
                        .await?
                    {
                        metrics::record_bridge_transition(BridgeStatus::Failed.as_str());
                        warn!(bridge_id = %id, status = %bridge.status, "Interrupted route assignment failed");
                    }
                    "fail_interrupted"
                }
            }
            BridgeStatus::AwaitingPayment => {
                self.bridges.detect_payment(id).await?;
                let current = self.bridges.get(id).await?;
                if current.status == BridgeStatus::XrplConfirmed {
                    self.bridges.mint(id).await?;
                }
                "detect_payment"
            }
            BridgeStatus::XrplConfirmed => {
                self.bridges.mint(id).await?;
                "mint"
            }
            BridgeStatus::Minting => {
                if self.is_stale(bridge.updated_at, now) {
                    self.bridges.resume_minting(id).await?;
                    "resume_minting"
                } else {
                    "in_progress"
                }
            }
            BridgeStatus::Completed
            | BridgeStatus::Failed
            | BridgeStatus::Expired
            | BridgeStatus::Cancelled => "none",
        };

        let after = self.bridges.get(id).await?.status;
        if before != after {
            info!(bridge_id = %id, before = %before, after = %after, action, "Bridge reconciled");
        }
        Ok(Reconciled {
            id,
            before: before.to_string(),
            after: after.to_string(),
            action,
            error: None,
        })
    }

    /// Re-enter the proof and mint step of a confirmed bridge.
    pub async fn retry_proof(&self, id: Uuid) -> Result<MintOutcome> {
        let bridge = self.bridges.get(id).await?;
        match bridge.status {
            BridgeStatus::XrplConfirmed => self.bridges.mint(id).await,
            BridgeStatus::Minting if self.is_stale(bridge.updated_at, Utc::now()) => {
                self.bridges.resume_minting(id).await
            }
            other => Err(SettlementError::invalid_state(
                format!("bridge is {} and has no proof step to retry", other),
                other,
                &[BridgeStatus::XrplConfirmed.as_str()],
            )),
        }
    }

    /// Confirm an operator-supplied payment hash with the usual ledger
    /// checks, then mint.
    pub async fn recover_proof(&self, id: Uuid, tx_hash: &str) -> Result<MintOutcome> {
        self.bridges.recover_payment(id, tx_hash).await?;
        info!(bridge_id = %id, tx_hash = %tx_hash, "Payment recovered by operator");
        self.bridges.mint(id).await
    }

    // ========================================================================
    // Redemptions
    // ========================================================================

    pub async fn reconcile_redemption(&self, id: Uuid) -> Result<Reconciled> {
        let r = self.redemptions.get(id).await?;
        let now = Utc::now();
        let before = r.status;

        let action = match r.status {
            RedemptionStatus::Pending
            | RedemptionStatus::RedeemedFxrp
            | RedemptionStatus::XrplPayout
            | RedemptionStatus::XrplReceived => {
                self.redemptions.process(id).await?;
                "process"
            }
            RedemptionStatus::AwaitingProof => {
                let status = self.redemptions.process(id).await?;
                if status == RedemptionStatus::AwaitingProof {
                    let current = self.redemptions.get(id).await?;
                    if self.mark_overdue(&current, now).await? {
                        "payment_overdue"
                    } else {
                        "detect_payout"
                    }
                } else {
                    "detect_payout"
                }
            }
            RedemptionStatus::RedeemingShares | RedemptionStatus::RedeemingFxrp => {
                if self.is_stale(r.updated_at, now) {
                    self.flag_interrupted(&r).await?;
                    "flag_interrupted"
                } else {
                    "in_progress"
                }
            }
            RedemptionStatus::Completed | RedemptionStatus::Failed => "none",
        };

        let after = self.redemptions.get(id).await?.status;
        if before != after {
            info!(redemption_id = %id, before = %before, after = %after, action, "Redemption reconciled");
        }
        Ok(Reconciled {
            id,
            before: before.to_string(),
            after: after.to_string(),
            action,
            error: None,
        })
    }

    /// Flag a redemption whose agent missed the payment deadline. The user
    /// keeps seeing `processing`; the operator completes it once the payout
    /// is found.
    async fn mark_overdue(&self, r: &Redemption, now: DateTime<Utc>) -> Result<bool> {
        let Some(deadline) = r.payment_deadline else {
            return Ok(false);
        };
        if deadline > now || r.backend_status == Some(BackendStatus::PaymentOverdue) {
            return Ok(false);
        }
        let patch = RedemptionPatch {
            backend_status: Some(BackendStatus::PaymentOverdue),
            backend_error: Some(format!(
                "agent payout for redemption request {} was due by {}",
                r.redemption_request_id.unwrap_or_default(),
                deadline
            )),
            ..Default::default()
        };
        let marked = self
            .store
            .update_redemption_if(r.id, &[RedemptionStatus::AwaitingProof], &patch)
            .await?;
        if marked {
            warn!(redemption_id = %r.id, deadline = %deadline, "Agent payout overdue");
        }
        Ok(marked)
    }

    async fn flag_interrupted(&self, r: &Redemption) -> Result<()> {
        if r.backend_status == Some(BackendStatus::Failed) {
            return Ok(());
        }
        let patch = RedemptionPatch {
            backend_status: Some(BackendStatus::Failed),
            backend_error: Some(format!(
                "interrupted in {}; check the on-chain outcome before retrying",
                r.status
            )),
            ..Default::default()
        };
        if self
            .store
            .update_redemption_if(r.id, &[r.status], &patch)
            .await?
        {
            warn!(redemption_id = %r.id, status = %r.status, "Redemption step interrupted");
        }
        Ok(())
    }

    /// Operator retry. A failed redemption is reopened at the first step it
    /// never finished; anything else in flight is reconciled.
    pub async fn retry_redemption(&self, id: Uuid) -> Result<RedemptionStatusView> {
        let r = self.redemptions.get(id).await?;
        match r.status {
            RedemptionStatus::Failed => {
                let reopen_at = match (r.fxrp_received_drops, r.redemption_request_id) {
                    (None, _) => RedemptionStatus::Pending,
                    (Some(_), None) => RedemptionStatus::RedeemedFxrp,
                    (Some(_), Some(_)) => RedemptionStatus::AwaitingProof,
                };
                let patch = RedemptionPatch {
                    status: Some(reopen_at),
                    user_status: Some(UserStatus::Processing),
                    backend_status: Some(BackendStatus::Pending),
                    clear_errors: true,
                    bump_retry: true,
                    ..Default::default()
                };
                if self
                    .store
                    .update_redemption_if(id, &[RedemptionStatus::Failed], &patch)
                    .await?
                {
                    metrics::record_redemption_transition(reopen_at.as_str());
                    info!(redemption_id = %id, status = %reopen_at, "Failed redemption reopened");
                }
                self.redemptions.process(id).await?;
            }
            RedemptionStatus::RedeemingShares => {
                return Err(SettlementError::invalid_state(
                    "vault redemption outcome is unknown; resolve it before retrying",
                    r.status,
                    &[
                        RedemptionStatus::Failed.as_str(),
                        RedemptionStatus::AwaitingProof.as_str(),
                        RedemptionStatus::XrplReceived.as_str(),
                    ],
                ))
            }
            RedemptionStatus::RedeemingFxrp if self.is_stale(r.updated_at, Utc::now()) => {
                // The request never produced a ticket; the FXRP is still held
                let patch = RedemptionPatch {
                    status: Some(RedemptionStatus::RedeemedFxrp),
                    clear_errors: true,
                    bump_retry: true,
                    ..Default::default()
                };
                self.store
                    .update_redemption_if(id, &[RedemptionStatus::RedeemingFxrp], &patch)
                    .await?;
                self.redemptions.process(id).await?;
            }
            _ => {
                self.reconcile_redemption(id).await?;
            }
        }
        self.redemptions.status(id).await
    }

    /// Complete a redemption with an operator-located payout hash.
    pub async fn complete_redemption(&self, id: Uuid, tx_hash: &str) -> Result<RedemptionStatusView> {
        let view = self.redemptions.record_payout(id, tx_hash).await?;
        info!(redemption_id = %id, tx_hash = %tx_hash, status = %view.status, "Payout recorded by operator");
        Ok(view)
    }

    // ========================================================================
    // Bulk
    // ========================================================================

    /// Expire abandoned bridges, then reconcile every stale non-terminal
    /// record and every redemption whose backend needs attention.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let now = Utc::now();
        let cutoff = now - self.settings.stale_after;
        let mut report = ReconcileReport {
            expired: self.bridges.cleanup_expired(now).await?,
            ..Default::default()
        };

        let bridges = self
            .store
            .list_bridges(&BridgeStatus::NON_TERMINAL, Some(cutoff), self.settings.batch_size)
            .await?;
        for bridge in bridges {
            let entry = match self.reconcile_bridge(bridge.id).await {
                Ok(entry) => entry,
                Err(e) => {
                    report.failures += 1;
                    failed_entry(bridge.id, bridge.status.to_string(), e)
                }
            };
            report.bridges.push(entry);
        }

        let mut seen = HashSet::new();
        let stale = self
            .store
            .list_redemptions(&RedemptionStatus::NON_TERMINAL, Some(cutoff), self.settings.batch_size)
            .await?;
        let attention = self
            .store
            .list_redemptions_needing_attention(self.settings.batch_size)
            .await?;
        for r in stale.into_iter().chain(attention) {
            if !seen.insert(r.id) {
                continue;
            }
            let entry = match self.reconcile_redemption(r.id).await {
                Ok(entry) => entry,
                Err(e) => {
                    report.failures += 1;
                    failed_entry(r.id, r.status.to_string(), e)
                }
            };
            report.redemptions.push(entry);
        }

        info!(
            expired = report.expired,
            bridges = report.bridges.len(),
            redemptions = report.redemptions.len(),
            failures = report.failures,
            "Reconciliation pass finished"
        );
        Ok(report)
    }

    /// Non-terminal records untouched for `stale_secs`, plus redemptions
    /// whose backend needs an operator.
    pub async fn recoverable(&self, stale_secs: Option<i64>) -> Result<RecoverableRecords> {
        let stale_secs = stale_secs.unwrap_or_else(|| self.settings.stale_after.num_seconds());
        if stale_secs < 0 {
            return Err(SettlementError::validation("staleSecs cannot be negative"));
        }
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(stale_secs);

        let bridges: Vec<_> = self
            .store
            .list_bridges(&BridgeStatus::NON_TERMINAL, Some(cutoff), self.settings.batch_size)
            .await?
            .iter()
            .map(|b| BridgeStatusView::new(b, now))
            .collect();

        let mut seen = HashSet::new();
        let redemptions: Vec<_> = self
            .store
            .list_redemptions(&RedemptionStatus::NON_TERMINAL, Some(cutoff), self.settings.batch_size)
            .await?
            .into_iter()
            .chain(
                self.store
                    .list_redemptions_needing_attention(self.settings.batch_size)
                    .await?,
            )
            .filter(|r| seen.insert(r.id))
            .map(|r| RedemptionStatusView::from(&r))
            .collect();

        metrics::set_recoverable_backlog("bridge", bridges.len());
        metrics::set_recoverable_backlog("redemption", redemptions.len());

        Ok(RecoverableRecords {
            stale_secs,
            bridges,
            redemptions,
        })
    }
}

fn failed_entry(id: Uuid, status: String, e: SettlementError) -> Reconciled {
    warn!(id = %id, error = %e, "Reconciliation step failed");
    Reconciled {
        id,
        before: status.clone(),
        after: status,
        action: "error",
        error: Some(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::testing::Harness;

    const TX: &str = "ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789";
    const PAYOUT: &str = "1111222233334444555566667777888899990000AAAABBBBCCCCDDDDEEEEFFFF";

    #[tokio::test]
    async fn test_reconcile_finds_unreported_payment() {
        let h = Harness::new();
        let id = h.reserved_bridge("20").await;
        h.pay(id, TX).await;

        let done = h.recovery.reconcile_bridge(id).await.unwrap();
        assert_eq!(done.action, "detect_payment");
        assert_eq!(done.after, "completed");
        assert_eq!(h.bridges.get(id).await.unwrap().xrpl_tx_hash.as_deref(), Some(TX));
    }

    #[tokio::test]
    async fn test_reconcile_mints_confirmed_bridge() {
        let h = Harness::new();
        let id = h.confirmed_bridge("20", TX).await;

        let done = h.recovery.reconcile_bridge(id).await.unwrap();
        assert_eq!(done.action, "mint");
        assert_eq!(done.before, "xrpl_confirmed");
        assert_eq!(done.after, "completed");

        let again = h.recovery.reconcile_bridge(id).await.unwrap();
        assert_eq!(again.action, "none");
        assert_eq!(h.collateral.script.calls("mint"), 1);
    }

    #[tokio::test]
    async fn test_resume_minting_rolls_back_unreleased_bridge() {
        let h = Harness::new();
        let id = h.confirmed_bridge("20", TX).await;
        // A worker claimed the bridge and died before releasing
        h.store
            .update_bridge_if(id, &[BridgeStatus::XrplConfirmed], &BridgePatch::status(BridgeStatus::Minting))
            .await
            .unwrap();

        let outcome = h.recovery.retry_proof(id).await;
        assert!(outcome.is_err(), "fresh minting bridge is not touched");

        let outcome = h.bridges.resume_minting(id).await.unwrap();
        assert!(matches!(outcome, MintOutcome::Completed { .. }));
        assert_eq!(h.collateral.script.calls("mint"), 1);
        assert_eq!(h.bridges.get(id).await.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_resume_minting_deposits_released_fxrp() {
        let h = Harness::new();
        let id = h.confirmed_bridge("20", TX).await;
        h.vault.script.fail("deposit", ClientError::Transport("connection reset".into()));

        assert!(h.bridges.mint(id).await.is_err());
        let bridge = h.bridges.get(id).await.unwrap();
        assert_eq!(bridge.status, BridgeStatus::Minting);
        assert!(bridge.mint_tx_hash.is_some());

        h.vault.script.clear("deposit");
        let outcome = h.bridges.resume_minting(id).await.unwrap();
        assert!(matches!(outcome, MintOutcome::Completed { .. }));
        assert_eq!(h.collateral.script.calls("mint"), 1);
        assert_eq!(h.vault.script.calls("deposit"), 2);
    }

    #[tokio::test]
    async fn test_recover_proof_accepts_late_payment() {
        let h = Harness::new();
        let id = h.reserved_bridge("20").await;
        h.bridges
            .cleanup_expired(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(h.bridges.get(id).await.unwrap().status, BridgeStatus::Expired);

        h.pay(id, TX).await;
        assert!(h.bridges.confirm_payment(id, TX).await.is_err());

        let outcome = h.recovery.recover_proof(id, TX).await.unwrap();
        assert!(matches!(outcome, MintOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_recover_proof_still_checks_ledger() {
        let h = Harness::new();
        let id = h.reserved_bridge("20").await;
        h.ledger
            .insert(crate::testing::payment_tx(TX, crate::testing::AGENT_ADDRESS, 1_000_000));

        let err = h.recovery.recover_proof(id, TX).await.unwrap_err();
        assert!(matches!(err, SettlementError::Verification(_)));
        assert_eq!(h.bridges.get(id).await.unwrap().status, BridgeStatus::AwaitingPayment);
    }

    #[tokio::test]
    async fn test_overdue_payout_is_flagged_for_operator() {
        let h = Harness::new();
        h.collateral
            .redemption_deadline_secs
            .store(-60, std::sync::atomic::Ordering::SeqCst);
        let (id, _) = h.pending_redemption(20).await;
        h.redemptions.process(id).await.unwrap();

        let done = h.recovery.reconcile_redemption(id).await.unwrap();
        assert_eq!(done.action, "payment_overdue");
        let r = h.redemptions.get(id).await.unwrap();
        assert_eq!(r.backend_status, Some(BackendStatus::PaymentOverdue));
        assert_eq!(r.user_status, UserStatus::Processing);

        let listed = h.recovery.recoverable(Some(3600)).await.unwrap();
        assert_eq!(listed.redemptions.len(), 1);

        h.agent_pays(id, PAYOUT).await;
        let view = h.recovery.complete_redemption(id, PAYOUT).await.unwrap();
        assert_eq!(view.status, RedemptionStatus::Completed);
        assert_eq!(view.backend_status, Some(BackendStatus::Confirmed));
    }

    #[tokio::test]
    async fn test_retry_reopens_failed_redemption() {
        let h = Harness::new();
        let (id, _) = h.pending_redemption(20).await;
        h.collateral
            .script
            .fail("redeem", ClientError::rejected("redemption paused"));
        assert!(h.redemptions.process(id).await.is_err());
        let failed = h.redemptions.get(id).await.unwrap();
        assert_eq!(failed.status, RedemptionStatus::Failed);
        assert!(failed.fxrp_received_drops.is_some());

        h.collateral.script.clear("redeem");
        let view = h.recovery.retry_redemption(id).await.unwrap();
        assert_eq!(view.status, RedemptionStatus::AwaitingProof);
        assert_eq!(view.user_status, UserStatus::Processing);
        assert_eq!(h.vault.script.calls("redeem"), 1);
    }

    #[tokio::test]
    async fn test_reconcile_all_expires_and_reports() {
        let h = Harness::new();
        let recovery = RecoveryService::new(
            h.store.clone(),
            h.bridges.clone(),
            h.redemptions.clone(),
            RecoverySettings {
                stale_after: chrono::Duration::seconds(-1),
                batch_size: 10,
            },
        );
        let confirmed = h.confirmed_bridge("20", TX).await;

        let report = recovery.reconcile_all().await.unwrap();
        assert_eq!(report.failures, 0);
        assert!(report
            .bridges
            .iter()
            .any(|b| b.id == confirmed && b.after == "completed"));
    }
}
