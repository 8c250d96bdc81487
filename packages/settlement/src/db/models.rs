//! Persisted entities and the patches applied to them by conditional updates.
//!
//! Drop amounts are BIGINT columns (`u64` here). Vault shares carry 18
//! decimals and are stored as NUMERIC(78,0), read back through `::TEXT`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::types::{BackendStatus, BridgeStatus, RedemptionStatus, SettlementKind, UserStatus};

// ============================================================================
// Deposit bridges
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bridge {
    pub id: Uuid,
    /// Collateral reservation id on the AssetManager (crt id)
    pub request_id: Option<String>,
    pub wallet_address: String,
    pub vault_id: String,
    pub position_id: Option<Uuid>,
    pub settlement: SettlementKind,
    pub requested_drops: u64,
    pub rounded_drops: u64,
    pub lots: u64,
    pub expected_fxrp_drops: u64,
    pub reserved_base_drops: Option<u64>,
    pub reserved_fee_drops: Option<u64>,
    pub fee_bps: Option<u32>,
    pub agent_vault_address: Option<String>,
    pub agent_underlying_address: Option<String>,
    pub payment_reference: Option<String>,
    pub xrpl_tx_hash: Option<String>,
    pub mint_tx_hash: Option<String>,
    pub deposit_tx_hash: Option<String>,
    pub attestation_round: Option<u64>,
    pub attestation_request: Option<String>,
    pub proof: Option<String>,
    pub shares_minted: Option<u128>,
    pub status: BridgeStatus,
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub xrpl_confirmed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl Bridge {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        BridgeStatus::EXPIRABLE.contains(&self.status) && now > self.expires_at
    }

    pub fn route(&self) -> Option<ReservedRoute> {
        Some(ReservedRoute {
            request_id: self.request_id.clone()?,
            agent_vault_address: self.agent_vault_address.clone()?,
            agent_underlying_address: self.agent_underlying_address.clone()?,
            payment_reference: self.payment_reference.clone(),
            reserved_base_drops: self.reserved_base_drops?,
            reserved_fee_drops: self.reserved_fee_drops?,
            fee_bps: self.fee_bps.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewBridge {
    pub id: Uuid,
    pub wallet_address: String,
    pub vault_id: String,
    pub position_id: Option<Uuid>,
    pub settlement: SettlementKind,
    pub requested_drops: u64,
    pub rounded_drops: u64,
    pub lots: u64,
    pub expected_fxrp_drops: u64,
    pub expires_at: DateTime<Utc>,
}

/// Routing fields written once when a reservation (or escrow route) exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedRoute {
    pub request_id: String,
    pub agent_vault_address: String,
    pub agent_underlying_address: String,
    pub payment_reference: Option<String>,
    pub reserved_base_drops: u64,
    pub reserved_fee_drops: u64,
    pub fee_bps: u32,
}

/// Partial update for a bridge. `None` leaves a column untouched. Phase
/// timestamps are only written when still NULL, and `route` is only
/// applied to a bridge that has no route yet.
#[derive(Debug, Clone, Default)]
pub struct BridgePatch {
    pub status: Option<BridgeStatus>,
    pub error: Option<String>,
    pub clear_error: bool,
    pub bump_retry: bool,
    pub route: Option<ReservedRoute>,
    pub xrpl_tx_hash: Option<String>,
    pub mint_tx_hash: Option<String>,
    pub deposit_tx_hash: Option<String>,
    pub attestation_round: Option<u64>,
    pub attestation_request: Option<String>,
    pub proof: Option<String>,
    /// Drop the stored ticket and proof so the next attempt re-attests
    pub discard_proof: bool,
    pub shares_minted: Option<u128>,
    pub position_id: Option<Uuid>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub xrpl_confirmed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl BridgePatch {
    pub fn status(status: BridgeStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(BridgeStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

// ============================================================================
// Redemptions
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Redemption {
    pub id: Uuid,
    pub position_id: Uuid,
    pub wallet_address: String,
    pub vault_id: String,
    pub shares: u128,
    pub fxrp_received_drops: Option<u64>,
    pub lots: Option<u64>,
    pub xrp_sent_drops: Option<u64>,
    pub vault_redeem_tx_hash: Option<String>,
    pub redemption_request_id: Option<u64>,
    pub redemption_tx_hash: Option<String>,
    pub payment_reference: Option<String>,
    pub agent_vault_address: Option<String>,
    pub payment_deadline: Option<DateTime<Utc>>,
    pub xrpl_payout_tx_hash: Option<String>,
    pub attestation_round: Option<u64>,
    pub attestation_request: Option<String>,
    pub proof: Option<String>,
    pub confirm_tx_hash: Option<String>,
    pub status: RedemptionStatus,
    pub user_status: UserStatus,
    pub backend_status: Option<BackendStatus>,
    pub last_error: Option<String>,
    pub backend_error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub shares_redeemed_at: Option<DateTime<Utc>>,
    pub redemption_requested_at: Option<DateTime<Utc>>,
    pub xrpl_payout_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewRedemption {
    pub id: Uuid,
    pub position_id: Uuid,
    pub wallet_address: String,
    pub vault_id: String,
    pub shares: u128,
}

/// External redemption request recorded at the `redeeming_fxrp` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionTicketFields {
    pub request_id: u64,
    pub tx_hash: String,
    pub lots: u64,
    pub xrp_expected_drops: u64,
    pub payment_reference: String,
    pub agent_vault_address: String,
    pub payment_deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct RedemptionPatch {
    pub status: Option<RedemptionStatus>,
    pub user_status: Option<UserStatus>,
    pub backend_status: Option<BackendStatus>,
    pub last_error: Option<String>,
    pub backend_error: Option<String>,
    pub clear_errors: bool,
    pub bump_retry: bool,
    pub fxrp_received_drops: Option<u64>,
    pub vault_redeem_tx_hash: Option<String>,
    /// Only applied while no request id is stored
    pub ticket: Option<RedemptionTicketFields>,
    pub xrpl_payout_tx_hash: Option<String>,
    pub xrp_sent_drops: Option<u64>,
    pub attestation_round: Option<u64>,
    pub attestation_request: Option<String>,
    pub proof: Option<String>,
    pub discard_proof: bool,
    pub confirm_tx_hash: Option<String>,
    pub shares_redeemed_at: Option<DateTime<Utc>>,
    pub redemption_requested_at: Option<DateTime<Utc>>,
    pub xrpl_payout_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl RedemptionPatch {
    pub fn status(status: RedemptionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(RedemptionStatus::Failed),
            user_status: Some(UserStatus::Failed),
            last_error: Some(error.into()),
            failed_at: Some(now),
            ..Default::default()
        }
    }
}

// ============================================================================
// Positions and activity history
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: Uuid,
    pub wallet_address: String,
    pub vault_id: String,
    pub shares: u128,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Shares credited to a position when a bridge completes. `position_id` of
/// `None` means "the wallet's position in this vault, created if missing".
#[derive(Debug, Clone)]
pub struct PositionCredit {
    pub position_id: Option<Uuid>,
    pub wallet_address: String,
    pub vault_id: String,
    pub shares: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Deposit,
    Withdrawal,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Deposit => "deposit",
            ActivityKind::Withdrawal => "withdrawal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub wallet_address: String,
    pub vault_id: String,
    pub kind: ActivityKind,
    pub amount_drops: u64,
    pub shares: u128,
    pub reference_id: Uuid,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: i64,
    pub wallet_address: String,
    pub vault_id: String,
    pub kind: ActivityKind,
    pub amount_drops: u64,
    pub shares: u128,
    pub reference_id: Uuid,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Record counts for the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub active_bridges: u64,
    pub active_redemptions: u64,
    pub completed_bridges: u64,
    pub completed_redemptions: u64,
}
