//! Status enums shared by the state machines, the store and the HTTP layer.
//!
//! Every enum maps to a lowercase snake_case VARCHAR column through
//! `sqlx::Type`, and to the same string on the wire through serde.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SettlementError;

// ============================================================================
// Deposit bridge
// ============================================================================

/// Deposit bridge lifecycle.
///
/// `pending → reserving_collateral | bridging → awaiting_payment →
/// xrpl_confirmed → minting → completed`, with `failed`, `cancelled` and
/// `expired` reachable from any pre-minting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Pending,
    ReservingCollateral,
    /// Route assignment for escrow-settled vaults
    Bridging,
    AwaitingPayment,
    XrplConfirmed,
    Minting,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl BridgeStatus {
    /// States from which a user may still cancel.
    pub const CANCELLABLE: [BridgeStatus; 4] = [
        BridgeStatus::Pending,
        BridgeStatus::ReservingCollateral,
        BridgeStatus::Bridging,
        BridgeStatus::AwaitingPayment,
    ];

    /// States that are abandoned once `expires_at` passes.
    pub const EXPIRABLE: [BridgeStatus; 2] = [BridgeStatus::Pending, BridgeStatus::AwaitingPayment];

    pub const NON_TERMINAL: [BridgeStatus; 6] = [
        BridgeStatus::Pending,
        BridgeStatus::ReservingCollateral,
        BridgeStatus::Bridging,
        BridgeStatus::AwaitingPayment,
        BridgeStatus::XrplConfirmed,
        BridgeStatus::Minting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Pending => "pending",
            BridgeStatus::ReservingCollateral => "reserving_collateral",
            BridgeStatus::Bridging => "bridging",
            BridgeStatus::AwaitingPayment => "awaiting_payment",
            BridgeStatus::XrplConfirmed => "xrpl_confirmed",
            BridgeStatus::Minting => "minting",
            BridgeStatus::Completed => "completed",
            BridgeStatus::Failed => "failed",
            BridgeStatus::Cancelled => "cancelled",
            BridgeStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BridgeStatus::Completed
                | BridgeStatus::Failed
                | BridgeStatus::Cancelled
                | BridgeStatus::Expired
        )
    }

    pub fn is_cancellable(&self) -> bool {
        Self::CANCELLABLE.contains(self)
    }
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BridgeStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => BridgeStatus::Pending,
            "reserving_collateral" => BridgeStatus::ReservingCollateral,
            "bridging" => BridgeStatus::Bridging,
            "awaiting_payment" => BridgeStatus::AwaitingPayment,
            "xrpl_confirmed" => BridgeStatus::XrplConfirmed,
            "minting" => BridgeStatus::Minting,
            "completed" => BridgeStatus::Completed,
            "failed" => BridgeStatus::Failed,
            "cancelled" => BridgeStatus::Cancelled,
            "expired" => BridgeStatus::Expired,
            other => {
                return Err(SettlementError::validation(format!(
                    "unknown bridge status: {}",
                    other
                )))
            }
        })
    }
}

// ============================================================================
// Redemption
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    Pending,
    RedeemingShares,
    RedeemedFxrp,
    RedeemingFxrp,
    AwaitingProof,
    /// Payout hash known, ledger validation not yet observed
    XrplPayout,
    /// Payout validated on the ledger; on-chain confirmation outstanding
    XrplReceived,
    Completed,
    Failed,
}

impl RedemptionStatus {
    pub const NON_TERMINAL: [RedemptionStatus; 7] = [
        RedemptionStatus::Pending,
        RedemptionStatus::RedeemingShares,
        RedemptionStatus::RedeemedFxrp,
        RedemptionStatus::RedeemingFxrp,
        RedemptionStatus::AwaitingProof,
        RedemptionStatus::XrplPayout,
        RedemptionStatus::XrplReceived,
    ];

    /// States whose shares still count as reserved against the position.
    pub const RESERVING_SHARES: [RedemptionStatus; 2] =
        [RedemptionStatus::Pending, RedemptionStatus::RedeemingShares];

    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionStatus::Pending => "pending",
            RedemptionStatus::RedeemingShares => "redeeming_shares",
            RedemptionStatus::RedeemedFxrp => "redeemed_fxrp",
            RedemptionStatus::RedeemingFxrp => "redeeming_fxrp",
            RedemptionStatus::AwaitingProof => "awaiting_proof",
            RedemptionStatus::XrplPayout => "xrpl_payout",
            RedemptionStatus::XrplReceived => "xrpl_received",
            RedemptionStatus::Completed => "completed",
            RedemptionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RedemptionStatus::Completed | RedemptionStatus::Failed)
    }

    /// Human-readable step shown while polling.
    pub fn current_step(&self) -> &'static str {
        match self {
            RedemptionStatus::Pending => "Queued",
            RedemptionStatus::RedeemingShares => "Redeeming vault shares",
            RedemptionStatus::RedeemedFxrp => "Vault shares redeemed for FXRP",
            RedemptionStatus::RedeemingFxrp => "Requesting FXRP redemption",
            RedemptionStatus::AwaitingProof => "Waiting for XRP payout",
            RedemptionStatus::XrplPayout => "XRP payout submitted",
            RedemptionStatus::XrplReceived => "XRP received",
            RedemptionStatus::Completed => "Completed",
            RedemptionStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RedemptionStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => RedemptionStatus::Pending,
            "redeeming_shares" => RedemptionStatus::RedeemingShares,
            "redeemed_fxrp" => RedemptionStatus::RedeemedFxrp,
            "redeeming_fxrp" => RedemptionStatus::RedeemingFxrp,
            "awaiting_proof" => RedemptionStatus::AwaitingProof,
            "xrpl_payout" => RedemptionStatus::XrplPayout,
            "xrpl_received" => RedemptionStatus::XrplReceived,
            "completed" => RedemptionStatus::Completed,
            "failed" => RedemptionStatus::Failed,
            other => {
                return Err(SettlementError::validation(format!(
                    "unknown redemption status: {}",
                    other
                )))
            }
        })
    }
}

/// Coarse status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Processing,
    Completed,
    Failed,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Processing => "processing",
            UserStatus::Completed => "completed",
            UserStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Backend reconciliation status, tracked apart from what the user sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Pending,
    Confirming,
    Confirmed,
    Failed,
    /// The agent did not pay out before the redemption deadline
    PaymentOverdue,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Pending => "pending",
            BackendStatus::Confirming => "confirming",
            BackendStatus::Confirmed => "confirmed",
            BackendStatus::Failed => "failed",
            BackendStatus::PaymentOverdue => "payment_overdue",
        }
    }

    /// Statuses that need an operator.
    pub fn needs_attention(&self) -> bool {
        matches!(self, BackendStatus::Failed | BackendStatus::PaymentOverdue)
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Settlement strategy selector
// ============================================================================

/// How a vault settles incoming XRP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    /// FAssets collateral reservation, FDC proof, executeMinting
    AttestedMint,
    /// Payment to the vault's XRPL escrow address, deposit from operator inventory
    Escrow,
}

impl SettlementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementKind::AttestedMint => "attested_mint",
            SettlementKind::Escrow => "escrow",
        }
    }
}

impl fmt::Display for SettlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_status_round_trips_through_str() {
        for status in [
            BridgeStatus::Pending,
            BridgeStatus::ReservingCollateral,
            BridgeStatus::Bridging,
            BridgeStatus::AwaitingPayment,
            BridgeStatus::XrplConfirmed,
            BridgeStatus::Minting,
            BridgeStatus::Completed,
            BridgeStatus::Failed,
            BridgeStatus::Cancelled,
            BridgeStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<BridgeStatus>().unwrap(), status);
        }
        assert!("minted".parse::<BridgeStatus>().is_err());
    }

    #[test]
    fn test_cancellable_set() {
        assert!(BridgeStatus::Pending.is_cancellable());
        assert!(BridgeStatus::Bridging.is_cancellable());
        assert!(BridgeStatus::AwaitingPayment.is_cancellable());
        assert!(!BridgeStatus::XrplConfirmed.is_cancellable());
        assert!(!BridgeStatus::Minting.is_cancellable());
        assert!(!BridgeStatus::Completed.is_cancellable());
    }

    #[test]
    fn test_terminal_states() {
        assert!(BridgeStatus::Expired.is_terminal());
        assert!(!BridgeStatus::Minting.is_terminal());
        assert!(RedemptionStatus::Failed.is_terminal());
        assert!(!RedemptionStatus::XrplReceived.is_terminal());
    }

    #[test]
    fn test_redemption_status_display() {
        assert_eq!(RedemptionStatus::RedeemedFxrp.to_string(), "redeemed_fxrp");
        assert_eq!(
            "awaiting_proof".parse::<RedemptionStatus>().unwrap(),
            RedemptionStatus::AwaitingProof
        );
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&BridgeStatus::XrplConfirmed).unwrap();
        assert_eq!(json, "\"xrpl_confirmed\"");
        let kind: SettlementKind = serde_json::from_str("\"attested_mint\"").unwrap();
        assert_eq!(kind, SettlementKind::AttestedMint);
        assert_eq!(BackendStatus::PaymentOverdue.to_string(), "payment_overdue");
    }
}
