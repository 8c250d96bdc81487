//! Execution-chain collaborators: the FAssets collateral system and the
//! ERC-4626 vaults.
//!
//! The state machines only see the `CollateralClient` and `VaultClient`
//! traits. `EvmClient` implements both over alloy.

use async_trait::async_trait;
use serde::Serialize;

use crate::attestation::AttestationProof;
use crate::error::ClientError;

pub mod client;
pub mod contracts;

pub use client::EvmClient;

/// Cheapest agent able to take `lots` right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollateralQuote {
    pub agent_vault: String,
    pub fee_bps: u32,
    /// Native-token fee paid to reserve the collateral
    pub reservation_fee_wei: u128,
    pub free_lots: u64,
}

/// Collateral reservation as reported by the `CollateralReserved` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollateralReservation {
    /// Collateral reservation id, decimal
    pub reservation_id: String,
    pub agent_vault: String,
    /// XRPL address the user pays
    pub agent_underlying_address: String,
    pub value_uba: u64,
    pub fee_uba: u64,
    pub fee_bps: u32,
    /// 0x-prefixed 32-byte reference the payment must carry as a memo
    pub payment_reference: String,
    pub last_underlying_timestamp: u64,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintReceipt {
    pub tx_hash: String,
    pub minted_uba: u64,
}

/// External redemption request as reported by `RedemptionRequested`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionTicket {
    pub request_id: u64,
    pub agent_vault: String,
    /// Redeemer's XRPL address the agent pays out to
    pub payment_address: String,
    pub value_uba: u64,
    pub fee_uba: u64,
    pub payment_reference: String,
    pub last_underlying_timestamp: u64,
    pub tx_hash: String,
}

impl RedemptionTicket {
    /// XRP the agent must deliver: value minus the redemption fee
    pub fn expected_payout_drops(&self) -> u64 {
        self.value_uba.saturating_sub(self.fee_uba)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultReceipt {
    pub tx_hash: String,
    pub shares: u128,
    /// FXRP in UBA (drops)
    pub assets: u64,
}

#[async_trait]
pub trait CollateralClient: Send + Sync {
    async fn lot_size_drops(&self) -> Result<u64, ClientError>;

    async fn quote(&self, lots: u64) -> Result<CollateralQuote, ClientError>;

    /// Reserve collateral with the cheapest eligible agent.
    async fn reserve_collateral(&self, lots: u64) -> Result<CollateralReservation, ClientError>;

    async fn reservation(
        &self,
        reservation_id: &str,
    ) -> Result<Option<CollateralReservation>, ClientError>;

    /// Dry-run `executeMinting`; a revert comes back as `Rejected` with the
    /// contract's reason.
    async fn simulate_execute_minting(
        &self,
        proof: &AttestationProof,
        reservation_id: &str,
    ) -> Result<(), ClientError>;

    async fn execute_minting(
        &self,
        proof: &AttestationProof,
        reservation_id: &str,
    ) -> Result<MintReceipt, ClientError>;

    async fn request_redemption(
        &self,
        lots: u64,
        underlying_address: &str,
    ) -> Result<RedemptionTicket, ClientError>;

    async fn simulate_confirm_redemption(
        &self,
        proof: &AttestationProof,
        request_id: u64,
    ) -> Result<(), ClientError>;

    /// Returns the confirmation transaction hash.
    async fn confirm_redemption_payment(
        &self,
        proof: &AttestationProof,
        request_id: u64,
    ) -> Result<String, ClientError>;

    /// `Some(status)` once the transaction has a receipt.
    async fn transaction_succeeded(&self, tx_hash: &str) -> Result<Option<bool>, ClientError>;
}

#[async_trait]
pub trait VaultClient: Send + Sync {
    /// Deposit FXRP held by the operator; shares are held for the user.
    async fn deposit(&self, vault_address: &str, assets: u64) -> Result<VaultReceipt, ClientError>;

    async fn redeem(&self, vault_address: &str, shares: u128) -> Result<VaultReceipt, ClientError>;

    async fn preview_redeem(&self, vault_address: &str, shares: u128) -> Result<u64, ClientError>;
}
