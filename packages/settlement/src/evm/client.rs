//! alloy-backed execution-chain client
//!
//! One operator key signs every transaction: collateral reservations,
//! minting, FDC attestation requests, vault deposits and redemptions. The
//! provider is rebuilt per call with `with_recommended_fillers()` so nonce,
//! gas and fees are always filled from the node.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, FixedBytes, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, BlockTransactionsKind};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use eyre::{Result as EyreResult, WrapErr};
use reqwest::Url;
use std::str::FromStr;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::contracts::{IAssetManager, IERC20, IERC4626, IFdcHub, IFdcRequestFeeConfigurations, IPayment};
use super::{
    CollateralClient, CollateralQuote, CollateralReservation, MintReceipt, RedemptionTicket,
    VaultClient, VaultReceipt,
};
use crate::attestation::{AttestationProof, FdcSubmitter};
use crate::config::EvmConfig;
use crate::error::ClientError;
use crate::retry::{classify_message, with_retry, ErrorClass, RetryConfig};

/// Agent status value for agents accepting new mints
const AGENT_STATUS_NORMAL: u8 = 0;

/// Page size when listing available agents
const AGENT_PAGE: u64 = 100;

pub struct EvmClient {
    rpc_url: Url,
    signer: PrivateKeySigner,
    asset_manager: Address,
    fdc_hub: Address,
    fdc_fee_config: Address,
    fxrp: Address,
    max_minting_fee_bps: u32,
    retry: RetryConfig,
    lot_size: OnceCell<u64>,
}

fn contract_error(e: alloy::contract::Error) -> ClientError {
    let message = e.to_string();
    match classify_message(&message) {
        ErrorClass::Transient => ClientError::Transport(message),
        ErrorClass::Permanent => ClientError::rejected(message),
    }
}

fn receipt_error(e: impl std::fmt::Display) -> ClientError {
    ClientError::Transport(format!("failed to get receipt: {}", e))
}

fn to_u64(value: U256, what: &str) -> Result<u64, ClientError> {
    u64::try_from(value).map_err(|_| ClientError::Decode(format!("{} out of range: {}", what, value)))
}

fn to_u32(value: U256, what: &str) -> Result<u32, ClientError> {
    u32::try_from(value).map_err(|_| ClientError::Decode(format!("{} out of range: {}", what, value)))
}

fn parse_address(value: &str) -> Result<Address, ClientError> {
    Address::from_str(value).map_err(|_| ClientError::Decode(format!("invalid address: {}", value)))
}

fn parse_uint(value: &str, what: &str) -> Result<U256, ClientError> {
    U256::from_str(value).map_err(|_| ClientError::Decode(format!("invalid {}: {}", what, value)))
}

fn parse_tx_hash(value: &str) -> Result<FixedBytes<32>, ClientError> {
    FixedBytes::<32>::from_str(value)
        .map_err(|_| ClientError::Decode(format!("invalid transaction hash: {}", value)))
}

fn bytes32_hex(value: &FixedBytes<32>) -> String {
    format!("0x{}", hex::encode(value))
}

fn call_proof(proof: &AttestationProof) -> Result<IPayment::Proof, ClientError> {
    proof
        .to_call_proof()
        .map_err(|e| ClientError::Decode(e.to_string()))
}

/// Cheapest normal-status agent with enough free lots and a fee within
/// `max_fee_bps`. Ties go to the agent listed first.
pub fn select_agent(
    agents: &[IAssetManager::AvailableAgentInfo],
    lots: u64,
    max_fee_bps: u32,
) -> Option<&IAssetManager::AvailableAgentInfo> {
    agents
        .iter()
        .filter(|a| a.status == AGENT_STATUS_NORMAL)
        .filter(|a| a.freeCollateralLots >= U256::from(lots))
        .filter(|a| a.feeBIPS <= U256::from(max_fee_bps))
        .min_by_key(|a| a.feeBIPS)
}

impl EvmClient {
    pub fn new(config: &EvmConfig, retry: RetryConfig) -> EyreResult<Self> {
        let rpc_url: Url = config.rpc_url.parse().wrap_err("Invalid EVM RPC URL")?;
        let signer: PrivateKeySigner = config
            .private_key
            .parse()
            .wrap_err("Invalid private key")?;
        let asset_manager = Address::from_str(&config.asset_manager_address)
            .wrap_err("Invalid asset manager address")?;
        let fdc_hub =
            Address::from_str(&config.fdc_hub_address).wrap_err("Invalid FDC hub address")?;
        let fdc_fee_config = Address::from_str(&config.fdc_fee_config_address)
            .wrap_err("Invalid FDC fee configuration address")?;
        let fxrp = Address::from_str(&config.fxrp_address).wrap_err("Invalid FXRP address")?;

        info!(
            operator_address = %signer.address(),
            chain_id = config.chain_id,
            asset_manager = %asset_manager,
            "EVM client initialized"
        );

        Ok(Self {
            rpc_url,
            signer,
            asset_manager,
            fdc_hub,
            fdc_fee_config,
            fxrp,
            max_minting_fee_bps: config.max_minting_fee_bps,
            retry,
            lot_size: OnceCell::new(),
        })
    }

    /// Address holding FXRP inventory and vault shares
    pub fn operator_address(&self) -> Address {
        self.signer.address()
    }

    fn wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer.clone())
    }

    /// Chain head, used by the readiness probe
    pub async fn block_number(&self) -> Result<u64, ClientError> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        provider
            .get_block_number()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn ensure_allowance(&self, spender: Address, amount: U256) -> Result<(), ClientError> {
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.wallet())
            .on_http(self.rpc_url.clone());
        let token = IERC20::new(self.fxrp, &provider);

        let current = token
            .allowance(self.operator_address(), spender)
            .call()
            .await
            .map_err(contract_error)?
            ._0;
        if current >= amount {
            return Ok(());
        }

        debug!(spender = %spender, amount = %amount, "Approving FXRP");
        let pending = token
            .approve(spender, amount)
            .send()
            .await
            .map_err(contract_error)?;
        let receipt = pending.get_receipt().await.map_err(receipt_error)?;
        if !receipt.status() {
            return Err(ClientError::rejected("FXRP approve reverted"));
        }
        Ok(())
    }
}

#[async_trait]
impl CollateralClient for EvmClient {
    async fn lot_size_drops(&self) -> Result<u64, ClientError> {
        self.lot_size
            .get_or_try_init(|| async {
                let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
                let manager = IAssetManager::new(self.asset_manager, &provider);
                let lot = with_retry(&self.retry, "lot_size", |_| async {
                    manager.lotSize().call().await.map_err(contract_error)
                })
                .await?;
                to_u64(lot._lotSizeUBA, "lot size")
            })
            .await
            .copied()
    }

    async fn quote(&self, lots: u64) -> Result<CollateralQuote, ClientError> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let manager = IAssetManager::new(self.asset_manager, &provider);

        let listing = with_retry(&self.retry, "available_agents", |_| async {
            manager
                .getAvailableAgentsDetailedList(U256::ZERO, U256::from(AGENT_PAGE))
                .call()
                .await
                .map_err(contract_error)
        })
        .await?;

        let agent = select_agent(&listing._agents, lots, self.max_minting_fee_bps).ok_or_else(|| {
            ClientError::rejected(format!(
                "no agent has {} free lots at a fee of at most {} bps",
                lots, self.max_minting_fee_bps
            ))
        })?;

        let fee = manager
            .collateralReservationFee(U256::from(lots))
            .call()
            .await
            .map_err(contract_error)?
            ._reservationFeeNATWei;

        Ok(CollateralQuote {
            agent_vault: agent.agentVault.to_string(),
            fee_bps: to_u32(agent.feeBIPS, "agent fee")?,
            reservation_fee_wei: u128::try_from(fee)
                .map_err(|_| ClientError::Decode("reservation fee out of range".to_string()))?,
            free_lots: to_u64(agent.freeCollateralLots, "free lots")?,
        })
    }

    async fn reserve_collateral(&self, lots: u64) -> Result<CollateralReservation, ClientError> {
        let quote = self.quote(lots).await?;
        let agent = parse_address(&quote.agent_vault)?;

        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.wallet())
            .on_http(self.rpc_url.clone());
        let manager = IAssetManager::new(self.asset_manager, &provider);

        info!(
            agent_vault = %agent,
            lots,
            fee_bps = quote.fee_bps,
            reservation_fee_wei = quote.reservation_fee_wei,
            "Reserving collateral"
        );

        let pending = manager
            .reserveCollateral(
                agent,
                U256::from(lots),
                U256::from(self.max_minting_fee_bps),
                Address::ZERO,
            )
            .value(U256::from(quote.reservation_fee_wei))
            .send()
            .await
            .map_err(contract_error)?;
        let tx_hash = *pending.tx_hash();
        let receipt = pending.get_receipt().await.map_err(receipt_error)?;
        if !receipt.status() {
            return Err(ClientError::rejected(format!(
                "reserveCollateral reverted (tx 0x{:x})",
                tx_hash
            )));
        }

        let event = receipt
            .inner
            .logs()
            .iter()
            .find_map(|log| log.log_decode::<IAssetManager::CollateralReserved>().ok())
            .ok_or_else(|| ClientError::Decode("no CollateralReserved event in receipt".into()))?;
        let reserved = event.inner.data;

        let value_uba = to_u64(reserved.valueUBA, "valueUBA")?;
        let fee_uba = to_u64(reserved.feeUBA, "feeUBA")?;
        Ok(CollateralReservation {
            reservation_id: reserved.collateralReservationId.to_string(),
            agent_vault: reserved.agentVault.to_string(),
            agent_underlying_address: reserved.paymentAddress,
            value_uba,
            fee_uba,
            fee_bps: quote.fee_bps,
            payment_reference: bytes32_hex(&reserved.paymentReference),
            last_underlying_timestamp: to_u64(
                reserved.lastUnderlyingTimestamp,
                "lastUnderlyingTimestamp",
            )?,
            tx_hash: Some(format!("0x{:x}", tx_hash)),
        })
    }

    async fn reservation(
        &self,
        reservation_id: &str,
    ) -> Result<Option<CollateralReservation>, ClientError> {
        let id = parse_uint(reservation_id, "reservation id")?;
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let manager = IAssetManager::new(self.asset_manager, &provider);

        let info = match manager.collateralReservationInfo(id).call().await {
            Ok(ret) => ret._0,
            Err(e) => {
                return match contract_error(e) {
                    // Unknown or already-finished reservations revert
                    ClientError::Rejected { reason } => {
                        debug!(reservation_id, reason = %reason, "Reservation not found");
                        Ok(None)
                    }
                    other => Err(other),
                };
            }
        };

        let value_uba = to_u64(info.valueUBA, "valueUBA")?;
        let fee_uba = to_u64(info.mintingFeeUBA, "mintingFeeUBA")?;
        let fee_bps = if value_uba == 0 {
            0
        } else {
            ((fee_uba as u128 * 10_000) / value_uba as u128) as u32
        };

        Ok(Some(CollateralReservation {
            reservation_id: reservation_id.to_string(),
            agent_vault: info.agentVault.to_string(),
            agent_underlying_address: info.paymentAddress,
            value_uba,
            fee_uba,
            fee_bps,
            payment_reference: bytes32_hex(&info.paymentReference),
            last_underlying_timestamp: info.lastUnderlyingTimestamp,
            tx_hash: None,
        }))
    }

    async fn simulate_execute_minting(
        &self,
        proof: &AttestationProof,
        reservation_id: &str,
    ) -> Result<(), ClientError> {
        let id = parse_uint(reservation_id, "reservation id")?;
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.wallet())
            .on_http(self.rpc_url.clone());
        let manager = IAssetManager::new(self.asset_manager, &provider);

        manager
            .executeMinting(call_proof(proof)?, id)
            .call()
            .await
            .map(|_| ())
            .map_err(contract_error)
    }

    async fn execute_minting(
        &self,
        proof: &AttestationProof,
        reservation_id: &str,
    ) -> Result<MintReceipt, ClientError> {
        let id = parse_uint(reservation_id, "reservation id")?;
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.wallet())
            .on_http(self.rpc_url.clone());
        let manager = IAssetManager::new(self.asset_manager, &provider);

        let pending = manager
            .executeMinting(call_proof(proof)?, id)
            .send()
            .await
            .map_err(contract_error)?;
        let tx_hash = *pending.tx_hash();
        info!(tx_hash = %tx_hash, reservation_id, "executeMinting sent");

        let receipt = pending.get_receipt().await.map_err(receipt_error)?;
        if !receipt.status() {
            return Err(ClientError::rejected(format!(
                "executeMinting reverted (tx 0x{:x})",
                tx_hash
            )));
        }

        let minted = receipt
            .inner
            .logs()
            .iter()
            .find_map(|log| log.log_decode::<IAssetManager::MintingExecuted>().ok())
            .map(|event| to_u64(event.inner.data.mintedAmountUBA, "mintedAmountUBA"))
            .transpose()?
            .ok_or_else(|| ClientError::Decode("no MintingExecuted event in receipt".into()))?;

        Ok(MintReceipt {
            tx_hash: format!("0x{:x}", tx_hash),
            minted_uba: minted,
        })
    }

    async fn request_redemption(
        &self,
        lots: u64,
        underlying_address: &str,
    ) -> Result<RedemptionTicket, ClientError> {
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.wallet())
            .on_http(self.rpc_url.clone());
        let manager = IAssetManager::new(self.asset_manager, &provider);

        let pending = manager
            .redeem(U256::from(lots), underlying_address.to_string(), Address::ZERO)
            .send()
            .await
            .map_err(contract_error)?;
        let tx_hash = *pending.tx_hash();
        info!(tx_hash = %tx_hash, lots, "FXRP redemption requested");

        let receipt = pending.get_receipt().await.map_err(receipt_error)?;
        if !receipt.status() {
            return Err(ClientError::rejected(format!(
                "redeem reverted (tx 0x{:x})",
                tx_hash
            )));
        }

        let requests: Vec<_> = receipt
            .inner
            .logs()
            .iter()
            .filter_map(|log| log.log_decode::<IAssetManager::RedemptionRequested>().ok())
            .map(|event| event.inner.data)
            .collect();
        if requests.len() > 1 {
            // Lots split across agents; the first ticket is tracked
            warn!(
                tx_hash = %tx_hash,
                tickets = requests.len(),
                "Redemption was split across several agents"
            );
        }
        let request = requests
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Decode("no RedemptionRequested event in receipt".into()))?;

        Ok(RedemptionTicket {
            request_id: to_u64(request.requestId, "requestId")?,
            agent_vault: request.agentVault.to_string(),
            payment_address: request.paymentAddress,
            value_uba: to_u64(request.valueUBA, "valueUBA")?,
            fee_uba: to_u64(request.feeUBA, "feeUBA")?,
            payment_reference: bytes32_hex(&request.paymentReference),
            last_underlying_timestamp: to_u64(
                request.lastUnderlyingTimestamp,
                "lastUnderlyingTimestamp",
            )?,
            tx_hash: format!("0x{:x}", tx_hash),
        })
    }

    async fn simulate_confirm_redemption(
        &self,
        proof: &AttestationProof,
        request_id: u64,
    ) -> Result<(), ClientError> {
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.wallet())
            .on_http(self.rpc_url.clone());
        let manager = IAssetManager::new(self.asset_manager, &provider);

        manager
            .confirmRedemptionPayment(call_proof(proof)?, U256::from(request_id))
            .call()
            .await
            .map(|_| ())
            .map_err(contract_error)
    }

    async fn confirm_redemption_payment(
        &self,
        proof: &AttestationProof,
        request_id: u64,
    ) -> Result<String, ClientError> {
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.wallet())
            .on_http(self.rpc_url.clone());
        let manager = IAssetManager::new(self.asset_manager, &provider);

        let pending = manager
            .confirmRedemptionPayment(call_proof(proof)?, U256::from(request_id))
            .send()
            .await
            .map_err(contract_error)?;
        let tx_hash = *pending.tx_hash();

        let receipt = pending.get_receipt().await.map_err(receipt_error)?;
        if !receipt.status() {
            return Err(ClientError::rejected(format!(
                "confirmRedemptionPayment reverted (tx 0x{:x})",
                tx_hash
            )));
        }
        Ok(format!("0x{:x}", tx_hash))
    }

    async fn transaction_succeeded(&self, tx_hash: &str) -> Result<Option<bool>, ClientError> {
        let hash = parse_tx_hash(tx_hash)?;
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let receipt = provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(receipt.map(|r| r.status()))
    }
}

#[async_trait]
impl VaultClient for EvmClient {
    async fn deposit(&self, vault_address: &str, assets: u64) -> Result<VaultReceipt, ClientError> {
        let vault_address = parse_address(vault_address)?;
        let amount = U256::from(assets);
        self.ensure_allowance(vault_address, amount).await?;

        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.wallet())
            .on_http(self.rpc_url.clone());
        let vault = IERC4626::new(vault_address, &provider);

        let pending = vault
            .deposit(amount, self.operator_address())
            .send()
            .await
            .map_err(contract_error)?;
        let tx_hash = *pending.tx_hash();
        let receipt = pending.get_receipt().await.map_err(receipt_error)?;
        if !receipt.status() {
            return Err(ClientError::rejected(format!(
                "vault deposit reverted (tx 0x{:x})",
                tx_hash
            )));
        }

        let event = receipt
            .inner
            .logs()
            .iter()
            .find_map(|log| log.log_decode::<IERC4626::Deposit>().ok())
            .ok_or_else(|| ClientError::Decode("no Deposit event in receipt".into()))?;
        let shares = u128::try_from(event.inner.data.shares)
            .map_err(|_| ClientError::Decode("minted shares out of range".into()))?;

        info!(tx_hash = %tx_hash, vault = %vault_address, assets, shares, "Vault deposit confirmed");
        Ok(VaultReceipt {
            tx_hash: format!("0x{:x}", tx_hash),
            shares,
            assets,
        })
    }

    async fn redeem(&self, vault_address: &str, shares: u128) -> Result<VaultReceipt, ClientError> {
        let vault_address = parse_address(vault_address)?;
        let operator = self.operator_address();

        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.wallet())
            .on_http(self.rpc_url.clone());
        let vault = IERC4626::new(vault_address, &provider);

        let pending = vault
            .redeem(U256::from(shares), operator, operator)
            .send()
            .await
            .map_err(contract_error)?;
        let tx_hash = *pending.tx_hash();
        let receipt = pending.get_receipt().await.map_err(receipt_error)?;
        if !receipt.status() {
            return Err(ClientError::rejected(format!(
                "vault redeem reverted (tx 0x{:x})",
                tx_hash
            )));
        }

        let event = receipt
            .inner
            .logs()
            .iter()
            .find_map(|log| log.log_decode::<IERC4626::Withdraw>().ok())
            .ok_or_else(|| ClientError::Decode("no Withdraw event in receipt".into()))?;
        let assets = to_u64(event.inner.data.assets, "redeemed assets")?;

        info!(tx_hash = %tx_hash, vault = %vault_address, shares, assets, "Vault shares redeemed");
        Ok(VaultReceipt {
            tx_hash: format!("0x{:x}", tx_hash),
            shares,
            assets,
        })
    }

    async fn preview_redeem(&self, vault_address: &str, shares: u128) -> Result<u64, ClientError> {
        let vault_address = parse_address(vault_address)?;
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let vault = IERC4626::new(vault_address, &provider);

        let assets = with_retry(&self.retry, "preview_redeem", |_| async {
            vault
                .previewRedeem(U256::from(shares))
                .call()
                .await
                .map_err(contract_error)
        })
        .await?;
        to_u64(assets._0, "previewRedeem")
    }
}

#[async_trait]
impl FdcSubmitter for EvmClient {
    async fn submit_attestation_request(&self, request: &[u8]) -> Result<u64, ClientError> {
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.wallet())
            .on_http(self.rpc_url.clone());
        let data = Bytes::copy_from_slice(request);

        let fee_config = IFdcRequestFeeConfigurations::new(self.fdc_fee_config, &provider);
        let fee = fee_config
            .getRequestFee(data.clone())
            .call()
            .await
            .map_err(contract_error)?
            ._0;

        let hub = IFdcHub::new(self.fdc_hub, &provider);
        let pending = hub
            .requestAttestation(data)
            .value(fee)
            .send()
            .await
            .map_err(contract_error)?;
        let tx_hash = *pending.tx_hash();
        let receipt = pending.get_receipt().await.map_err(receipt_error)?;
        if !receipt.status() {
            return Err(ClientError::rejected(format!(
                "requestAttestation reverted (tx 0x{:x})",
                tx_hash
            )));
        }

        let block_number = receipt
            .block_number
            .ok_or_else(|| ClientError::Decode("receipt has no block number".into()))?;
        let block = provider
            .get_block_by_number(
                BlockNumberOrTag::Number(block_number),
                BlockTransactionsKind::Hashes,
            )
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?
            .ok_or_else(|| ClientError::NotFound(format!("block {}", block_number)))?;

        debug!(tx_hash = %tx_hash, block_number, fee = %fee, "Attestation request included");
        Ok(block.header.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(byte: u8, fee_bps: u64, free_lots: u64, status: u8) -> IAssetManager::AvailableAgentInfo {
        IAssetManager::AvailableAgentInfo {
            agentVault: Address::repeat_byte(byte),
            ownerManagementAddress: Address::ZERO,
            feeBIPS: U256::from(fee_bps),
            mintingVaultCollateralRatioBIPS: U256::from(16_000u64),
            mintingPoolCollateralRatioBIPS: U256::from(20_000u64),
            freeCollateralLots: U256::from(free_lots),
            status,
        }
    }

    #[test]
    fn test_select_cheapest_eligible_agent() {
        let agents = vec![
            agent(1, 50, 10, AGENT_STATUS_NORMAL),
            agent(2, 20, 1, AGENT_STATUS_NORMAL),
            agent(3, 30, 10, AGENT_STATUS_NORMAL),
            agent(4, 10, 10, 1),
        ];
        let chosen = select_agent(&agents, 5, 100).unwrap();
        assert_eq!(chosen.agentVault, Address::repeat_byte(3));

        let chosen = select_agent(&agents, 1, 100).unwrap();
        assert_eq!(chosen.agentVault, Address::repeat_byte(2));
    }

    #[test]
    fn test_no_agent_within_fee_cap() {
        let agents = vec![agent(1, 150, 10, AGENT_STATUS_NORMAL)];
        assert!(select_agent(&agents, 1, 100).is_none());
        assert!(select_agent(&[], 1, 100).is_none());
    }

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(to_u64(U256::from(42u64), "x").unwrap(), 42);
        assert!(to_u64(U256::MAX, "x").is_err());
        assert!(parse_uint("12", "id").is_ok());
        assert!(parse_uint("abc", "id").is_err());
        assert!(parse_address("0x1234").is_err());
    }

    #[test]
    fn test_bytes32_hex() {
        let value = FixedBytes::<32>::repeat_byte(0xab);
        assert_eq!(bytes32_hex(&value), format!("0x{}", "ab".repeat(32)));
    }

    #[test]
    fn test_new_rejects_bad_key() {
        let config = EvmConfig {
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 114,
            private_key: "0x1234".to_string(),
            asset_manager_address: format!("0x{}", "11".repeat(20)),
            fdc_hub_address: format!("0x{}", "22".repeat(20)),
            fdc_fee_config_address: format!("0x{}", "33".repeat(20)),
            fxrp_address: format!("0x{}", "44".repeat(20)),
            max_minting_fee_bps: 100,
        };
        assert!(EvmClient::new(&config, RetryConfig::none()).is_err());

        let config = EvmConfig {
            private_key: format!("0x{}", "01".repeat(32)),
            ..config
        };
        let client = EvmClient::new(&config, RetryConfig::none()).unwrap();
        assert_ne!(client.operator_address(), Address::ZERO);
    }
}
