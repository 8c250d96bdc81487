//! Scripted collaborator doubles
//!
//! In-process stand-ins for the ledger, the collateral system, the vaults
//! and the attestation oracle. Unit tests and the integration tests under
//! `tests/` wire them into the state machines together with `MemoryStore`.
//! Each fake counts calls per operation and can be told to fail one.

use alloy::primitives::{FixedBytes, I256, U256};
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::amounts::minting_fee_drops;
use crate::attestation::{AttestationOracle, AttestationProof, AttestationTicket, ProofService};
use crate::bridge::{BridgeService, BridgeSettings, CreateBridgeRequest};
use crate::cancellation::CancellationService;
use crate::db::{MemoryStore, NewRedemption, Store};
use crate::error::ClientError;
use crate::evm::contracts::IPayment;
use crate::evm::{
    CollateralClient, CollateralQuote, CollateralReservation, MintReceipt, RedemptionTicket,
    VaultClient, VaultReceipt,
};
use crate::recovery::{RecoveryService, RecoverySettings};
use crate::redemption::{RedemptionService, RedemptionSettings};
use crate::types::SettlementKind;
use crate::vaults::{VaultConfig, VaultRegistry};
use crate::xrpl::{LedgerClient, LedgerMemo, LedgerTransaction, SubmitResult, TES_SUCCESS};

/// Agent XRPL address used by `FakeCollateral` reservations
pub const AGENT_ADDRESS: &str = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";
/// Default sender of `payment_tx`
pub const USER_ADDRESS: &str = "rQrFNnvPGNNMqRcVRMbtBK3hpYaPzoa8K9";
pub const AGENT_VAULT: &str = "0x1111111111111111111111111111111111111111";
/// A second valid wallet, also the escrow vault's receiving address
pub const OTHER_ADDRESS: &str = "rrrrrrrrrrrrrrrrrrrrBZbvji";

/// Vault shares per FXRP drop (18 vs 6 decimals)
pub const SHARES_PER_DROP: u128 = 1_000_000_000_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-operation call counters and scripted failures.
#[derive(Default)]
pub struct Script {
    calls: Mutex<HashMap<&'static str, u32>>,
    failures: Mutex<HashMap<&'static str, ClientError>>,
}

impl Script {
    /// Make every call to `op` fail with `error` until `clear` is called.
    pub fn fail(&self, op: &'static str, error: ClientError) {
        lock(&self.failures).insert(op, error);
    }

    pub fn clear(&self, op: &'static str) {
        lock(&self.failures).remove(op);
    }

    pub fn calls(&self, op: &'static str) -> u32 {
        lock(&self.calls).get(op).copied().unwrap_or(0)
    }

    fn enter(&self, op: &'static str) -> Result<(), ClientError> {
        *lock(&self.calls).entry(op).or_insert(0) += 1;
        match lock(&self.failures).get(op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// A validated, successful XRP payment from `USER_ADDRESS`.
pub fn payment_tx(hash: &str, destination: &str, drops: u64) -> LedgerTransaction {
    LedgerTransaction {
        hash: hash.to_uppercase(),
        validated: true,
        transaction_type: "Payment".to_string(),
        account: USER_ADDRESS.to_string(),
        destination: Some(destination.to_string()),
        amount_drops: Some(drops),
        delivered_drops: Some(drops),
        result_code: Some(TES_SUCCESS.to_string()),
        ledger_index: Some(1),
        ..Default::default()
    }
}

/// A validated payout from `AGENT_ADDRESS` to `destination` carrying
/// `reference` as its memo.
pub fn payout_tx(hash: &str, destination: &str, drops: u64, reference: &str) -> LedgerTransaction {
    LedgerTransaction {
        account: AGENT_ADDRESS.to_string(),
        memos: vec![LedgerMemo::from_hex(reference.trim_start_matches("0x"))],
        ledger_index: Some(2),
        ..payment_tx(hash, destination, drops)
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Ledger double with scripted transactions.
#[derive(Default)]
pub struct FakeLedger {
    txs: Mutex<HashMap<String, LedgerTransaction>>,
    /// Number of lookups answered with "not found" before transactions appear
    pub visible_after: AtomicU32,
    pub lookups: AtomicU32,
    submitted: Mutex<Vec<String>>,
    /// Transaction recorded for each submitted blob, keyed by blob
    on_submit: Mutex<HashMap<String, LedgerTransaction>>,
    pub script: Script,
}

impl FakeLedger {
    pub fn with(tx: LedgerTransaction) -> Self {
        let fake = Self::default();
        fake.insert(tx);
        fake
    }

    pub fn insert(&self, tx: LedgerTransaction) {
        lock(&self.txs).insert(tx.hash.to_uppercase(), tx);
    }

    /// When `blob` is submitted, make `tx` visible on the ledger.
    pub fn settle_on_submit(&self, blob: &str, tx: LedgerTransaction) {
        lock(&self.on_submit).insert(blob.to_uppercase(), tx);
    }

    pub fn submitted(&self) -> Vec<String> {
        lock(&self.submitted).clone()
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn get_transaction(&self, hash: &str) -> Result<Option<LedgerTransaction>, ClientError> {
        let n = self.lookups.fetch_add(1, Ordering::SeqCst);
        self.script.enter("get_transaction")?;
        if n < self.visible_after.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(lock(&self.txs).get(&hash.to_uppercase()).cloned())
    }

    async fn submit(&self, signed_blob: &str) -> Result<SubmitResult, ClientError> {
        self.script.enter("submit")?;
        lock(&self.submitted).push(signed_blob.to_string());
        let settled = lock(&self.on_submit).remove(&signed_blob.to_uppercase());
        let tx_hash = settled.as_ref().map(|tx| tx.hash.clone());
        if let Some(tx) = settled {
            self.insert(tx);
        }
        Ok(SubmitResult {
            engine_result: TES_SUCCESS.to_string(),
            engine_result_message: None,
            tx_hash,
            accepted: true,
        })
    }

    async fn account_payments(
        &self,
        account: &str,
        limit: u32,
    ) -> Result<Vec<LedgerTransaction>, ClientError> {
        self.script.enter("account_payments")?;
        let mut txs: Vec<_> = lock(&self.txs)
            .values()
            .filter(|tx| tx.account == account || tx.destination.as_deref() == Some(account))
            .cloned()
            .collect();
        txs.sort_by(|a, b| b.ledger_index.cmp(&a.ledger_index));
        txs.truncate(limit as usize);
        Ok(txs)
    }
}

// ============================================================================
// Collateral system
// ============================================================================

pub struct FakeCollateral {
    pub lot_size: u64,
    pub fee_bps: u32,
    /// Redemption fee charged by the agent, in basis points
    pub redemption_fee_bps: u32,
    /// Seconds from now until a redemption's payment deadline
    pub redemption_deadline_secs: AtomicI64,
    next_id: AtomicU64,
    next_tx: AtomicU64,
    reservations: Mutex<HashMap<String, CollateralReservation>>,
    redemptions: Mutex<Vec<(u64, String)>>,
    receipts: Mutex<HashMap<String, bool>>,
    pub script: Script,
}

impl FakeCollateral {
    pub fn new(lot_size: u64) -> Self {
        Self {
            lot_size,
            fee_bps: 25,
            redemption_fee_bps: 10,
            redemption_deadline_secs: AtomicI64::new(3600),
            next_id: AtomicU64::new(1),
            next_tx: AtomicU64::new(1),
            reservations: Mutex::new(HashMap::new()),
            redemptions: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
            script: Script::default(),
        }
    }

    /// `(request id, underlying address)` of every redemption requested
    pub fn redemptions(&self) -> Vec<(u64, String)> {
        lock(&self.redemptions).clone()
    }

    pub fn set_receipt(&self, tx_hash: &str, succeeded: bool) {
        lock(&self.receipts).insert(tx_hash.to_string(), succeeded);
    }

    fn tx_hash(&self) -> String {
        let hash = format!("0x{:064x}", 0xc011_0000 + self.next_tx.fetch_add(1, Ordering::SeqCst));
        self.set_receipt(&hash, true);
        hash
    }
}

#[async_trait]
impl CollateralClient for FakeCollateral {
    async fn lot_size_drops(&self) -> Result<u64, ClientError> {
        self.script.enter("lot_size")?;
        Ok(self.lot_size)
    }

    async fn quote(&self, lots: u64) -> Result<CollateralQuote, ClientError> {
        self.script.enter("quote")?;
        Ok(CollateralQuote {
            agent_vault: AGENT_VAULT.to_string(),
            fee_bps: self.fee_bps,
            reservation_fee_wei: lots as u128 * 1_000_000_000_000_000,
            free_lots: 1_000,
        })
    }

    async fn reserve_collateral(&self, lots: u64) -> Result<CollateralReservation, ClientError> {
        self.script.enter("reserve")?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let value_uba = lots * self.lot_size;
        let reservation = CollateralReservation {
            reservation_id: id.to_string(),
            agent_vault: AGENT_VAULT.to_string(),
            agent_underlying_address: AGENT_ADDRESS.to_string(),
            value_uba,
            fee_uba: minting_fee_drops(value_uba, self.fee_bps),
            fee_bps: self.fee_bps,
            payment_reference: format!("0x4642505266410001{:048x}", id),
            last_underlying_timestamp: (Utc::now().timestamp() + 3600) as u64,
            tx_hash: Some(self.tx_hash()),
        };
        lock(&self.reservations).insert(reservation.reservation_id.clone(), reservation.clone());
        Ok(reservation)
    }

    async fn reservation(
        &self,
        reservation_id: &str,
    ) -> Result<Option<CollateralReservation>, ClientError> {
        self.script.enter("reservation")?;
        Ok(lock(&self.reservations).get(reservation_id).cloned())
    }

    async fn simulate_execute_minting(
        &self,
        _proof: &AttestationProof,
        reservation_id: &str,
    ) -> Result<(), ClientError> {
        self.script.enter("simulate_mint")?;
        if !lock(&self.reservations).contains_key(reservation_id) {
            return Err(ClientError::rejected("invalid crt id"));
        }
        Ok(())
    }

    async fn execute_minting(
        &self,
        _proof: &AttestationProof,
        reservation_id: &str,
    ) -> Result<MintReceipt, ClientError> {
        self.script.enter("mint")?;
        let reservation = lock(&self.reservations)
            .remove(reservation_id)
            .ok_or_else(|| ClientError::rejected("invalid crt id"))?;
        Ok(MintReceipt {
            tx_hash: self.tx_hash(),
            minted_uba: reservation.value_uba,
        })
    }

    async fn request_redemption(
        &self,
        lots: u64,
        underlying_address: &str,
    ) -> Result<RedemptionTicket, ClientError> {
        self.script.enter("redeem")?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.redemptions).push((id, underlying_address.to_string()));
        let value_uba = lots * self.lot_size;
        let deadline = Utc::now().timestamp() + self.redemption_deadline_secs.load(Ordering::SeqCst);
        Ok(RedemptionTicket {
            request_id: id,
            agent_vault: AGENT_VAULT.to_string(),
            payment_address: underlying_address.to_string(),
            value_uba,
            fee_uba: minting_fee_drops(value_uba, self.redemption_fee_bps),
            payment_reference: format!("0x4642505266410002{:048x}", id),
            last_underlying_timestamp: deadline.max(0) as u64,
            tx_hash: self.tx_hash(),
        })
    }

    async fn simulate_confirm_redemption(
        &self,
        _proof: &AttestationProof,
        _request_id: u64,
    ) -> Result<(), ClientError> {
        self.script.enter("simulate_confirm")
    }

    async fn confirm_redemption_payment(
        &self,
        _proof: &AttestationProof,
        _request_id: u64,
    ) -> Result<String, ClientError> {
        self.script.enter("confirm")?;
        Ok(self.tx_hash())
    }

    async fn transaction_succeeded(&self, tx_hash: &str) -> Result<Option<bool>, ClientError> {
        self.script.enter("receipt")?;
        Ok(lock(&self.receipts).get(tx_hash).copied())
    }
}

// ============================================================================
// Vault
// ============================================================================

/// ERC-4626 double at a fixed 1:1 price (shares carry 12 extra decimals).
#[derive(Default)]
pub struct FakeVault {
    next_tx: AtomicU64,
    pub script: Script,
}

impl FakeVault {
    fn tx_hash(&self) -> String {
        format!("0x{:064x}", 0xbeef_0000 + self.next_tx.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl VaultClient for FakeVault {
    async fn deposit(&self, _vault_address: &str, assets: u64) -> Result<VaultReceipt, ClientError> {
        self.script.enter("deposit")?;
        Ok(VaultReceipt {
            tx_hash: self.tx_hash(),
            shares: assets as u128 * SHARES_PER_DROP,
            assets,
        })
    }

    async fn redeem(&self, _vault_address: &str, shares: u128) -> Result<VaultReceipt, ClientError> {
        self.script.enter("redeem")?;
        Ok(VaultReceipt {
            tx_hash: self.tx_hash(),
            shares,
            assets: (shares / SHARES_PER_DROP) as u64,
        })
    }

    async fn preview_redeem(&self, _vault_address: &str, shares: u128) -> Result<u64, ClientError> {
        self.script.enter("preview_redeem")?;
        Ok((shares / SHARES_PER_DROP) as u64)
    }
}

// ============================================================================
// Attestation oracle
// ============================================================================

/// Oracle double. Tickets carry the transaction hash as their request
/// bytes; `fetch` serves whatever proof was registered for that hash.
#[derive(Default)]
pub struct FakeOracle {
    proofs: Mutex<HashMap<String, AttestationProof>>,
    fetch_delay: Mutex<Duration>,
    pub requests: AtomicU32,
    pub fetches: AtomicU32,
    pub script: Script,
}

impl FakeOracle {
    pub fn finalized_for(tx_hash: &str, received_drops: u64, reference: Option<&str>) -> Self {
        let oracle = Self::default();
        oracle.add_proof(tx_hash, received_drops, reference);
        oracle
    }

    pub fn add_proof(&self, tx_hash: &str, received_drops: u64, reference: Option<&str>) {
        let key = tx_hash.trim_start_matches("0x").to_uppercase();
        let proof = sample_proof(&key, received_drops, reference, 100);
        lock(&self.proofs).insert(key, proof);
    }

    /// Make every `fetch` take `delay`, like a slow DA layer.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *lock(&self.fetch_delay) = delay;
    }

    /// Forget every registered proof so rounds never finalize.
    pub fn clear_proofs(&self) {
        lock(&self.proofs).clear();
    }
}

#[async_trait]
impl AttestationOracle for FakeOracle {
    async fn request(&self, tx_hash: &str) -> Result<AttestationTicket, ClientError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        self.script.enter("request")?;
        Ok(AttestationTicket {
            voting_round: 100 + n as u64,
            request_bytes: format!("0x{}", tx_hash.trim_start_matches("0x").to_uppercase()),
        })
    }

    async fn fetch(
        &self,
        ticket: &AttestationTicket,
    ) -> Result<Option<AttestationProof>, ClientError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.fetch_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.script.enter("fetch")?;
        let key = ticket.request_bytes.trim_start_matches("0x").to_uppercase();
        Ok(lock(&self.proofs).get(&key).cloned())
    }
}

fn bytes32(raw: &[u8]) -> FixedBytes<32> {
    let mut out = [0u8; 32];
    let len = raw.len().min(32);
    out[..len].copy_from_slice(&raw[..len]);
    FixedBytes::from(out)
}

/// A DA-layer style proof attesting a successful payment of
/// `received_drops` in transaction `tx_hash`.
pub fn sample_proof(
    tx_hash: &str,
    received_drops: u64,
    reference: Option<&str>,
    voting_round: u64,
) -> AttestationProof {
    let tx_bytes = hex::decode(tx_hash.trim_start_matches("0x")).unwrap_or_default();
    let reference_bytes = reference
        .and_then(|r| hex::decode(r.trim_start_matches("0x")).ok())
        .unwrap_or_default();
    let amount = I256::from_raw(U256::from(received_drops));

    let response = IPayment::Response {
        attestationType: bytes32(b"Payment"),
        sourceId: bytes32(b"testXRP"),
        votingRound: voting_round,
        lowestUsedTimestamp: 1_760_000_000,
        requestBody: IPayment::RequestBody {
            transactionId: bytes32(&tx_bytes),
            inUtxo: U256::ZERO,
            utxo: U256::ZERO,
        },
        responseBody: IPayment::ResponseBody {
            blockNumber: 1_000,
            blockTimestamp: 1_760_000_000,
            sourceAddressHash: bytes32(&[0x5a; 32]),
            sourceAddressesRoot: bytes32(&[0x5b; 32]),
            receivingAddressHash: bytes32(&[0x5c; 32]),
            intendedReceivingAddressHash: bytes32(&[0x5c; 32]),
            spentAmount: amount,
            intendedSpentAmount: amount,
            receivedAmount: amount,
            intendedReceivedAmount: amount,
            standardPaymentReference: bytes32(&reference_bytes),
            oneToOne: true,
            status: 0,
        },
    };

    AttestationProof {
        merkle_proof: vec![format!("0x{}", "11".repeat(32)), format!("0x{}", "22".repeat(32))],
        response_hex: format!("0x{}", hex::encode(response.abi_encode())),
    }
}

// ============================================================================
// Harness
// ============================================================================

/// The state machines wired to fresh fakes and a `MemoryStore`.
///
/// Vaults: `fxrp-core` (attested mint), `fxrp-soon` (not yet available)
/// and `fxrp-escrow` (escrow settlement to `OTHER_ADDRESS`). One lot is
/// 10 XRP and ledger polling never sleeps.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<FakeLedger>,
    pub collateral: Arc<FakeCollateral>,
    pub vault: Arc<FakeVault>,
    pub oracle: Arc<FakeOracle>,
    pub vaults: Arc<VaultRegistry>,
    pub bridges: Arc<BridgeService>,
    pub redemptions: Arc<RedemptionService>,
    pub recovery: Arc<RecoveryService>,
    pub cancellation: Arc<CancellationService>,
}

fn test_vault(id: &str, n: u8, settlement: SettlementKind, available: bool) -> VaultConfig {
    VaultConfig {
        id: id.to_string(),
        name: id.to_string(),
        vault_address: format!("0x{}", format!("{:02x}", n).repeat(20)),
        settlement,
        escrow_address: (settlement == SettlementKind::Escrow).then(|| OTHER_ADDRESS.to_string()),
        available,
    }
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(FakeLedger::default());
        let collateral = Arc::new(FakeCollateral::new(10_000_000));
        let vault = Arc::new(FakeVault::default());
        let oracle = Arc::new(FakeOracle::default());
        let vaults = Arc::new(
            VaultRegistry::new(vec![
                test_vault("fxrp-core", 0xa1, SettlementKind::AttestedMint, true),
                test_vault("fxrp-soon", 0xa2, SettlementKind::AttestedMint, false),
                test_vault("fxrp-escrow", 0xa3, SettlementKind::Escrow, true),
            ])
            .expect("test vaults are valid"),
        );
        let proofs = Arc::new(ProofService::new(oracle.clone(), Duration::ZERO, 2));

        let bridges = Arc::new(BridgeService::new(
            store.clone(),
            ledger.clone(),
            collateral.clone(),
            vault.clone(),
            proofs.clone(),
            vaults.clone(),
            BridgeSettings {
                ttl: chrono::Duration::minutes(30),
                confirm_attempts: 2,
                confirm_interval: Duration::ZERO,
            },
        ));
        let redemptions = Arc::new(RedemptionService::new(
            store.clone(),
            ledger.clone(),
            collateral.clone(),
            vault.clone(),
            proofs,
            vaults.clone(),
            RedemptionSettings {
                confirm_attempts: 2,
                confirm_interval: Duration::ZERO,
                payout_scan_limit: 20,
            },
        ));
        let recovery = Arc::new(RecoveryService::new(
            store.clone(),
            bridges.clone(),
            redemptions.clone(),
            RecoverySettings::default(),
        ));
        let cancellation = Arc::new(CancellationService::new(
            store.clone(),
            chrono::Duration::minutes(5),
        ));

        Self {
            store,
            ledger,
            collateral,
            vault,
            oracle,
            vaults,
            bridges,
            redemptions,
            recovery,
            cancellation,
        }
    }

    /// A bridge for `amount` XRP into `fxrp-core`, routed and awaiting payment.
    pub async fn reserved_bridge(&self, amount: &str) -> Uuid {
        self.reserved_bridge_in("fxrp-core", amount).await
    }

    pub async fn reserved_bridge_in(&self, vault_id: &str, amount: &str) -> Uuid {
        let created = self
            .bridges
            .create(&CreateBridgeRequest {
                wallet_address: USER_ADDRESS.to_string(),
                vault_id: vault_id.to_string(),
                amount: amount.to_string(),
                position_id: None,
            })
            .await
            .unwrap();
        self.bridges.reserve(created.bridge_id).await.unwrap();
        created.bridge_id
    }

    /// Put the exact payment the bridge asks for on the ledger and register
    /// its attestation with the oracle.
    pub async fn pay(&self, id: Uuid, hash: &str) {
        let bridge = self.store.get_bridge(id).await.unwrap().unwrap();
        let route = bridge.route().unwrap();
        let total = route.reserved_base_drops + route.reserved_fee_drops;
        let mut tx = payment_tx(hash, &route.agent_underlying_address, total);
        if let Some(reference) = route.payment_reference.as_deref() {
            tx.memos = vec![LedgerMemo::from_hex(reference.trim_start_matches("0x"))];
        }
        self.ledger.insert(tx);
        self.oracle
            .add_proof(hash, total, route.payment_reference.as_deref());
    }

    /// A paid bridge in `xrpl_confirmed`.
    pub async fn confirmed_bridge(&self, amount: &str, hash: &str) -> Uuid {
        let id = self.reserved_bridge(amount).await;
        self.pay(id, hash).await;
        self.bridges.confirm_payment(id, hash).await.unwrap();
        id
    }

    /// A `pending` redemption of `xrp` worth of shares from a 50 XRP
    /// position. Returns `(redemption id, position id)`.
    pub async fn pending_redemption(&self, xrp: u64) -> (Uuid, Uuid) {
        let position = self
            .store
            .seed_position(USER_ADDRESS, "fxrp-core", 50_000_000 * SHARES_PER_DROP)
            .await;
        let redemption = self
            .store
            .insert_redemption(&NewRedemption {
                id: Uuid::new_v4(),
                position_id: position.id,
                wallet_address: USER_ADDRESS.to_string(),
                vault_id: "fxrp-core".to_string(),
                shares: xrp as u128 * 1_000_000 * SHARES_PER_DROP,
            })
            .await
            .unwrap();
        (redemption.id, position.id)
    }

    /// Have the agent pay out a redemption that is awaiting its payout.
    pub async fn agent_pays(&self, id: Uuid, hash: &str) {
        let r = self.store.get_redemption(id).await.unwrap().unwrap();
        let drops = r.xrp_sent_drops.unwrap();
        let reference = r.payment_reference.unwrap();
        self.ledger
            .insert(payout_tx(hash, &r.wallet_address, drops, &reference));
        self.oracle.add_proof(hash, drops, Some(&reference));
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
