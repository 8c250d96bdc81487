//! Native ledger (XRPL) access and payment verification
//!
//! The ledger client is a collaborator behind the `LedgerClient` trait; the
//! checks a payment must pass before a bridge or redemption may advance
//! live here as pure functions over `LedgerTransaction`.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::amounts::format_drops;
use crate::error::{ClientError, Result, SettlementError};

pub mod address;
pub mod codec;
pub mod rpc;
pub mod signature;

pub use rpc::XrplRpcClient;

pub const TES_SUCCESS: &str = "tesSUCCESS";

/// Memo attached to a ledger transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerMemo {
    /// MemoData as upper-case hex, exactly as on the ledger
    pub data_hex: String,
    /// MemoData decoded as UTF-8 when it is valid text
    pub data_text: Option<String>,
}

impl LedgerMemo {
    pub fn from_hex(data_hex: &str) -> Self {
        let data_text = hex::decode(data_hex)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        Self {
            data_hex: data_hex.to_uppercase(),
            data_text,
        }
    }
}

/// The fields of a ledger transaction this service acts on. Anything else
/// in the node's response is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    pub hash: String,
    pub validated: bool,
    pub transaction_type: String,
    pub account: String,
    pub destination: Option<String>,
    pub destination_tag: Option<u32>,
    /// `Amount` in drops; `None` for issued-currency amounts
    pub amount_drops: Option<u64>,
    /// `meta.delivered_amount` in drops
    pub delivered_drops: Option<u64>,
    pub result_code: Option<String>,
    pub memos: Vec<LedgerMemo>,
    pub ledger_index: Option<u64>,
    /// Ripple-epoch close time
    pub close_time: Option<u64>,
}

impl LedgerTransaction {
    pub fn succeeded(&self) -> bool {
        self.result_code.as_deref() == Some(TES_SUCCESS)
    }

    /// Delivered amount when the node reports one, else the stated amount
    pub fn received_drops(&self) -> Option<u64> {
        self.delivered_drops.or(self.amount_drops)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub engine_result: String,
    pub engine_result_message: Option<String>,
    pub tx_hash: Option<String>,
    /// Whether the node queued or applied the transaction
    pub accepted: bool,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// `Ok(None)` when the node does not know the transaction.
    async fn get_transaction(&self, hash: &str) -> Result<Option<LedgerTransaction>, ClientError>;

    /// Submit a fully signed transaction blob (hex).
    async fn submit(&self, signed_blob: &str) -> Result<SubmitResult, ClientError>;

    /// Most recent transactions touching `account`, newest first.
    async fn account_payments(
        &self,
        account: &str,
        limit: u32,
    ) -> Result<Vec<LedgerTransaction>, ClientError>;
}

// ============================================================================
// Payment verification
// ============================================================================

/// What a payment must look like to advance a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentExpectation {
    pub destination: String,
    pub min_drops: u64,
    /// Sender, when the record binds one
    pub source: Option<String>,
    /// 32-byte payment reference (hex) that must appear as a memo
    pub payment_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentCheckFailure {
    #[error("transaction is not validated")]
    NotValidated,
    #[error("transaction failed with {0}")]
    Unsuccessful(String),
    #[error("transaction is a {0}, expected Payment")]
    WrongType(String),
    #[error("destination {actual} does not match expected {expected}")]
    WrongDestination { expected: String, actual: String },
    #[error("sender {actual} does not match expected {expected}")]
    WrongSource { expected: String, actual: String },
    #[error("payment is not in XRP")]
    NonXrpAmount,
    #[error("amount {actual} XRP is below expected {expected} XRP")]
    InsufficientAmount { expected: String, actual: String },
    #[error("payment reference {0} not found in memos")]
    MissingReference(String),
}

impl From<PaymentCheckFailure> for SettlementError {
    fn from(failure: PaymentCheckFailure) -> Self {
        SettlementError::verification(failure.to_string())
    }
}

fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

/// Check a ledger transaction against what the record expects.
pub fn verify_payment(
    tx: &LedgerTransaction,
    expectation: &PaymentExpectation,
) -> std::result::Result<(), PaymentCheckFailure> {
    if !tx.validated {
        return Err(PaymentCheckFailure::NotValidated);
    }
    if !tx.succeeded() {
        return Err(PaymentCheckFailure::Unsuccessful(
            tx.result_code.clone().unwrap_or_else(|| "unknown".to_string()),
        ));
    }
    if tx.transaction_type != "Payment" {
        return Err(PaymentCheckFailure::WrongType(tx.transaction_type.clone()));
    }

    let actual_destination = tx.destination.clone().unwrap_or_default();
    if actual_destination != expectation.destination {
        return Err(PaymentCheckFailure::WrongDestination {
            expected: expectation.destination.clone(),
            actual: actual_destination,
        });
    }

    if let Some(source) = &expectation.source {
        if &tx.account != source {
            return Err(PaymentCheckFailure::WrongSource {
                expected: source.clone(),
                actual: tx.account.clone(),
            });
        }
    }

    let received = tx.received_drops().ok_or(PaymentCheckFailure::NonXrpAmount)?;
    if received < expectation.min_drops {
        return Err(PaymentCheckFailure::InsufficientAmount {
            expected: format_drops(expectation.min_drops),
            actual: format_drops(received),
        });
    }

    if let Some(reference) = &expectation.payment_reference {
        let wanted = strip_hex_prefix(reference);
        let found = tx
            .memos
            .iter()
            .any(|memo| memo.data_hex.eq_ignore_ascii_case(wanted));
        if !found {
            return Err(PaymentCheckFailure::MissingReference(reference.clone()));
        }
    }

    Ok(())
}

/// First transaction in `txs` that satisfies `expectation`.
pub fn find_payment<'a>(
    txs: &'a [LedgerTransaction],
    expectation: &PaymentExpectation,
) -> Option<&'a LedgerTransaction> {
    txs.iter().find(|tx| verify_payment(tx, expectation).is_ok())
}

/// Normalize a user-supplied transaction hash to 64 upper-case hex chars.
pub fn normalize_tx_hash(hash: &str) -> Result<String> {
    let trimmed = hash.trim();
    if trimmed.len() != 64 || hex::decode(trimmed).is_err() {
        return Err(SettlementError::validation(
            "xrplTxHash must be a 64-character hex string",
        ));
    }
    Ok(trimmed.to_uppercase())
}

// ============================================================================
// Validation polling
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Validated with tesSUCCESS
    Validated(LedgerTransaction),
    /// Validated with a failure result code
    Failed(LedgerTransaction),
    /// Never reported validated within the attempt budget
    ValidationTimeout,
}

/// Poll the ledger until `hash` is validated, with fixed backoff.
///
/// Transport errors count as an attempt and are logged; they never end the
/// polling early.
pub async fn await_validation(
    client: &dyn LedgerClient,
    hash: &str,
    attempts: u32,
    interval: Duration,
) -> Result<ValidationOutcome> {
    for attempt in 1..=attempts {
        match client.get_transaction(hash).await {
            Ok(Some(tx)) if tx.validated => {
                debug!(tx_hash = %hash, attempt, "Ledger transaction validated");
                return Ok(if tx.succeeded() {
                    ValidationOutcome::Validated(tx)
                } else {
                    ValidationOutcome::Failed(tx)
                });
            }
            Ok(_) => {
                debug!(tx_hash = %hash, attempt, "Ledger transaction not yet validated");
            }
            Err(e) => {
                warn!(tx_hash = %hash, attempt, error = %e, "Ledger lookup failed");
            }
        }

        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    Ok(ValidationOutcome::ValidationTimeout)
}
