//! XRPL JSON-RPC client with endpoint fallback.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{LedgerClient, LedgerMemo, LedgerTransaction, SubmitResult};
use crate::error::ClientError;
use crate::retry::{with_retry, RetryConfig};

/// JSON-RPC envelope returned by rippled / clio
#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Value,
}

/// `tx` response, only the fields we read
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TxResult {
    #[serde(rename = "hash")]
    hash: Option<String>,
    #[serde(rename = "validated", default)]
    validated: bool,
    transaction_type: Option<String>,
    account: Option<String>,
    destination: Option<String>,
    destination_tag: Option<u32>,
    amount: Option<Value>,
    #[serde(default)]
    memos: Vec<MemoWrapper>,
    #[serde(rename = "meta")]
    meta: Option<TxMeta>,
    #[serde(rename = "ledger_index")]
    ledger_index: Option<u64>,
    #[serde(rename = "date")]
    date: Option<u64>,
    /// API v2 nests the transaction fields under `tx_json`
    #[serde(rename = "tx_json")]
    tx_json: Option<Box<TxResult>>,
}

#[derive(Debug, Deserialize)]
struct MemoWrapper {
    #[serde(rename = "Memo")]
    memo: MemoFields,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MemoFields {
    memo_data: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TxMeta {
    #[serde(rename = "TransactionResult")]
    transaction_result: Option<String>,
    delivered_amount: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    engine_result: Option<String>,
    engine_result_message: Option<String>,
    #[serde(default)]
    accepted: Option<bool>,
    tx_json: Option<Value>,
}

/// XRP amounts are strings of drops; issued currencies are objects.
fn drops(value: Option<&Value>) -> Option<u64> {
    value.and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
}

impl TxResult {
    fn into_transaction(self, requested_hash: &str) -> LedgerTransaction {
        // Merge v2 nested fields over the top level
        let inner = self.tx_json.map(|b| *b).unwrap_or_default();
        let meta = self.meta.unwrap_or_default();

        let memos = inner
            .memos
            .into_iter()
            .chain(self.memos)
            .filter_map(|m| m.memo.memo_data)
            .map(|data| LedgerMemo::from_hex(&data))
            .collect();

        LedgerTransaction {
            hash: self
                .hash
                .or(inner.hash)
                .unwrap_or_else(|| requested_hash.to_string())
                .to_uppercase(),
            validated: self.validated,
            transaction_type: inner
                .transaction_type
                .or(self.transaction_type)
                .unwrap_or_default(),
            account: inner.account.or(self.account).unwrap_or_default(),
            destination: inner.destination.or(self.destination),
            destination_tag: inner.destination_tag.or(self.destination_tag),
            amount_drops: drops(inner.amount.as_ref().or(self.amount.as_ref())),
            delivered_drops: drops(meta.delivered_amount.as_ref()),
            result_code: meta.transaction_result,
            memos,
            ledger_index: self.ledger_index,
            close_time: self.date.or(inner.date),
        }
    }
}

/// JSON-RPC client trying each configured endpoint in order.
pub struct XrplRpcClient {
    urls: Vec<String>,
    client: Client,
    retry: RetryConfig,
}

impl XrplRpcClient {
    pub fn new(urls: Vec<String>, retry: RetryConfig) -> eyre::Result<Self> {
        if urls.is_empty() {
            return Err(eyre::eyre!("At least one XRPL RPC URL is required"));
        }
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            urls,
            client,
            retry,
        })
    }

    /// One JSON-RPC call with endpoint fallback. Node-level `error` results
    /// are mapped to `ClientError` without trying other endpoints.
    async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let body = json!({ "method": method, "params": [params] });
        let mut last_error = ClientError::Transport("no endpoints tried".to_string());

        for url in &self.urls {
            let response = match self.client.post(url).json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(url = %url, method, error = %e, "XRPL endpoint unreachable");
                    last_error = ClientError::Transport(e.to_string());
                    continue;
                }
            };
            if response.status().is_server_error() {
                warn!(url = %url, method, status = %response.status(), "XRPL endpoint error");
                last_error = ClientError::Transport(format!("HTTP {}", response.status()));
                continue;
            }

            let parsed: RpcResponse = response
                .json()
                .await
                .map_err(|e| ClientError::Decode(e.to_string()))?;
            return check_result(parsed.result);
        }

        Err(last_error)
    }
}

fn check_result(result: Value) -> Result<Value, ClientError> {
    if result.get("status").and_then(Value::as_str) == Some("error") {
        let code = result
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        if code == "txnNotFound" {
            return Err(ClientError::NotFound(code));
        }
        let message = result
            .get("error_message")
            .and_then(Value::as_str)
            .map(|m| format!("{}: {}", code, m))
            .unwrap_or(code);
        return Err(ClientError::rejected(message));
    }
    Ok(result)
}

fn parse_tx(result: Value, hash: &str) -> Result<LedgerTransaction, ClientError> {
    let parsed: TxResult =
        serde_json::from_value(result).map_err(|e| ClientError::Decode(e.to_string()))?;
    Ok(parsed.into_transaction(hash))
}

/// `account_tx` entries; API v1 nests the transaction under `tx`.
fn parse_account_tx(result: Value) -> Result<Vec<LedgerTransaction>, ClientError> {
    let entries = match result.get("transactions") {
        Some(Value::Array(entries)) => entries.clone(),
        _ => return Err(ClientError::Decode("account_tx without transactions".to_string())),
    };

    entries
        .into_iter()
        .map(|mut entry| {
            if let Some(obj) = entry.as_object_mut() {
                if let Some(tx) = obj.remove("tx") {
                    obj.entry("tx_json").or_insert(tx);
                }
            }
            parse_tx(entry, "")
        })
        .collect()
}

fn parse_submit(result: Value) -> Result<SubmitResult, ClientError> {
    let parsed: SubmitResponse =
        serde_json::from_value(result).map_err(|e| ClientError::Decode(e.to_string()))?;
    let engine_result = parsed
        .engine_result
        .ok_or_else(|| ClientError::Decode("missing engine_result".to_string()))?;
    let tx_hash = parsed
        .tx_json
        .as_ref()
        .and_then(|tx| tx.get("hash"))
        .and_then(Value::as_str)
        .map(|h| h.to_uppercase());
    let accepted = parsed
        .accepted
        .unwrap_or(engine_result == super::TES_SUCCESS || engine_result.starts_with("ter"));

    Ok(SubmitResult {
        engine_result,
        engine_result_message: parsed.engine_result_message,
        tx_hash,
        accepted,
    })
}

#[async_trait]
impl LedgerClient for XrplRpcClient {
    async fn get_transaction(&self, hash: &str) -> Result<Option<LedgerTransaction>, ClientError> {
        let params = json!({ "transaction": hash, "binary": false });
        let result = with_retry(&self.retry, "xrpl_tx", |_| self.call("tx", params.clone())).await;

        match result {
            Ok(value) => parse_tx(value, hash).map(Some),
            Err(ClientError::NotFound(_)) => {
                debug!(tx_hash = %hash, "Transaction not found on ledger");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn submit(&self, signed_blob: &str) -> Result<SubmitResult, ClientError> {
        // Not retried: a resubmission of the same blob is harmless but the
        // caller decides based on the engine result
        let result = self
            .call("submit", json!({ "tx_blob": signed_blob }))
            .await?;
        parse_submit(result)
    }

    async fn account_payments(
        &self,
        account: &str,
        limit: u32,
    ) -> Result<Vec<LedgerTransaction>, ClientError> {
        let params = json!({
            "account": account,
            "ledger_index_min": -1,
            "ledger_index_max": -1,
            "limit": limit,
            "forward": false,
        });
        let result = with_retry(&self.retry, "xrpl_account_tx", |_| {
            self.call("account_tx", params.clone())
        })
        .await?;
        parse_account_tx(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v1_payment() {
        let result = json!({
            "Account": "rQrFNnvPGNNMqRcVRMbtBK3hpYaPzoa8K9",
            "Amount": "10000000",
            "Destination": "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh",
            "DestinationTag": 42,
            "TransactionType": "Payment",
            "Memos": [{"Memo": {"MemoData": "68656C6C6F"}}],
            "hash": "abcd",
            "ledger_index": 123,
            "date": 800000000,
            "meta": {"TransactionResult": "tesSUCCESS", "delivered_amount": "10000000"},
            "validated": true,
            "status": "success"
        });

        let tx = parse_tx(check_result(result).unwrap(), "ABCD").unwrap();
        assert_eq!(tx.hash, "ABCD");
        assert!(tx.validated);
        assert!(tx.succeeded());
        assert_eq!(tx.transaction_type, "Payment");
        assert_eq!(tx.destination_tag, Some(42));
        assert_eq!(tx.amount_drops, Some(10_000_000));
        assert_eq!(tx.delivered_drops, Some(10_000_000));
        assert_eq!(tx.memos[0].data_text.as_deref(), Some("hello"));
        assert_eq!(tx.ledger_index, Some(123));
    }

    #[test]
    fn test_parse_v2_nested_tx_json() {
        let result = json!({
            "hash": "EF01",
            "tx_json": {
                "Account": "rQrFNnvPGNNMqRcVRMbtBK3hpYaPzoa8K9",
                "Destination": "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh",
                "TransactionType": "Payment",
                "DeliverMax": "5"
            },
            "meta": {"TransactionResult": "tecPATH_DRY"},
            "validated": false
        });

        let tx = parse_tx(result, "EF01").unwrap();
        assert!(!tx.validated);
        assert!(!tx.succeeded());
        assert_eq!(tx.account, "rQrFNnvPGNNMqRcVRMbtBK3hpYaPzoa8K9");
        assert_eq!(tx.amount_drops, None);
    }

    #[test]
    fn test_issued_currency_amount_is_not_drops() {
        let result = json!({
            "TransactionType": "Payment",
            "Amount": {"currency": "USD", "issuer": "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh", "value": "1"},
            "validated": true
        });
        let tx = parse_tx(result, "AA").unwrap();
        assert_eq!(tx.amount_drops, None);
    }

    #[test]
    fn test_error_results() {
        let not_found = json!({"status": "error", "error": "txnNotFound"});
        assert!(matches!(check_result(not_found), Err(ClientError::NotFound(_))));

        let bad = json!({"status": "error", "error": "invalidParams", "error_message": "bad hash"});
        assert_eq!(
            check_result(bad).unwrap_err(),
            ClientError::rejected("invalidParams: bad hash")
        );
    }

    #[test]
    fn test_parse_submit() {
        let result = json!({
            "engine_result": "tesSUCCESS",
            "engine_result_message": "The transaction was applied.",
            "accepted": true,
            "tx_json": {"hash": "abc"}
        });
        let submit = parse_submit(result).unwrap();
        assert!(submit.accepted);
        assert_eq!(submit.tx_hash.as_deref(), Some("ABC"));

        let rejected = parse_submit(json!({"engine_result": "tefPAST_SEQ"})).unwrap();
        assert!(!rejected.accepted);
    }

    #[test]
    fn test_parse_account_tx_both_api_versions() {
        let result = json!({
            "account": "rQrFNnvPGNNMqRcVRMbtBK3hpYaPzoa8K9",
            "transactions": [
                {
                    "tx": {
                        "Account": "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh",
                        "Destination": "rQrFNnvPGNNMqRcVRMbtBK3hpYaPzoa8K9",
                        "TransactionType": "Payment",
                        "Amount": "9990000",
                        "hash": "aa11"
                    },
                    "meta": {"TransactionResult": "tesSUCCESS", "delivered_amount": "9990000"},
                    "validated": true
                },
                {
                    "hash": "BB22",
                    "tx_json": {"TransactionType": "AccountSet", "Account": "rQrFNnvPGNNMqRcVRMbtBK3hpYaPzoa8K9"},
                    "meta": {"TransactionResult": "tesSUCCESS"},
                    "validated": true
                }
            ]
        });

        let txs = parse_account_tx(result).unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].hash, "AA11");
        assert_eq!(txs[0].delivered_drops, Some(9_990_000));
        assert_eq!(txs[0].account, "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh");
        assert_eq!(txs[1].hash, "BB22");
        assert_eq!(txs[1].transaction_type, "AccountSet");

        assert!(parse_account_tx(json!({"status": "success"})).is_err());
    }

    #[test]
    fn test_requires_url() {
        assert!(XrplRpcClient::new(vec![], RetryConfig::none()).is_err());
    }
}
