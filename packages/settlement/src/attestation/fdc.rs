//! Flare Data Connector oracle
//!
//! A Payment attestation takes three hops: the verifier prepares the
//! ABI-encoded request, the FdcHub accepts it on-chain for a fee, and once
//! the voting round finalizes the DA layer serves the merkle proof.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::types::{AttestationProof, AttestationTicket};
use super::AttestationOracle;
use crate::config::AttestationConfig;
use crate::error::ClientError;
use crate::retry::{with_retry, RetryConfig};

const ATTESTATION_TYPE: &str = "Payment";
const VERIFIER_CHAIN: &str = "xrp";

/// On-chain half of an attestation request.
#[async_trait]
pub trait FdcSubmitter: Send + Sync {
    /// Pay the request fee and submit `request` to the FdcHub. Returns the
    /// timestamp of the block that included it.
    async fn submit_attestation_request(&self, request: &[u8]) -> Result<u64, ClientError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrepareResponse {
    status: String,
    abi_encoded_request: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DaProofResponse {
    #[serde(default)]
    proof: Vec<String>,
    response_hex: Option<String>,
}

/// UTF-8 name right-padded to 32 bytes, as the FDC encodes type and source ids.
pub fn encode_bytes32_str(value: &str) -> String {
    let mut bytes = [0u8; 32];
    let raw = value.as_bytes();
    let len = raw.len().min(32);
    bytes[..len].copy_from_slice(&raw[..len]);
    format!("0x{}", hex::encode(bytes))
}

pub fn voting_round_for(block_timestamp: u64, first_round_start_ts: u64, round_duration_secs: u64) -> u64 {
    if round_duration_secs == 0 {
        return 0;
    }
    block_timestamp.saturating_sub(first_round_start_ts) / round_duration_secs
}

fn parse_prepare(response: PrepareResponse) -> Result<String, ClientError> {
    if response.status != "VALID" {
        return Err(ClientError::rejected(format!(
            "verifier returned status {}",
            response.status
        )));
    }
    response
        .abi_encoded_request
        .filter(|r| r.len() > 2)
        .ok_or_else(|| ClientError::Decode("verifier response has no abiEncodedRequest".into()))
}

fn parse_proof(response: DaProofResponse) -> Option<AttestationProof> {
    let response_hex = response.response_hex.filter(|r| r.len() > 2)?;
    Some(AttestationProof {
        merkle_proof: response.proof,
        response_hex,
    })
}

pub struct FdcOracle {
    http: Client,
    verifier_url: String,
    verifier_api_key: String,
    da_layer_url: String,
    source_id: String,
    first_round_start_ts: u64,
    round_duration_secs: u64,
    submitter: Arc<dyn FdcSubmitter>,
    retry: RetryConfig,
}

impl FdcOracle {
    pub fn new(
        config: &AttestationConfig,
        submitter: Arc<dyn FdcSubmitter>,
        retry: RetryConfig,
    ) -> eyre::Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            verifier_url: config.verifier_url.trim_end_matches('/').to_string(),
            verifier_api_key: config.verifier_api_key.clone(),
            da_layer_url: config.da_layer_url.trim_end_matches('/').to_string(),
            source_id: config.source_id.clone(),
            first_round_start_ts: config.first_round_start_ts,
            round_duration_secs: config.round_duration_secs,
            submitter,
            retry,
        })
    }

    async fn prepare_request(&self, tx_hash: &str) -> Result<String, ClientError> {
        let url = format!(
            "{}/verifier/{}/{}/prepareRequest",
            self.verifier_url, VERIFIER_CHAIN, ATTESTATION_TYPE
        );
        let body = json!({
            "attestationType": encode_bytes32_str(ATTESTATION_TYPE),
            "sourceId": encode_bytes32_str(&self.source_id),
            "requestBody": {
                "transactionId": format!("0x{}", tx_hash.trim_start_matches("0x")),
                "inUtxo": "0",
                "utxo": "0",
            },
        });

        let response = self
            .http
            .post(&url)
            .header("X-API-KEY", &self.verifier_api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ClientError::Transport(format!("verifier HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(ClientError::rejected(format!("verifier HTTP {}", status)));
        }

        let parsed: PrepareResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        parse_prepare(parsed)
    }
}

#[async_trait]
impl AttestationOracle for FdcOracle {
    async fn request(&self, tx_hash: &str) -> Result<AttestationTicket, ClientError> {
        let request_hex = with_retry(&self.retry, "fdc_prepare", |_| self.prepare_request(tx_hash)).await?;
        let request_bytes = hex::decode(request_hex.trim_start_matches("0x"))
            .map_err(|e| ClientError::Decode(format!("abiEncodedRequest is not hex: {}", e)))?;

        let block_timestamp = self.submitter.submit_attestation_request(&request_bytes).await?;
        let voting_round = voting_round_for(
            block_timestamp,
            self.first_round_start_ts,
            self.round_duration_secs,
        );

        info!(tx_hash = %tx_hash, voting_round, "FDC attestation request submitted");
        Ok(AttestationTicket {
            voting_round,
            request_bytes: request_hex,
        })
    }

    async fn fetch(
        &self,
        ticket: &AttestationTicket,
    ) -> Result<Option<AttestationProof>, ClientError> {
        let url = format!("{}/api/v1/fdc/proof-by-request-round-raw", self.da_layer_url);
        let body = json!({
            "votingRoundId": ticket.voting_round,
            "requestBytes": ticket.request_bytes,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ClientError::Transport(format!("DA layer HTTP {}", status)));
        }
        // The DA layer answers 400/404 until the round is finalized
        if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
            debug!(voting_round = ticket.voting_round, %status, "Proof not available yet");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ClientError::rejected(format!("DA layer HTTP {}", status)));
        }

        let parsed: DaProofResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(parse_proof(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_bytes32_str() {
        assert_eq!(
            encode_bytes32_str("Payment"),
            "0x5061796d656e7400000000000000000000000000000000000000000000000000"
        );
        assert_eq!(
            encode_bytes32_str("testXRP"),
            "0x7465737458525000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn test_voting_round() {
        assert_eq!(voting_round_for(1_658_430_000, 1_658_430_000, 90), 0);
        assert_eq!(voting_round_for(1_658_430_089, 1_658_430_000, 90), 0);
        assert_eq!(voting_round_for(1_658_430_090, 1_658_430_000, 90), 1);
        assert_eq!(voting_round_for(1_760_000_000, 1_658_430_000, 90), 1_128_555);
        assert_eq!(voting_round_for(5, 10, 90), 0);
    }

    #[test]
    fn test_parse_prepare_response() {
        let valid: PrepareResponse = serde_json::from_value(json!({
            "status": "VALID",
            "abiEncodedRequest": "0x5061"
        }))
        .unwrap();
        assert_eq!(parse_prepare(valid).unwrap(), "0x5061");

        let invalid: PrepareResponse =
            serde_json::from_value(json!({"status": "INVALID: TRANSACTION NOT FOUND"})).unwrap();
        assert!(matches!(parse_prepare(invalid), Err(ClientError::Rejected { .. })));

        let empty: PrepareResponse =
            serde_json::from_value(json!({"status": "VALID", "abiEncodedRequest": "0x"})).unwrap();
        assert!(matches!(parse_prepare(empty), Err(ClientError::Decode(_))));
    }

    #[test]
    fn test_parse_da_proof() {
        let ready: DaProofResponse = serde_json::from_value(json!({
            "proof": ["0x01", "0x02"],
            "response_hex": "0xabcd",
            "attestation_type": "0x5061"
        }))
        .unwrap();
        let proof = parse_proof(ready).unwrap();
        assert_eq!(proof.merkle_proof.len(), 2);
        assert_eq!(proof.response_hex, "0xabcd");

        let pending: DaProofResponse = serde_json::from_value(json!({})).unwrap();
        assert!(parse_proof(pending).is_none());
    }
}
