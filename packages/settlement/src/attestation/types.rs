//! Attestation proof wire types.
//!
//! `AttestationProof` is persisted exactly as the DA layer returned it: the
//! merkle proof and the ABI-encoded `IPayment.Response` as a hex string.
//! The typed view is decoded from those bytes when needed and never encoded
//! back, so field order and numeric widths reach the contract untouched.

use alloy::primitives::{Bytes, FixedBytes};
use alloy::sol_types::SolValue;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SettlementError};
use crate::evm::contracts::IPayment;

/// Status code of a successful payment in `IPayment.ResponseBody.status`
pub const PAYMENT_STATUS_SUCCESS: u8 = 0;

/// Handle for an attestation request submitted to the FDC hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationTicket {
    pub voting_round: u64,
    /// ABI-encoded request as prepared by the verifier (0x hex)
    pub request_bytes: String,
}

impl AttestationTicket {
    /// Ticket persisted as separate round and request columns
    pub fn from_stored(voting_round: Option<u64>, request_bytes: Option<&str>) -> Option<Self> {
        Some(Self {
            voting_round: voting_round?,
            request_bytes: request_bytes?.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationProof {
    pub merkle_proof: Vec<String>,
    pub response_hex: String,
}

/// Fields of a decoded payment attestation the orchestrator checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentAttestation {
    /// Upper-case hex, no 0x prefix, comparable to an XRPL hash
    pub transaction_id: String,
    pub voting_round: u64,
    pub status: u8,
    pub received_drops: i128,
    pub standard_payment_reference: String,
}

fn decode_hex(value: &str) -> Result<Vec<u8>> {
    let trimmed = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(trimmed).map_err(|e| SettlementError::verification(format!("invalid proof hex: {}", e)))
}

impl AttestationProof {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SettlementError::Storage(format!("cannot serialize proof: {}", e)))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SettlementError::verification(format!("stored proof is corrupt: {}", e)))
    }

    pub fn response(&self) -> Result<IPayment::Response> {
        let bytes = decode_hex(&self.response_hex)?;
        IPayment::Response::abi_decode(&bytes, true)
            .map_err(|e| SettlementError::verification(format!("cannot decode proof response: {}", e)))
    }

    pub fn payment(&self) -> Result<PaymentAttestation> {
        let response = self.response()?;
        let received = i128::try_from(response.responseBody.receivedAmount).map_err(|_| {
            SettlementError::verification("attested received amount is out of range")
        })?;

        Ok(PaymentAttestation {
            transaction_id: hex::encode_upper(response.requestBody.transactionId),
            voting_round: response.votingRound,
            status: response.responseBody.status,
            received_drops: received,
            standard_payment_reference: format!(
                "0x{}",
                hex::encode(response.responseBody.standardPaymentReference)
            ),
        })
    }

    /// The `IPayment.Proof` argument for `executeMinting` and
    /// `confirmRedemptionPayment`, built from the stored bytes.
    pub fn to_call_proof(&self) -> Result<IPayment::Proof> {
        let merkle_proof = self
            .merkle_proof
            .iter()
            .map(|node| {
                let bytes = decode_hex(node)?;
                if bytes.len() != 32 {
                    return Err(SettlementError::verification("merkle proof node is not 32 bytes"));
                }
                Ok(FixedBytes::<32>::from_slice(&bytes))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(IPayment::Proof {
            merkleProof: merkle_proof,
            data: self.response()?,
        })
    }

    /// Raw response bytes, for callers that forward them untouched
    pub fn response_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(decode_hex(&self.response_hex)?))
    }
}

/// What a proof must attest before it is submitted on-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofExpectation {
    pub tx_hash: String,
    pub min_received_drops: u64,
    pub payment_reference: Option<String>,
}

/// Check a decoded attestation against the record it will settle.
pub fn check_attestation(proof: &AttestationProof, expected: &ProofExpectation) -> Result<()> {
    let attested = proof.payment()?;

    let expected_hash = expected.tx_hash.trim_start_matches("0x").to_uppercase();
    if attested.transaction_id != expected_hash {
        return Err(SettlementError::verification(format!(
            "proof attests transaction {} but record holds {}",
            attested.transaction_id, expected_hash
        )));
    }
    if attested.status != PAYMENT_STATUS_SUCCESS {
        return Err(SettlementError::verification(format!(
            "proof reports payment status {}",
            attested.status
        )));
    }
    if attested.received_drops < expected.min_received_drops as i128 {
        return Err(SettlementError::verification(format!(
            "proof attests {} drops received, expected at least {}",
            attested.received_drops, expected.min_received_drops
        )));
    }
    if let Some(reference) = &expected.payment_reference {
        if !attested
            .standard_payment_reference
            .eq_ignore_ascii_case(&format!("0x{}", reference.trim_start_matches("0x")))
        {
            return Err(SettlementError::verification(format!(
                "proof payment reference {} does not match {}",
                attested.standard_payment_reference, reference
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_proof;

    const TX: &str = "A1B2C3D4E5F60718293A4B5C6D7E8F90A1B2C3D4E5F60718293A4B5C6D7E8F90";

    #[test]
    fn test_decode_payment_view() {
        let proof = sample_proof(TX, 10_000_000, None, 812_345);
        let payment = proof.payment().unwrap();
        assert_eq!(payment.transaction_id, TX);
        assert_eq!(payment.voting_round, 812_345);
        assert_eq!(payment.status, PAYMENT_STATUS_SUCCESS);
        assert_eq!(payment.received_drops, 10_000_000);
    }

    #[test]
    fn test_stored_json_preserves_response_bytes() {
        let proof = sample_proof(TX, 10_000_000, None, 1);
        let stored = proof.to_json().unwrap();
        let loaded = AttestationProof::from_json(&stored).unwrap();
        assert_eq!(loaded.response_hex, proof.response_hex);
        assert_eq!(loaded.merkle_proof, proof.merkle_proof);
        assert_eq!(loaded.to_call_proof().unwrap().merkleProof.len(), 2);
    }

    #[test]
    fn test_check_attestation() {
        let reference = "0x46425052664100010000000000000000000000000000000000000000000000a1";
        let proof = sample_proof(TX, 10_000_000, Some(reference), 1);
        let mut expected = ProofExpectation {
            tx_hash: TX.to_lowercase(),
            min_received_drops: 10_000_000,
            payment_reference: Some(reference.to_string()),
        };
        assert!(check_attestation(&proof, &expected).is_ok());

        expected.min_received_drops = 10_000_001;
        assert!(check_attestation(&proof, &expected).is_err());

        expected.min_received_drops = 1;
        expected.tx_hash = "00".repeat(32);
        let err = check_attestation(&proof, &expected).unwrap_err();
        assert!(err.to_string().contains("proof attests transaction"));
    }

    #[test]
    fn test_bad_merkle_node_rejected() {
        let mut proof = sample_proof(TX, 1, None, 1);
        proof.merkle_proof.push("0x1234".to_string());
        assert!(proof.to_call_proof().is_err());
    }
}
