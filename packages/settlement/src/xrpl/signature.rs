//! Signature verification for single-signed XRPL transactions.

use ed25519_dalek::{Signature as EdSignature, VerifyingKey};
use secp256k1::{ecdsa::Signature as EcdsaSignature, Message, PublicKey, SECP256K1};

use super::codec::{sha512_half, DecodedTransaction};
use crate::error::{Result, SettlementError};

const ED25519_PREFIX: u8 = 0xED;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Secp256k1,
    Ed25519,
}

pub fn key_type(public_key: &[u8]) -> Result<KeyType> {
    match public_key {
        [ED25519_PREFIX, rest @ ..] if rest.len() == 32 => Ok(KeyType::Ed25519),
        [0x02 | 0x03, rest @ ..] if rest.len() == 32 => Ok(KeyType::Secp256k1),
        _ => Err(SettlementError::verification("unsupported signing public key")),
    }
}

/// Verify `signature` by `public_key` over a serialized signing payload.
///
/// secp256k1 signs SHA-512Half of the payload with a DER signature;
/// ed25519 signs the payload itself.
pub fn verify(public_key: &[u8], payload: &[u8], signature: &[u8]) -> Result<()> {
    match key_type(public_key)? {
        KeyType::Secp256k1 => {
            let key = PublicKey::from_slice(public_key)
                .map_err(|e| SettlementError::verification(format!("invalid public key: {}", e)))?;
            let mut sig = EcdsaSignature::from_der(signature)
                .or_else(|_| EcdsaSignature::from_der_lax(signature))
                .map_err(|e| SettlementError::verification(format!("invalid signature: {}", e)))?;
            sig.normalize_s();
            let message = Message::from_digest(sha512_half(payload));
            SECP256K1
                .verify_ecdsa(&message, &sig, &key)
                .map_err(|_| SettlementError::verification("signature does not match"))
        }
        KeyType::Ed25519 => {
            let raw: [u8; 32] = public_key[1..]
                .try_into()
                .map_err(|_| SettlementError::verification("invalid ed25519 key length"))?;
            let key = VerifyingKey::from_bytes(&raw)
                .map_err(|e| SettlementError::verification(format!("invalid public key: {}", e)))?;
            let sig = EdSignature::from_slice(signature)
                .map_err(|e| SettlementError::verification(format!("invalid signature: {}", e)))?;
            key.verify_strict(payload, &sig)
                .map_err(|_| SettlementError::verification("signature does not match"))
        }
    }
}

/// Verify a decoded transaction's own signature over its signing payload.
pub fn verify_transaction(tx: &DecodedTransaction) -> Result<()> {
    verify(&tx.signing_pub_key, &tx.signing_payload, &tx.txn_signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xrpl::address::address_from_public_key;
    use crate::xrpl::codec::decode_signed_transaction_hex;
    use crate::xrpl::codec::tests::{
        ED25519_ACCOUNT_SET, ED25519_ADDRESS, SECP_ACCOUNT_SET, SECP_ADDRESS, SECP_PAYMENT,
    };

    #[test]
    fn test_verify_secp256k1_blob() {
        let tx = decode_signed_transaction_hex(SECP_ACCOUNT_SET).unwrap();
        assert_eq!(key_type(&tx.signing_pub_key).unwrap(), KeyType::Secp256k1);
        verify_transaction(&tx).unwrap();
        assert_eq!(address_from_public_key(&tx.signing_pub_key), SECP_ADDRESS);

        let payment = decode_signed_transaction_hex(SECP_PAYMENT).unwrap();
        verify_transaction(&payment).unwrap();
    }

    #[test]
    fn test_verify_ed25519_blob() {
        let tx = decode_signed_transaction_hex(ED25519_ACCOUNT_SET).unwrap();
        assert_eq!(key_type(&tx.signing_pub_key).unwrap(), KeyType::Ed25519);
        verify_transaction(&tx).unwrap();
        assert_eq!(address_from_public_key(&tx.signing_pub_key), ED25519_ADDRESS);
    }

    #[test]
    fn test_tampered_payload_fails() {
        for blob in [SECP_ACCOUNT_SET, ED25519_ACCOUNT_SET] {
            let mut tx = decode_signed_transaction_hex(blob).unwrap();
            let last = tx.signing_payload.len() - 3;
            tx.signing_payload[last] ^= 0x01;
            assert!(verify_transaction(&tx).is_err());
        }
    }

    #[test]
    fn test_signature_from_other_key_fails() {
        let secp = decode_signed_transaction_hex(SECP_ACCOUNT_SET).unwrap();
        let ed = decode_signed_transaction_hex(ED25519_ACCOUNT_SET).unwrap();
        assert!(verify(&ed.signing_pub_key, &secp.signing_payload, &ed.txn_signature).is_err());
    }

    #[test]
    fn test_unknown_key_prefix() {
        assert!(key_type(&[0x04; 33]).is_err());
        assert!(key_type(&[0xED; 10]).is_err());
    }
}
