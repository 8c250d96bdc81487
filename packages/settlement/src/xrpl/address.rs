//! XRPL classic address encoding
//!
//! ## Address Format
//!
//! A classic address is the base58 (Ripple alphabet) encoding of:
//! ```text
//! | Version 0x00 (1 byte) | Account ID (20 bytes) | Checksum (4 bytes) |
//! ```
//! The checksum is the first four bytes of `sha256(sha256(version ‖ id))`,
//! and the account ID is `ripemd160(sha256(public_key))`.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::{Result, SettlementError};

const ACCOUNT_ID_VERSION: u8 = 0x00;

/// Derive the 20-byte account ID for a 33-byte signing public key
/// (secp256k1 compressed, or 0xED-prefixed ed25519).
pub fn account_id_from_public_key(public_key: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(public_key);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; 4];
    out.copy_from_slice(&second[..4]);
    out
}

/// Encode an account ID as an `r...` address
pub fn encode_classic_address(account_id: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(25);
    payload.push(ACCOUNT_ID_VERSION);
    payload.extend_from_slice(account_id);
    let check = checksum(&payload);
    payload.extend_from_slice(&check);

    bs58::encode(payload)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .into_string()
}

/// Decode an `r...` address into its account ID, verifying the checksum
pub fn decode_classic_address(address: &str) -> Result<[u8; 20]> {
    let bytes = bs58::decode(address)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .into_vec()
        .map_err(|e| SettlementError::validation(format!("invalid XRPL address: {}", e)))?;

    if bytes.len() != 25 || bytes[0] != ACCOUNT_ID_VERSION {
        return Err(SettlementError::validation(format!(
            "invalid XRPL address: {}",
            address
        )));
    }
    if checksum(&bytes[..21]) != bytes[21..] {
        return Err(SettlementError::validation(format!(
            "invalid XRPL address checksum: {}",
            address
        )));
    }

    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes[1..21]);
    Ok(out)
}

pub fn is_valid_classic_address(address: &str) -> bool {
    address.starts_with('r') && decode_classic_address(address).is_ok()
}

/// Classic address controlled by `public_key`
pub fn address_from_public_key(public_key: &[u8]) -> String {
    encode_classic_address(&account_id_from_public_key(public_key))
}
