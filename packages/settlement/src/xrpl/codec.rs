//! XRPL binary codec, decode side only
//!
//! Walks a signed transaction blob field by field. Besides the handful of
//! fields the cancellation protocol reads, it rebuilds the signing payload
//! by dropping the signature fields from the canonical serialization, which
//! is exactly the byte string the wallet signed.

use sha2::{Digest, Sha512};

use crate::error::{Result, SettlementError};

/// Prefix prepended to the serialized fields before single-signing
pub const SIGNING_PREFIX: [u8; 4] = [0x53, 0x54, 0x58, 0x00];

/// Prefix used when hashing a signed blob into its transaction id
pub const TX_ID_PREFIX: [u8; 4] = [0x54, 0x58, 0x4E, 0x00];

pub const TT_PAYMENT: u16 = 0;
pub const TT_ACCOUNT_SET: u16 = 3;

// Type codes
const ST_UINT16: u16 = 1;
const ST_UINT32: u16 = 2;
const ST_UINT64: u16 = 3;
const ST_HASH128: u16 = 4;
const ST_HASH256: u16 = 5;
const ST_AMOUNT: u16 = 6;
const ST_BLOB: u16 = 7;
const ST_ACCOUNT: u16 = 8;
const ST_OBJECT: u16 = 14;
const ST_ARRAY: u16 = 15;
const ST_UINT8: u16 = 16;
const ST_HASH160: u16 = 17;
const ST_PATHSET: u16 = 18;
const ST_VECTOR256: u16 = 19;
const ST_UINT96: u16 = 20;
const ST_HASH192: u16 = 21;
const ST_UINT384: u16 = 22;
const ST_UINT512: u16 = 23;
const ST_ISSUE: u16 = 24;
const ST_CURRENCY: u16 = 26;

// (type, field) pairs this decoder cares about
const TRANSACTION_TYPE: (u16, u16) = (ST_UINT16, 2);
const SEQUENCE: (u16, u16) = (ST_UINT32, 4);
const LAST_LEDGER_SEQUENCE: (u16, u16) = (ST_UINT32, 27);
const SIGNING_PUB_KEY: (u16, u16) = (ST_BLOB, 3);
const TXN_SIGNATURE: (u16, u16) = (ST_BLOB, 4);
const ACCOUNT: (u16, u16) = (ST_ACCOUNT, 1);
const DESTINATION: (u16, u16) = (ST_ACCOUNT, 3);
const SIGNERS: (u16, u16) = (ST_ARRAY, 3);
const MEMOS: (u16, u16) = (ST_ARRAY, 9);
const MEMO: (u16, u16) = (ST_OBJECT, 10);
const MEMO_TYPE: (u16, u16) = (ST_BLOB, 12);
const MEMO_DATA: (u16, u16) = (ST_BLOB, 13);
const MEMO_FORMAT: (u16, u16) = (ST_BLOB, 14);

const OBJECT_END: (u16, u16) = (ST_OBJECT, 1);
const ARRAY_END: (u16, u16) = (ST_ARRAY, 1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memo {
    pub memo_type: Option<Vec<u8>>,
    pub memo_data: Option<Vec<u8>>,
    pub memo_format: Option<Vec<u8>>,
}

impl Memo {
    /// MemoData as UTF-8, if it is valid UTF-8
    pub fn data_utf8(&self) -> Option<&str> {
        self.memo_data
            .as_deref()
            .and_then(|d| std::str::from_utf8(d).ok())
    }
}

/// Fields of a decoded single-signed transaction
#[derive(Debug, Clone)]
pub struct DecodedTransaction {
    pub transaction_type: u16,
    pub account: [u8; 20],
    pub destination: Option<[u8; 20]>,
    pub sequence: Option<u32>,
    pub last_ledger_sequence: Option<u32>,
    pub signing_pub_key: Vec<u8>,
    pub txn_signature: Vec<u8>,
    pub memos: Vec<Memo>,
    /// `STX\0` followed by every signing field, in blob order
    pub signing_payload: Vec<u8>,
    /// SHA-512Half of `TXN\0 ‖ blob`, upper-case hex
    pub hash: String,
}

pub fn sha512_half(data: &[u8]) -> [u8; 32] {
    let full = Sha512::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&full[..32]);
    out
}

fn decode_err(msg: impl Into<String>) -> SettlementError {
    SettlementError::verification(format!("malformed transaction blob: {}", msg.into()))
}

/// Largest blob accepted for decoding. Ledger transactions are far smaller.
pub const MAX_BLOB_BYTES: usize = 64 * 1024;

/// Deepest STObject/STArray nesting accepted. Transactions nest a few levels.
const MAX_NESTING_DEPTH: usize = 8;

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, depth: 0 }
    }

    /// Read fields up to `end`, one nesting level down.
    fn nested(&mut self, end: (u16, u16)) -> Result<&'a [u8]> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(decode_err("objects nested too deeply"));
        }
        self.depth += 1;
        let start = self.pos;
        loop {
            let header = self.field_header()?;
            if header == end {
                break;
            }
            self.value(header.0)?;
        }
        self.depth -= 1;
        Ok(&self.data[start..self.pos])
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| decode_err("unexpected end of data"))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| decode_err("unexpected end of data"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn field_header(&mut self) -> Result<(u16, u16)> {
        let b = self.byte()?;
        let mut type_code = (b >> 4) as u16;
        let mut field_code = (b & 0x0F) as u16;
        if type_code == 0 {
            type_code = self.byte()? as u16;
            if field_code == 0 {
                field_code = self.byte()? as u16;
            }
        } else if field_code == 0 {
            field_code = self.byte()? as u16;
        }
        Ok((type_code, field_code))
    }

    fn vl_length(&mut self) -> Result<usize> {
        let b1 = self.byte()? as usize;
        match b1 {
            0..=192 => Ok(b1),
            193..=240 => {
                let b2 = self.byte()? as usize;
                Ok(193 + (b1 - 193) * 256 + b2)
            }
            241..=254 => {
                let b2 = self.byte()? as usize;
                let b3 = self.byte()? as usize;
                Ok(12481 + (b1 - 241) * 65536 + b2 * 256 + b3)
            }
            _ => Err(decode_err("invalid length prefix")),
        }
    }

    fn vl(&mut self) -> Result<&'a [u8]> {
        let len = self.vl_length()?;
        self.take(len)
    }

    /// Skip (or read, for VL types) the value of a field of `type_code`.
    fn value(&mut self, type_code: u16) -> Result<&'a [u8]> {
        match type_code {
            ST_UINT8 => self.take(1),
            ST_UINT16 => self.take(2),
            ST_UINT32 => self.take(4),
            ST_UINT64 => self.take(8),
            ST_UINT96 => self.take(12),
            ST_HASH128 => self.take(16),
            ST_HASH160 | ST_CURRENCY => self.take(20),
            ST_HASH192 => self.take(24),
            ST_HASH256 => self.take(32),
            ST_UINT384 => self.take(48),
            ST_UINT512 => self.take(64),
            ST_AMOUNT => {
                let first = *self
                    .data
                    .get(self.pos)
                    .ok_or_else(|| decode_err("unexpected end of data"))?;
                if first & 0x80 != 0 {
                    self.take(48)
                } else if first & 0x20 != 0 {
                    self.take(33)
                } else {
                    self.take(8)
                }
            }
            ST_BLOB | ST_ACCOUNT | ST_VECTOR256 => self.vl(),
            ST_ISSUE => {
                let currency = self.take(20)?;
                if currency.iter().all(|b| *b == 0) {
                    Ok(currency)
                } else {
                    self.take(20)?;
                    Ok(&self.data[self.pos - 40..self.pos])
                }
            }
            ST_PATHSET => {
                let start = self.pos;
                loop {
                    let step = self.byte()?;
                    match step {
                        0x00 => break,
                        0xFF => continue,
                        flags => {
                            if flags & 0x01 != 0 {
                                self.take(20)?;
                            }
                            if flags & 0x10 != 0 {
                                self.take(20)?;
                            }
                            if flags & 0x20 != 0 {
                                self.take(20)?;
                            }
                        }
                    }
                }
                Ok(&self.data[start..self.pos])
            }
            ST_OBJECT => self.nested(OBJECT_END),
            ST_ARRAY => self.nested(ARRAY_END),
            other => Err(decode_err(format!("unsupported field type {}", other))),
        }
    }
}

fn account_id(raw: &[u8]) -> Result<[u8; 20]> {
    raw.try_into()
        .map_err(|_| decode_err("account field is not 20 bytes"))
}

fn decode_memos(raw: &[u8]) -> Result<Vec<Memo>> {
    let mut cursor = Cursor::new(raw);
    let mut memos = Vec::new();
    loop {
        let header = cursor.field_header()?;
        if header == ARRAY_END {
            break;
        }
        if header != MEMO {
            return Err(decode_err("Memos array holds a non-Memo element"));
        }
        let mut memo = Memo::default();
        loop {
            let inner = cursor.field_header()?;
            if inner == OBJECT_END {
                break;
            }
            let value = cursor.value(inner.0)?;
            match inner {
                MEMO_TYPE => memo.memo_type = Some(value.to_vec()),
                MEMO_DATA => memo.memo_data = Some(value.to_vec()),
                MEMO_FORMAT => memo.memo_format = Some(value.to_vec()),
                _ => {}
            }
        }
        memos.push(memo);
    }
    Ok(memos)
}

/// Decode a single-signed transaction blob.
pub fn decode_signed_transaction(blob: &[u8]) -> Result<DecodedTransaction> {
    if blob.len() > MAX_BLOB_BYTES {
        return Err(decode_err(format!("blob exceeds {} bytes", MAX_BLOB_BYTES)));
    }
    let mut cursor = Cursor::new(blob);
    let mut signing_payload = SIGNING_PREFIX.to_vec();

    let mut transaction_type = None;
    let mut account = None;
    let mut destination = None;
    let mut sequence = None;
    let mut last_ledger_sequence = None;
    let mut signing_pub_key = None;
    let mut txn_signature = None;
    let mut memos = Vec::new();

    while !cursor.is_empty() {
        let start = cursor.pos;
        let header = cursor.field_header()?;
        let value = cursor.value(header.0)?;

        match header {
            TRANSACTION_TYPE => {
                transaction_type = Some(u16::from_be_bytes([value[0], value[1]]));
            }
            SEQUENCE => {
                sequence = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
            }
            LAST_LEDGER_SEQUENCE => {
                last_ledger_sequence =
                    Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
            }
            SIGNING_PUB_KEY => signing_pub_key = Some(value.to_vec()),
            TXN_SIGNATURE => txn_signature = Some(value.to_vec()),
            ACCOUNT => account = Some(account_id(value)?),
            DESTINATION => destination = Some(account_id(value)?),
            SIGNERS => return Err(decode_err("multi-signed transactions are not supported")),
            // value runs through the array terminator
            MEMOS => memos = decode_memos(value)?,
            _ => {}
        }

        if header != TXN_SIGNATURE {
            signing_payload.extend_from_slice(&blob[start..cursor.pos]);
        }
    }

    let signing_pub_key = signing_pub_key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| decode_err("missing SigningPubKey"))?;

    let mut hashed = TX_ID_PREFIX.to_vec();
    hashed.extend_from_slice(blob);

    Ok(DecodedTransaction {
        transaction_type: transaction_type.ok_or_else(|| decode_err("missing TransactionType"))?,
        account: account.ok_or_else(|| decode_err("missing Account"))?,
        destination,
        sequence,
        last_ledger_sequence,
        signing_pub_key,
        txn_signature: txn_signature.ok_or_else(|| decode_err("missing TxnSignature"))?,
        memos,
        signing_payload,
        hash: hex::encode_upper(sha512_half(&hashed)),
    })
}

/// Decode a hex-encoded blob
pub fn decode_signed_transaction_hex(blob_hex: &str) -> Result<DecodedTransaction> {
    let blob_hex = blob_hex.trim();
    if blob_hex.len() > MAX_BLOB_BYTES * 2 {
        return Err(decode_err(format!("blob exceeds {} bytes", MAX_BLOB_BYTES)));
    }
    let blob = hex::decode(blob_hex)
        .map_err(|_| SettlementError::validation("signedTxBlob must be hex encoded"))?;
    decode_signed_transaction(&blob)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::xrpl::address::encode_classic_address;

    pub const CANCEL_MESSAGE: &str =
        "cancel:7f1b3c8e-2d4a-4e5b-9c6d-0a1b2c3d4e5f:1760000000000";

    /// AccountSet carrying `CANCEL_MESSAGE`, secp256k1-signed
    pub const SECP_ACCOUNT_SET: &str = "12000322000000002400000007201B000003E868400000000000000C7321034F355BDCB7CC0AF728EF3CCEB9615D90684BB5B2CA5F859AB0F0B704075871AA744630440220322CF251A13B8FADDD0883C7438EC79508F6F24A50FB05CCF90AF262307DEB780220354628462E7C001CAF45B67174CB76BBE5B91F7ADD98E4026AB58757BC27AFC28114FC7250A211DEDDC70EE5A2738DE5F07817351CEFF9EA7C0A746578742F706C61696E7D3963616E63656C3A37663162336338652D326434612D346535622D396336642D3061316232633364346535663A31373630303030303030303030E1F1";
    pub const SECP_ADDRESS: &str = "rQrFNnvPGNNMqRcVRMbtBK3hpYaPzoa8K9";

    /// Same message, ed25519-signed
    pub const ED25519_ACCOUNT_SET: &str = "12000322000000002400000007201B000003E868400000000000000C7321EDA09AA5F47A6759802FF955F8DC2D2A14A5C99D23BE97F864127FF9383455A4F074406CE235A878F1D2E14BA412D6687B043E74F7D16ABE00C1F299AF12BFA6AD6E99DAF0BD892452154BD7EF338F9AED6D8A72947878921D93C47A97C437EE1DEE0D8114754A364018D3938C80EA92C4BCCC9BADC68EB053F9EA7C0A746578742F706C61696E7D3963616E63656C3A37663162336338652D326434612D346535622D396336642D3061316232633364346535663A31373630303030303030303030E1F1";
    pub const ED25519_ADDRESS: &str = "rB6wx8967rBa1GGQmeChv5EhQbc6Q444jT";

    /// A 1-drop Payment with the same memo, secp256k1-signed
    pub const SECP_PAYMENT: &str = "12000022000000002400000007201B000003E861400000000000000168400000000000000C7321034F355BDCB7CC0AF728EF3CCEB9615D90684BB5B2CA5F859AB0F0B704075871AA74473045022100D6FE3D1BD97494AF77BE6D6E88ACD3B95BF5D93504B59EC2E2E3BC6777EF675402200437CFAFCFBACEB0210C51FCF982CB3628DF82E9EA7287E604274D62B72646A68114FC7250A211DEDDC70EE5A2738DE5F07817351CEF83140000000000000000000000000000000000000000F9EA7C0A746578742F706C61696E7D3963616E63656C3A37663162336338652D326434612D346535622D396336642D3061316232633364346535663A31373630303030303030303030E1F1";

    #[test]
    fn test_decode_account_set() {
        let tx = decode_signed_transaction_hex(SECP_ACCOUNT_SET).unwrap();
        assert_eq!(tx.transaction_type, TT_ACCOUNT_SET);
        assert_eq!(encode_classic_address(&tx.account), SECP_ADDRESS);
        assert_eq!(tx.sequence, Some(7));
        assert_eq!(tx.last_ledger_sequence, Some(1000));
        assert_eq!(tx.signing_pub_key.len(), 33);
        assert_eq!(tx.memos.len(), 1);
        assert_eq!(tx.memos[0].data_utf8(), Some(CANCEL_MESSAGE));
        assert_eq!(tx.memos[0].memo_type.as_deref(), Some(&b"text/plain"[..]));
        assert!(tx.destination.is_none());
    }

    #[test]
    fn test_signing_payload_excludes_signature() {
        let blob = hex::decode(SECP_ACCOUNT_SET).unwrap();
        let tx = decode_signed_transaction(&blob).unwrap();
        assert_eq!(&tx.signing_payload[..4], &SIGNING_PREFIX);
        // prefix + blob - (header + length byte + signature)
        assert_eq!(
            tx.signing_payload.len(),
            4 + blob.len() - 2 - tx.txn_signature.len()
        );
        assert_eq!(tx.hash.len(), 64);
    }

    #[test]
    fn test_decode_payment_with_destination() {
        let tx = decode_signed_transaction_hex(SECP_PAYMENT).unwrap();
        assert_eq!(tx.transaction_type, TT_PAYMENT);
        assert_eq!(tx.destination, Some([0u8; 20]));
    }

    #[test]
    fn test_field_header_forms() {
        // one byte, type 2 field 4
        assert_eq!(Cursor::new(&[0x24]).field_header().unwrap(), (2, 4));
        // type 2, field 27 in the next byte
        assert_eq!(Cursor::new(&[0x20, 0x1B]).field_header().unwrap(), (2, 27));
        // type 16 in the next byte, field 3
        assert_eq!(Cursor::new(&[0x03, 0x10]).field_header().unwrap(), (16, 3));
        // both in following bytes
        assert_eq!(
            Cursor::new(&[0x00, 0x12, 0x20]).field_header().unwrap(),
            (18, 32)
        );
    }

    #[test]
    fn test_vl_length_forms() {
        assert_eq!(Cursor::new(&[0xC0]).vl_length().unwrap(), 192);
        assert_eq!(Cursor::new(&[0xC1, 0x00]).vl_length().unwrap(), 193);
        assert_eq!(Cursor::new(&[0xF0, 0xFF]).vl_length().unwrap(), 12480);
        assert_eq!(Cursor::new(&[0xF1, 0x00, 0x00]).vl_length().unwrap(), 12481);
        assert!(Cursor::new(&[0xFF]).vl_length().is_err());
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let blob = hex::decode(SECP_ACCOUNT_SET).unwrap();
        assert!(decode_signed_transaction(&blob[..blob.len() - 10]).is_err());
        assert!(decode_signed_transaction_hex("zz").is_err());
    }

    #[test]
    fn test_deep_nesting_rejected() {
        // 0xE2 opens an STObject field, so each byte is one level deeper
        let err = decode_signed_transaction_hex(&"E2".repeat(2_000)).unwrap_err();
        assert!(err.to_string().contains("nested too deeply"));

        // Nesting right at the bound still decodes far enough to fail on content
        let mut shallow = vec![0xE2; MAX_NESTING_DEPTH];
        shallow.extend(std::iter::repeat(0xE1).take(MAX_NESTING_DEPTH));
        let err = decode_signed_transaction(&shallow).unwrap_err();
        assert!(!err.to_string().contains("nested too deeply"));
    }

    #[test]
    fn test_oversized_blob_rejected() {
        let err = decode_signed_transaction_hex(&"E2".repeat(500_000)).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
        assert!(decode_signed_transaction(&vec![0u8; MAX_BLOB_BYTES + 1]).is_err());
    }
}
