//! XRP amount handling: decimal parsing, drop formatting, lot rounding and
//! the fee breakdown shown alongside a payment request.
//!
//! All arithmetic is on drops (1 XRP = 1,000,000 drops). FXRP carries the
//! same six decimals, so an FXRP amount in UBA equals the XRP amount in drops.

use bigdecimal::{BigDecimal, ToPrimitive};
use serde::Serialize;
use std::str::FromStr;

use crate::error::{Result, SettlementError};

pub const DROPS_PER_XRP: u64 = 1_000_000;

/// Parse a decimal XRP amount ("12.3") into drops.
///
/// Rejects zero, negatives, more than six decimal places and values that do
/// not fit in a u64.
pub fn parse_xrp(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SettlementError::validation("amount is required"));
    }

    let value = BigDecimal::from_str(trimmed)
        .map_err(|_| SettlementError::validation(format!("invalid amount: {}", trimmed)))?;
    if value <= BigDecimal::from(0u64) {
        return Err(SettlementError::validation("amount must be positive"));
    }

    let drops = value * BigDecimal::from(DROPS_PER_XRP);
    if drops.with_scale(0) != drops {
        return Err(SettlementError::validation(
            "amount has more than 6 decimal places",
        ));
    }

    drops
        .to_u64()
        .ok_or_else(|| SettlementError::validation("amount is too large"))
}

/// Format drops as an XRP decimal with exactly six fractional digits.
pub fn format_drops(drops: u64) -> String {
    format!("{}.{:06}", drops / DROPS_PER_XRP, drops % DROPS_PER_XRP)
}

/// Result of fitting a requested amount to the collateral system's lot size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LotRounding {
    pub requested_amount: String,
    pub rounded_amount: String,
    pub lots: u64,
    pub needs_rounding: bool,
    pub lot_size: String,
    #[serde(skip)]
    pub requested_drops: u64,
    #[serde(skip)]
    pub rounded_drops: u64,
}

/// Round down to a whole number of lots. Never rounds up, and refuses
/// requests smaller than one lot.
pub fn round_to_lots(requested_drops: u64, lot_size_drops: u64) -> Result<LotRounding> {
    if lot_size_drops == 0 {
        return Err(SettlementError::validation("lot size is not configured"));
    }

    let lots = requested_drops / lot_size_drops;
    if lots == 0 {
        return Err(SettlementError::validation(format!(
            "amount {} XRP is below the minimum of one lot ({} XRP)",
            format_drops(requested_drops),
            format_drops(lot_size_drops)
        )));
    }

    let rounded_drops = lots * lot_size_drops;
    Ok(LotRounding {
        requested_amount: format_drops(requested_drops),
        rounded_amount: format_drops(rounded_drops),
        lots,
        needs_rounding: rounded_drops != requested_drops,
        lot_size: format_drops(lot_size_drops),
        requested_drops,
        rounded_drops,
    })
}

/// Fee terms of a collateral reservation.
///
/// Derived from the reservation's base and fee amounts, never from the
/// rounded request, so what the user is asked to pay matches what the
/// collateral system will check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeBreakdown {
    pub base_amount: String,
    pub fee_amount: String,
    pub total_amount: String,
    /// `fee / base` as a ratio (0.0025 for a 0.25% fee)
    pub fee_percentage: f64,
    pub fee_bps: u32,
    #[serde(skip)]
    pub base_drops: u64,
    #[serde(skip)]
    pub fee_drops: u64,
    #[serde(skip)]
    pub total_drops: u64,
}

impl FeeBreakdown {
    pub fn from_reservation(base_drops: u64, fee_drops: u64, fee_bps: u32) -> Self {
        let total_drops = base_drops.saturating_add(fee_drops);
        let fee_percentage = if base_drops == 0 {
            0.0
        } else {
            fee_drops as f64 / base_drops as f64
        };

        Self {
            base_amount: format_drops(base_drops),
            fee_amount: format_drops(fee_drops),
            total_amount: format_drops(total_drops),
            fee_percentage,
            fee_bps,
            base_drops,
            fee_drops,
            total_drops,
        }
    }
}

/// Minting fee the collateral system will charge for `base_drops` at
/// `fee_bps`, truncated to whole drops.
pub fn minting_fee_drops(base_drops: u64, fee_bps: u32) -> u64 {
    ((base_drops as u128 * fee_bps as u128) / 10_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xrp() {
        assert_eq!(parse_xrp("12.3").unwrap(), 12_300_000);
        assert_eq!(parse_xrp("1").unwrap(), 1_000_000);
        assert_eq!(parse_xrp(" 0.000001 ").unwrap(), 1);
        assert_eq!(parse_xrp("100.000000").unwrap(), 100_000_000);
    }

    #[test]
    fn test_parse_xrp_rejects_bad_input() {
        assert!(parse_xrp("").is_err());
        assert!(parse_xrp("0").is_err());
        assert!(parse_xrp("-5").is_err());
        assert!(parse_xrp("abc").is_err());
        assert!(parse_xrp("1.0000001").is_err());
        assert!(parse_xrp("99999999999999999999").is_err());
    }

    #[test]
    fn test_format_drops() {
        assert_eq!(format_drops(10_000_000), "10.000000");
        assert_eq!(format_drops(12_300_000), "12.300000");
        assert_eq!(format_drops(1), "0.000001");
        assert_eq!(format_drops(0), "0.000000");
    }

    #[test]
    fn test_round_down_to_lot() {
        let rounding = round_to_lots(parse_xrp("12.3").unwrap(), 10 * DROPS_PER_XRP).unwrap();
        assert_eq!(rounding.rounded_amount, "10.000000");
        assert_eq!(rounding.requested_amount, "12.300000");
        assert_eq!(rounding.lots, 1);
        assert!(rounding.needs_rounding);
    }

    #[test]
    fn test_exact_multiple_needs_no_rounding() {
        let rounding = round_to_lots(40 * DROPS_PER_XRP, 10 * DROPS_PER_XRP).unwrap();
        assert_eq!(rounding.lots, 4);
        assert!(!rounding.needs_rounding);
        assert_eq!(rounding.rounded_drops, rounding.requested_drops);
    }

    #[test]
    fn test_rounded_never_exceeds_requested() {
        let lot = 10 * DROPS_PER_XRP;
        for requested in [lot, lot + 1, 2 * lot - 1, 7 * lot + 123_456, 1_000 * lot - 1] {
            let rounding = round_to_lots(requested, lot).unwrap();
            assert!(rounding.rounded_drops <= requested);
            assert_eq!(rounding.rounded_drops, (requested / lot) * lot);
            assert!(requested - rounding.rounded_drops < lot);
        }
    }

    #[test]
    fn test_below_one_lot_is_rejected() {
        let err = round_to_lots(9 * DROPS_PER_XRP, 10 * DROPS_PER_XRP).unwrap_err();
        assert!(err.to_string().contains("minimum of one lot"));
        assert!(round_to_lots(100, 0).is_err());
    }

    #[test]
    fn test_fee_breakdown_consistency() {
        let fee = FeeBreakdown::from_reservation(10_000_000, 25_000, 25);
        assert_eq!(fee.base_drops + fee.fee_drops, fee.total_drops);
        assert_eq!(fee.total_amount, "10.025000");
        assert!((fee.fee_percentage - 25_000f64 / 10_000_000f64).abs() < 1e-12);
        assert!((fee.fee_percentage * 10_000_000f64 - 25_000f64).abs() < 1e-6);
    }

    #[test]
    fn test_fee_breakdown_zero_base() {
        let fee = FeeBreakdown::from_reservation(0, 0, 0);
        assert_eq!(fee.fee_percentage, 0.0);
    }

    #[test]
    fn test_minting_fee() {
        assert_eq!(minting_fee_drops(10_000_000, 25), 25_000);
        assert_eq!(minting_fee_drops(10_000_000, 0), 0);
    }
}
