//! Exact decimal conversion between chains.
//!
//! Amounts are arbitrary-precision integers in the smallest unit of their
//! token. Moving from `from` decimals to `to` decimals multiplies or divides
//! by a power of ten. Division must be exact: a remainder means value would
//! be lost, which is an error rather than a truncation.

use num_bigint::BigUint;

use crate::{ChainError, Result};

/// Largest amount any target chain can represent.
pub const MAX_AMOUNT_BITS: u64 = 256;

fn pow10(exp: u32) -> BigUint {
    BigUint::from(10u8).pow(exp)
}

/// Convert `amount` from `from` decimals to `to` decimals.
///
/// # Errors
///
/// - [`ChainError::InexactAmount`] if scaling down leaves a remainder
/// - [`ChainError::AmountOverflow`] if the result exceeds 256 bits
pub fn convert(amount: &BigUint, from: u32, to: u32) -> Result<BigUint> {
    let converted = if to >= from {
        amount * pow10(to - from)
    } else {
        let divisor = pow10(from - to);
        if amount % &divisor != BigUint::from(0u8) {
            return Err(ChainError::InexactAmount {
                amount: amount.to_string(),
                from,
                to,
            });
        }
        amount / divisor
    };
    if converted.bits() > MAX_AMOUNT_BITS {
        return Err(ChainError::AmountOverflow(converted.to_string()));
    }
    Ok(converted)
}

/// Narrow an amount to `u64` for chains with 64-bit balances.
pub fn to_u64(amount: &BigUint) -> Result<u64> {
    u64::try_from(amount).map_err(|_| ChainError::AmountOverflow(amount.to_string()))
}

/// Big-endian 32-byte word, as used in EVM ABI encoding.
pub fn to_be_word(amount: &BigUint) -> Result<[u8; 32]> {
    let bytes = amount.to_bytes_be();
    if bytes.len() > 32 {
        return Err(ChainError::AmountOverflow(amount.to_string()));
    }
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big(s: &str) -> BigUint {
        s.parse().expect("decimal")
    }

    #[test]
    fn test_scale_up() {
        assert_eq!(convert(&big("1500"), 6, 18).expect("convert"), big("1500000000000000000000"));
    }

    #[test]
    fn test_scale_down_exact() {
        assert_eq!(convert(&big("1230000000000000000"), 18, 8).expect("convert"), big("123000000"));
    }

    #[test]
    fn test_scale_down_inexact_is_error() {
        let err = convert(&big("1230000000000000001"), 18, 8).expect_err("remainder");
        assert!(matches!(err, ChainError::InexactAmount { from: 18, to: 8, .. }));
    }

    #[test]
    fn test_same_decimals_identity() {
        assert_eq!(convert(&big("42"), 9, 9).expect("convert"), big("42"));
    }

    #[test]
    fn test_full_width_input_down_18() {
        // (2^256 - 1) rounded down to a multiple of 10^18 converts exactly.
        let max = (BigUint::from(1u8) << 256) - BigUint::from(1u8);
        let divisor = pow10(18);
        let aligned = &max - (&max % &divisor);
        let converted = convert(&aligned, 18, 0).expect("convert");
        assert_eq!(converted * divisor, aligned);
    }

    #[test]
    fn test_overflow_rejected() {
        let max = (BigUint::from(1u8) << 256) - BigUint::from(1u8);
        assert!(matches!(convert(&max, 0, 1), Err(ChainError::AmountOverflow(_))));
    }

    #[test]
    fn test_to_u64_and_word() {
        assert_eq!(to_u64(&big("18446744073709551615")).expect("fits"), u64::MAX);
        assert!(to_u64(&big("18446744073709551616")).is_err());
        let word = to_be_word(&big("258")).expect("word");
        assert_eq!(&word[30..], &[1, 2]);
        assert!(word[..30].iter().all(|b| *b == 0));
    }
}
