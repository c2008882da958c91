//! Static exchange-rate table for USD normalization
//!
//! Artist earnings are credited in USD regardless of the charge currency.
//! Rates are a static snapshot (rate source `"static"`); a missing rate is
//! a retryable error so the gateway redelivers once an operator adds it.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::error::{PaymentError, PaymentResult};

/// Rate source recorded on every paid transaction
pub const RATE_SOURCE_STATIC: &str = "static";

/// USD value of one unit of the given currency
pub fn exchange_rate(currency: &str) -> Option<Decimal> {
    let rate = match currency.to_ascii_uppercase().as_str() {
        "USD" => dec!(1.0),
        "INR" => dec!(0.01111975),
        "EUR" => dec!(1.07580000),
        "GBP" => dec!(1.26340000),
        "AUD" => dec!(0.65210000),
        "CAD" => dec!(0.73120000),
        "SGD" => dec!(0.74350000),
        "AED" => dec!(0.27229408),
        "JPY" => dec!(0.00637520),
        "BRL" => dec!(0.17310000),
        _ => return None,
    };
    Some(rate)
}

/// Round to 2 decimal places, half away from zero
pub fn round2(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert an amount in `currency` to a rounded USD amount.
///
/// Returns the USD amount together with the rate used, so callers can stamp
/// the rate onto the transaction in the same atomic unit.
pub fn usd_amount(amount: Decimal, currency: &str) -> PaymentResult<(Decimal, Decimal)> {
    let rate = exchange_rate(currency)
        .ok_or_else(|| PaymentError::UnsupportedCurrency(currency.to_string()))?;
    Ok((round2(amount * rate), rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inr_spec_examples() {
        // artistShare=1000 INR, rate=0.01111975 -> 11.12 USD
        let (usd, rate) = usd_amount(dec!(1000), "INR").unwrap();
        assert_eq!(usd, dec!(11.12));
        assert_eq!(rate, dec!(0.01111975));

        // artistShare=850 INR -> 9.45 USD (end-to-end scenario amount)
        let (usd, _) = usd_amount(dec!(850), "INR").unwrap();
        assert_eq!(usd, dec!(9.45));
    }

    #[test]
    fn test_usd_is_identity() {
        let (usd, rate) = usd_amount(dec!(19.99), "USD").unwrap();
        assert_eq!(usd, dec!(19.99));
        assert_eq!(rate, dec!(1.0));
    }

    #[test]
    fn test_case_insensitive_currency() {
        assert!(usd_amount(dec!(100), "inr").is_ok());
        assert!(usd_amount(dec!(100), "Eur").is_ok());
    }

    #[test]
    fn test_unknown_currency_rejected() {
        let err = usd_amount(dec!(100), "XYZ").unwrap_err();
        assert!(matches!(err, PaymentError::UnsupportedCurrency(c) if c == "XYZ"));
    }

    #[test]
    fn test_round2_half_away_from_zero() {
        assert_eq!(round2(dec!(9.4517875)), dec!(9.45));
        assert_eq!(round2(dec!(11.11975)), dec!(11.12));
        assert_eq!(round2(dec!(1.005)), dec!(1.01));
        assert_eq!(round2(dec!(2.444)), dec!(2.44));
    }
}
