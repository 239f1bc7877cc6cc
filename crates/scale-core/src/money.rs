//! # Money Module
//!
//! Provides the `Money` type for scale prices.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  Scales report prices as decimal text or JSON numbers: "1.50", 2.0     │
//! │  Parsing those into f64 and back drifts:                               │
//! │    0.1 + 0.2 = 0.30000000000000004  ❌ WRONG!                           │
//! │                                                                         │
//! │  OUR SOLUTION: Integer minor units                                     │
//! │    "1.50" → 150, parsed digit by digit, never through a float          │
//! │    150 → "1.50" on the way back to the device                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use scale_core::money::Money;
//!
//! let price = Money::from_cents(150);
//! assert_eq!(price, Money::parse_decimal("1.5").unwrap());
//! assert_eq!(price.to_string(), "1.50");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ValidationError;

// =============================================================================
// Money Type
// =============================================================================

/// A price in the smallest currency unit (cents, kopecks, ...).
///
/// ## Design Decisions
/// - **i64 (signed)**: negative values can be represented so that validation
///   can reject them with a proper message instead of a parse failure
/// - **Single field tuple struct**: Zero-cost abstraction over i64
/// - **Serde**: serialized as a plain integer of minor units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from minor units.
    ///
    /// ## Example
    /// ```rust
    /// use scale_core::money::Money;
    ///
    /// let price = Money::from_cents(1099);
    /// assert_eq!(price.cents(), 1099);
    /// ```
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Creates a Money value from major and minor parts.
    ///
    /// For negative amounts, only the major part should be negative.
    #[inline]
    pub const fn from_major_minor(major: i64, minor: i64) -> Self {
        if major < 0 {
            Money(major * 100 - minor)
        } else {
            Money(major * 100 + minor)
        }
    }

    /// Returns the value in minor units.
    #[inline]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Returns the whole-unit part (truncated toward zero).
    #[inline]
    pub const fn major(&self) -> i64 {
        self.0 / 100
    }

    /// Returns the minor-unit part (always 0-99).
    #[inline]
    pub const fn minor(&self) -> i64 {
        (self.0 % 100).abs()
    }

    /// Zero.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Parses a decimal string such as `"2"`, `"1.5"` or `"-0.25"`.
    ///
    /// At most two fraction digits are accepted; anything finer than a minor
    /// unit is rejected rather than rounded.
    pub fn parse_decimal(input: &str) -> Result<Self, ValidationError> {
        let s = input.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };

        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(ValidationError::invalid("price", "empty value"));
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ValidationError::invalid(
                "price",
                format!("'{}' is not a decimal number", input),
            ));
        }
        if frac_part.len() > 2 {
            return Err(ValidationError::invalid(
                "price",
                "more than two fraction digits",
            ));
        }

        let major: i64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| ValidationError::invalid("price", "value too large"))?
        };
        let minor: i64 = match frac_part.len() {
            0 => 0,
            1 => frac_part.parse::<i64>().unwrap_or(0) * 10,
            _ => frac_part.parse::<i64>().unwrap_or(0),
        };

        let cents = major
            .checked_mul(100)
            .and_then(|c| c.checked_add(minor))
            .ok_or_else(|| ValidationError::invalid("price", "value too large"))?;

        Ok(Money(if negative { -cents } else { cents }))
    }

    /// Reads a price from a JSON value as sent by a caller or a device.
    ///
    /// Numbers are converted through their decimal text, never through f64
    /// arithmetic. Strings are parsed with [`Money::parse_decimal`].
    pub fn from_json(value: &Value) -> Result<Self, ValidationError> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return i
                        .checked_mul(100)
                        .map(Money)
                        .ok_or_else(|| ValidationError::invalid("price", "value too large"));
                }
                Self::parse_decimal(&n.to_string())
            }
            Value::String(s) => Self::parse_decimal(s),
            _ => Err(ValidationError::invalid(
                "price",
                "expected a number or decimal string",
            )),
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.is_negative() { "-" } else { "" };
        write!(f, "{}{}.{:02}", sign, self.major().abs(), self.minor())
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

// =============================================================================
// Decimal Serde
// =============================================================================

/// Serde adapter that writes prices as `"1.50"` and reads decimal strings or
/// JSON numbers.
///
/// ```rust,ignore
/// #[serde(with = "crate::money::decimal")]
/// pub price: Money,
/// ```
pub mod decimal {
    use super::Money;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(money: &Money, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(money)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Money, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Money::from_json(&value).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_cents() {
        let m = Money::from_cents(1099);
        assert_eq!(m.cents(), 1099);
        assert_eq!(m.major(), 10);
        assert_eq!(m.minor(), 99);
    }

    #[test]
    fn test_from_major_minor() {
        assert_eq!(Money::from_major_minor(10, 99).cents(), 1099);
        assert_eq!(Money::from_major_minor(-10, 50).cents(), -1050);
    }

    #[test]
    fn test_display() {
        assert_eq!(Money::from_cents(150).to_string(), "1.50");
        assert_eq!(Money::from_cents(5).to_string(), "0.05");
        assert_eq!(Money::from_cents(-50).to_string(), "-0.50");
        assert_eq!(Money::zero().to_string(), "0.00");
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(Money::parse_decimal("2").unwrap().cents(), 200);
        assert_eq!(Money::parse_decimal("1.5").unwrap().cents(), 150);
        assert_eq!(Money::parse_decimal("1.50").unwrap().cents(), 150);
        assert_eq!(Money::parse_decimal(".75").unwrap().cents(), 75);
        assert_eq!(Money::parse_decimal(" 3.05 ").unwrap().cents(), 305);
        assert_eq!(Money::parse_decimal("-0.25").unwrap().cents(), -25);
    }

    #[test]
    fn test_parse_decimal_rejects_garbage() {
        assert!(Money::parse_decimal("").is_err());
        assert!(Money::parse_decimal("abc").is_err());
        assert!(Money::parse_decimal("1.234").is_err());
        assert!(Money::parse_decimal("1,50").is_err());
        assert!(Money::parse_decimal("99999999999999999999").is_err());
    }

    #[test]
    fn test_from_json() {
        assert_eq!(Money::from_json(&json!(2)).unwrap().cents(), 200);
        assert_eq!(Money::from_json(&json!(2.0)).unwrap().cents(), 200);
        assert_eq!(Money::from_json(&json!(1.5)).unwrap().cents(), 150);
        assert_eq!(Money::from_json(&json!("0.10")).unwrap().cents(), 10);
        assert!(Money::from_json(&json!(true)).is_err());
        assert!(Money::from_json(&json!(null)).is_err());
    }

    #[test]
    fn test_serde_is_plain_integer() {
        let json = serde_json::to_string(&Money::from_cents(150)).unwrap();
        assert_eq!(json, "150");
        let back: Money = serde_json::from_str("150").unwrap();
        assert_eq!(back, Money::from_cents(150));
    }
}
