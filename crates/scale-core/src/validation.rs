//! # Validation Module
//!
//! Field rules for scale products and schedules.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: ProductPatch::from_fields                                    │
//! │  ├── JSON type of every field                                          │
//! │  └── Per-field range / format (THIS MODULE)                            │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: ProductPatch::resolve                                        │
//! │  └── Whole merged record re-checked (THIS MODULE)                      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Cache store                                                  │
//! │  └── Nothing mutated unless layers 1 and 2 passed                      │
//! │                                                                         │
//! │  Tables fetched from a scale go through validate_plu_uniqueness.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use scale_core::money::Money;
//! use scale_core::validation::{validate_plu, validate_price};
//!
//! validate_plu(100).unwrap();
//! validate_price(Money::from_cents(150)).unwrap();
//! assert!(validate_price(Money::from_cents(-1)).is_err());
//! ```

use std::collections::HashSet;
use std::time::Duration;

use crate::error::ValidationError;
use crate::money::Money;
use crate::types::Product;
use crate::{MAX_CODE_LEN, MAX_NAME_LEN, MAX_PLU, MAX_PRICE_CENTS, MAX_SHELF_LIFE_DAYS};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Field Validators
// =============================================================================

/// Validates a PLU number.
///
/// ## Rules
/// - 1 to [`MAX_PLU`] inclusive (0 is reserved by scale firmware)
pub fn validate_plu(plu: i64) -> ValidationResult<()> {
    if !(1..=MAX_PLU as i64).contains(&plu) {
        return Err(ValidationError::OutOfRange {
            field: "pluNumber".to_string(),
            min: 1,
            max: MAX_PLU as i64,
        });
    }
    Ok(())
}

/// Validates a product name.
///
/// ## Rules
/// - Must not be empty (after trimming)
/// - At most [`MAX_NAME_LEN`] characters
///
/// ## Example
/// ```rust
/// use scale_core::validation::validate_product_name;
///
/// assert!(validate_product_name("Apples Golden").is_ok());
/// assert!(validate_product_name("  ").is_err());
/// ```
pub fn validate_product_name(name: &str) -> ValidationResult<()> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "name".to_string(),
        });
    }

    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "name".to_string(),
            max: MAX_NAME_LEN,
        });
    }

    Ok(())
}

/// Validates a price.
///
/// ## Rules
/// - Non-negative
/// - At most what a scale display can show
pub fn validate_price(price: Money) -> ValidationResult<()> {
    if !(0..=MAX_PRICE_CENTS).contains(&price.cents()) {
        return Err(ValidationError::OutOfRange {
            field: "price".to_string(),
            min: 0,
            max: MAX_PRICE_CENTS,
        });
    }
    Ok(())
}

/// Validates a product (bar)code.
///
/// ## Rules
/// - Digits only (printed into an EAN barcode)
/// - 1 to [`MAX_CODE_LEN`] characters
pub fn validate_code(code: &str) -> ValidationResult<()> {
    if code.is_empty() {
        return Err(ValidationError::Required {
            field: "code".to_string(),
        });
    }
    if code.len() > MAX_CODE_LEN {
        return Err(ValidationError::TooLong {
            field: "code".to_string(),
            max: MAX_CODE_LEN,
        });
    }
    if !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidFormat {
            field: "code".to_string(),
            reason: "must contain only digits".to_string(),
        });
    }
    Ok(())
}

/// Validates a shelf life and narrows it to `u32`.
pub fn validate_shelf_life(days: i64) -> ValidationResult<u32> {
    if !(0..=MAX_SHELF_LIFE_DAYS as i64).contains(&days) {
        return Err(ValidationError::OutOfRange {
            field: "shelfLifeInDays".to_string(),
            min: 0,
            max: MAX_SHELF_LIFE_DAYS as i64,
        });
    }
    Ok(days as u32)
}

/// Validates an auto-update interval.
///
/// Schedules are stored in whole seconds, so a fractional interval is
/// rejected rather than truncated.
pub fn validate_interval(interval: Duration) -> ValidationResult<()> {
    if interval.is_zero() {
        return Err(ValidationError::MustBePositive {
            field: "interval".to_string(),
        });
    }
    if interval.subsec_nanos() != 0 {
        return Err(ValidationError::invalid(
            "interval",
            format!("{}ms is not a whole number of seconds", interval.as_millis()),
        ));
    }
    Ok(())
}

// =============================================================================
// Record Validators
// =============================================================================

/// Validates every field of a complete product plus cross-field rules.
pub fn validate_product(product: &Product) -> ValidationResult<()> {
    validate_product_name(&product.name)?;
    validate_price(product.price)?;

    if let Some(code) = &product.code {
        validate_code(code)?;
    }
    if let Some(days) = product.shelf_life_days {
        validate_shelf_life(days as i64)?;
    }
    if let (Some(made), Some(sell_by)) = (product.manufacture_date, product.sell_by_date) {
        if sell_by < made {
            return Err(ValidationError::InvalidFormat {
                field: "sellByDate".to_string(),
                reason: "must not be before manufactureDate".to_string(),
            });
        }
    }

    Ok(())
}

/// Checks that no PLU appears twice in a table.
///
/// Reports the first duplicate in table order.
pub fn validate_plu_uniqueness(products: &[Product]) -> ValidationResult<()> {
    let mut seen = HashSet::with_capacity(products.len());
    for product in products {
        if !seen.insert(product.plu) {
            return Err(ValidationError::Duplicate {
                field: "pluNumber".to_string(),
                value: product.plu.to_string(),
            });
        }
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Plu;
    use chrono::NaiveDate;

    fn product(plu: u32) -> Product {
        Product::new(Plu::new(plu).unwrap(), "Item", Money::from_cents(100))
    }

    #[test]
    fn test_validate_plu() {
        assert!(validate_plu(1).is_ok());
        assert!(validate_plu(MAX_PLU as i64).is_ok());
        assert!(validate_plu(0).is_err());
        assert!(validate_plu(-5).is_err());
        assert!(validate_plu(MAX_PLU as i64 + 1).is_err());
    }

    #[test]
    fn test_validate_product_name() {
        assert!(validate_product_name("Bread").is_ok());
        assert!(validate_product_name("").is_err());
        assert!(validate_product_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(validate_product_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        // Cyrillic names count characters, not bytes.
        assert!(validate_product_name(&"я".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_validate_price() {
        assert!(validate_price(Money::zero()).is_ok());
        assert!(validate_price(Money::from_cents(MAX_PRICE_CENTS)).is_ok());
        assert!(validate_price(Money::from_cents(-1)).is_err());
        assert!(validate_price(Money::from_cents(MAX_PRICE_CENTS + 1)).is_err());
    }

    #[test]
    fn test_validate_code() {
        assert!(validate_code("4600000000000").is_ok());
        assert!(validate_code("").is_err());
        assert!(validate_code("46A").is_err());
        assert!(validate_code(&"1".repeat(MAX_CODE_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_shelf_life_and_interval() {
        assert_eq!(validate_shelf_life(30).unwrap(), 30);
        assert!(validate_shelf_life(-1).is_err());
        assert!(validate_interval(Duration::from_secs(1)).is_ok());
        assert!(validate_interval(Duration::ZERO).is_err());
    }

    #[test]
    fn test_validate_interval_rejects_fractions() {
        let half = validate_interval(Duration::from_millis(500)).unwrap_err();
        assert!(matches!(half, ValidationError::InvalidFormat { .. }));
        assert!(half.to_string().contains("500ms"));

        assert!(validate_interval(Duration::from_millis(1999)).is_err());
        assert!(validate_interval(Duration::from_millis(2000)).is_ok());
    }

    #[test]
    fn test_validate_product_dates() {
        let mut p = product(1);
        p.manufacture_date = NaiveDate::from_ymd_opt(2025, 1, 10);
        p.sell_by_date = NaiveDate::from_ymd_opt(2025, 1, 10);
        assert!(validate_product(&p).is_ok());

        p.sell_by_date = NaiveDate::from_ymd_opt(2025, 1, 9);
        let err = validate_product(&p).unwrap_err();
        assert_eq!(err.field(), "sellByDate");
    }

    #[test]
    fn test_plu_uniqueness() {
        assert!(validate_plu_uniqueness(&[product(1), product(2)]).is_ok());
        assert!(validate_plu_uniqueness(&[]).is_ok());

        let err = validate_plu_uniqueness(&[product(1), product(2), product(1)]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::Duplicate {
                field: "pluNumber".to_string(),
                value: "1".to_string(),
            }
        );
    }
}
