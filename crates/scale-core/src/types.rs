//! # Domain Types
//!
//! Core types shared by the cache store, the sync engine and the scheduler.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  Identity              Product Table           Scheduling               │
//! │  ────────              ─────────────           ──────────               │
//! │  • DeviceId            • Product               • AutoUpdateConfig       │
//! │  • Plu                 • ProductPatch                                   │
//! │                        • SaleUnit                                       │
//! │                                                                         │
//! │  PLU is the natural key inside one device's table.                     │
//! │  Two devices may both have a PLU 100; they never meet.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Shape
//! Products serialize with the field names scales and the web UI already
//! use (`pluNumber`, `shelfLifeInDays`, `sellByDate`, ...). Fields this crate
//! does not model are kept verbatim in [`Product::extra`] so a refresh and a
//! later push never lose device-specific settings.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::money::Money;
use crate::validation;

// =============================================================================
// Identity
// =============================================================================

/// Opaque identifier of a scale, owned by the external device registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub i64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for DeviceId {
    fn from(id: i64) -> Self {
        DeviceId(id)
    }
}

/// Price Look-Up number, unique within one device's table.
///
/// Always in `1..=MAX_PLU`; construction validates.
///
/// ```rust
/// use scale_core::Plu;
///
/// assert!(Plu::new(100).is_ok());
/// assert!(Plu::new(0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Plu(u32);

impl Plu {
    pub fn new(value: u32) -> Result<Self, ValidationError> {
        validation::validate_plu(value as i64)?;
        Ok(Plu(value))
    }

    #[inline]
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Plu {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Plu::new(value)
    }
}

impl From<Plu> for u32 {
    fn from(plu: Plu) -> u32 {
        plu.0
    }
}

impl FromStr for Plu {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u32 = s
            .trim()
            .parse()
            .map_err(|_| ValidationError::invalid("pluNumber", format!("'{}' is not a number", s)))?;
        Plu::new(value)
    }
}

impl fmt::Display for Plu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Product
// =============================================================================

/// How the scale prices an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaleUnit {
    /// Price is per kilogram; the scale weighs.
    #[default]
    Weight,
    /// Price is per piece.
    Piece,
}

impl FromStr for SaleUnit {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "weight" => Ok(SaleUnit::Weight),
            "piece" => Ok(SaleUnit::Piece),
            other => Err(ValidationError::invalid(
                "unit",
                format!("'{}' is not one of weight, piece", other),
            )),
        }
    }
}

/// One row of a scale's PLU table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(rename = "pluNumber", alias = "plu")]
    pub plu: Plu,

    pub name: String,

    #[serde(with = "crate::money::decimal")]
    pub price: Money,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default)]
    pub unit: SaleUnit,

    #[serde(rename = "shelfLifeInDays", default, skip_serializing_if = "Option::is_none")]
    pub shelf_life_days: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacture_date: Option<NaiveDate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sell_by_date: Option<NaiveDate>,

    /// Device-specific fields carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Product {
    /// Creates a weight-priced product with no optional fields set.
    pub fn new(plu: Plu, name: impl Into<String>, price: Money) -> Self {
        Product {
            plu,
            name: name.into(),
            price,
            code: None,
            unit: SaleUnit::Weight,
            shelf_life_days: None,
            manufacture_date: None,
            sell_by_date: None,
            extra: Map::new(),
        }
    }
}

// =============================================================================
// Patch
// =============================================================================

/// A validated partial update to one product.
///
/// Built from loose caller JSON with [`ProductPatch::from_fields`], which
/// checks every field's type and range before anything is merged. A patch
/// that survives construction can still fail [`ProductPatch::resolve`] on
/// cross-field rules (e.g. sell-by before manufacture date).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub price: Option<Money>,
    pub code: Option<String>,
    pub unit: Option<SaleUnit>,
    pub shelf_life_days: Option<u32>,
    pub manufacture_date: Option<NaiveDate>,
    pub sell_by_date: Option<NaiveDate>,
    pub extra: Map<String, Value>,
}

impl ProductPatch {
    /// Parses and validates caller-supplied fields for `plu`.
    ///
    /// The PLU itself may be repeated in the fields but never changed.
    pub fn from_fields(plu: Plu, fields: &Map<String, Value>) -> Result<Self, ValidationError> {
        if fields.is_empty() {
            return Err(ValidationError::invalid("fields", "no fields to change"));
        }

        let mut patch = ProductPatch::default();

        for (key, value) in fields {
            match key.as_str() {
                "pluNumber" | "plu" => {
                    let same = value.as_u64().map(|v| v == plu.get() as u64).unwrap_or(false);
                    if !same {
                        return Err(ValidationError::Immutable {
                            field: "pluNumber".to_string(),
                        });
                    }
                }
                "name" => {
                    let name = expect_str("name", value)?;
                    validation::validate_product_name(name)?;
                    patch.name = Some(name.to_string());
                }
                "price" => {
                    let price = Money::from_json(value)?;
                    validation::validate_price(price)?;
                    patch.price = Some(price);
                }
                "code" => {
                    let code = expect_str("code", value)?;
                    validation::validate_code(code)?;
                    patch.code = Some(code.to_string());
                }
                "unit" => {
                    patch.unit = Some(expect_str("unit", value)?.parse()?);
                }
                "shelfLifeInDays" | "shelf_life_days" => {
                    let days = value.as_i64().ok_or_else(|| {
                        ValidationError::invalid("shelfLifeInDays", "expected an integer")
                    })?;
                    patch.shelf_life_days = Some(validation::validate_shelf_life(days)?);
                }
                "manufactureDate" | "manufacture_date" => {
                    patch.manufacture_date = Some(parse_date("manufactureDate", value)?);
                }
                "sellByDate" | "sell_by_date" => {
                    patch.sell_by_date = Some(parse_date("sellByDate", value)?);
                }
                other => {
                    if value.is_object() || value.is_array() {
                        return Err(ValidationError::invalid(other, "expected a scalar value"));
                    }
                    patch.extra.insert(other.to_string(), value.clone());
                }
            }
        }

        Ok(patch)
    }

    /// Returns `product` with every field present in this patch overwritten.
    pub fn apply_to(&self, product: &Product) -> Product {
        let mut out = product.clone();
        if let Some(name) = &self.name {
            out.name = name.clone();
        }
        if let Some(price) = self.price {
            out.price = price;
        }
        if let Some(code) = &self.code {
            out.code = Some(code.clone());
        }
        if let Some(unit) = self.unit {
            out.unit = unit;
        }
        if let Some(days) = self.shelf_life_days {
            out.shelf_life_days = Some(days);
        }
        if let Some(date) = self.manufacture_date {
            out.manufacture_date = Some(date);
        }
        if let Some(date) = self.sell_by_date {
            out.sell_by_date = Some(date);
        }
        for (key, value) in &self.extra {
            out.extra.insert(key.clone(), value.clone());
        }
        out
    }

    /// Computes the product this patch produces for `plu`.
    ///
    /// - Existing entry: merged, then the whole record is re-validated.
    /// - Missing entry: treated as a new product (name and price required),
    ///   unless `require_existing` is set, which yields `ProductNotFound`.
    pub fn resolve(
        &self,
        plu: Plu,
        existing: Option<&Product>,
        require_existing: bool,
    ) -> CoreResult<Product> {
        let product = match existing {
            Some(current) => self.apply_to(current),
            None if require_existing => return Err(CoreError::ProductNotFound { plu }),
            None => {
                let name = self.name.clone().ok_or_else(|| ValidationError::Required {
                    field: "name".to_string(),
                })?;
                let price = self.price.ok_or_else(|| ValidationError::Required {
                    field: "price".to_string(),
                })?;
                self.apply_to(&Product::new(plu, name, price))
            }
        };

        validation::validate_product(&product)?;
        Ok(product)
    }
}

fn expect_str<'a>(field: &str, value: &'a Value) -> Result<&'a str, ValidationError> {
    value
        .as_str()
        .ok_or_else(|| ValidationError::invalid(field, "expected a string"))
}

/// Accepts ISO dates and the `dd-mm-yy` form scales print on labels.
fn parse_date(field: &str, value: &Value) -> Result<NaiveDate, ValidationError> {
    let text = expect_str(field, value)?;
    let format = if text.len() == 8 {
        crate::labels::LABEL_DATE_FORMAT
    } else {
        "%Y-%m-%d"
    };
    NaiveDate::parse_from_str(text, format)
        .map_err(|_| ValidationError::invalid(field, format!("'{}' is not a date", text)))
}

// =============================================================================
// Auto-Update Configuration
// =============================================================================

/// Per-device auto-update settings as the device registry stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoUpdateConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    3600
}

impl AutoUpdateConfig {
    /// Builds a config from an interval known to be whole seconds.
    /// Anything below a second is dropped; caller input goes through
    /// [`AutoUpdateConfig::from_interval`].
    pub fn new(enabled: bool, interval: Duration) -> Self {
        AutoUpdateConfig {
            enabled,
            interval_secs: interval.as_secs(),
        }
    }

    /// Builds a config from caller input.
    ///
    /// ## Errors
    /// - `MustBePositive` for a zero interval
    /// - `InvalidFormat` for an interval that is not whole seconds
    pub fn from_interval(enabled: bool, interval: Duration) -> Result<Self, ValidationError> {
        validation::validate_interval(interval)?;
        Ok(AutoUpdateConfig::new(enabled, interval))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Rejects non-positive intervals.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_interval(self.interval())
    }
}

impl Default for AutoUpdateConfig {
    fn default() -> Self {
        AutoUpdateConfig {
            enabled: false,
            interval_secs: default_interval_secs(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
