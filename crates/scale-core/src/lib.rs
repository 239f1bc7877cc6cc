//! # scale-core: Pure Domain Logic for Scale Product Tables
//!
//! This crate holds the types and rules shared by every other crate in the
//! workspace. Nothing in here talks to a scale, a database or the network.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Scale Sync Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 HTTP layer (external collaborator)              │   │
//! │  │   GetProducts, RefreshProducts, PatchProduct, SetAutoUpdate     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 scale-sync (engine + scheduler)                 │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ scale-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   money   │  │ validation│  │  labels   │  │   │
//! │  │   │  Product  │  │   Money   │  │  rules    │  │ sell-by   │  │   │
//! │  │   │  Patch    │  │  decimal  │  │  checks   │  │  dates    │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Plu, DeviceId, Product, ProductPatch, ...)
//! - [`money`] - Price type with integer arithmetic (no floating point!)
//! - [`error`] - Domain and validation error types
//! - [`validation`] - Field rules for products and schedules
//! - [`labels`] - Manufacture / sell-by date refresh
//!
//! ## Example Usage
//!
//! ```rust
//! use scale_core::money::Money;
//!
//! let price = Money::parse_decimal("1.50").unwrap();
//! assert_eq!(price.cents(), 150);
//! assert_eq!(price.to_string(), "1.50");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod labels;
pub mod money;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Highest PLU number a scale accepts.
///
/// Scale firmware stores PLUs as six decimal digits; zero is reserved.
pub const MAX_PLU: u32 = 999_999;

/// Maximum product name length printed on a label.
pub const MAX_NAME_LEN: usize = 100;

/// Maximum product code length (EAN-13 plus headroom for internal codes).
pub const MAX_CODE_LEN: usize = 20;

/// Highest price a scale can display, in minor units (999 999.99).
pub const MAX_PRICE_CENTS: i64 = 99_999_999;

/// Maximum shelf life in days.
pub const MAX_SHELF_LIFE_DAYS: u32 = 3650;
