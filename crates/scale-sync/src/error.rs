//! # Sync Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Device Link    │  │  Caller Input   │  │     Service             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Connection     │  │  Validation     │  │  Config / ConfigLoad    │ │
//! │  │  Protocol       │  │  ProductNotFound│  │  UnknownDevice          │ │
//! │  │  Timeout        │  │  EmptyCache     │  │  Storage                │ │
//! │  │  Rejected       │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  SyncError::kind() folds these into the ErrorKind taxonomy that        │
//! │  callers and schedule status snapshots see.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use scale_core::{CoreError, DeviceId, Plu, ValidationError};

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type alias for device link calls.
pub type LinkResult<T> = Result<T, LinkError>;

// =============================================================================
// Link Errors
// =============================================================================

/// Failure of a single device link call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Device unreachable (refused, reset, no route).
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Device answered with something malformed or unexpected.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No answer within the deadline.
    #[error("No answer within {}ms", .0.as_millis())]
    Timeout(Duration),
}

// =============================================================================
// Error Kind
// =============================================================================

/// The error taxonomy exposed to callers and recorded on schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The device could not be reached, or the session broke mid-call.
    Connection,
    /// The device answered with something unusable, or refused records.
    Protocol,
    /// A connect or request deadline expired.
    Timeout,
    /// Input rejected before anything was sent.
    Validation,
    /// Bad settings or schedule parameters.
    Config,
    /// Unknown device, PLU, or an empty cache.
    NotFound,
    /// The local database failed.
    Storage,
}

impl ErrorKind {
    /// Wire and storage name, as serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Config => "config",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Storage => "storage",
        }
    }

    /// Inverse of [`ErrorKind::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "connection" => ErrorKind::Connection,
            "protocol" => ErrorKind::Protocol,
            "timeout" => ErrorKind::Timeout,
            "validation" => ErrorKind::Validation,
            "config" => ErrorKind::Config,
            "not_found" => ErrorKind::NotFound,
            "storage" => ErrorKind::Storage,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Sync Error
// =============================================================================

/// A product the device refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub plu: Plu,
    pub reason: String,
}

/// Every failure the subsystem surfaces.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Device Link Errors
    // =========================================================================
    /// Device unreachable.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Device answered but the answer was unusable.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device did not answer within the deadline.
    #[error("Device did not answer within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Device refused one or more pushed products.
    ///
    /// ## When This Occurs
    /// - Firmware rejects a field value the local rules allowed
    /// - Device table is full
    #[error("Device rejected {} product(s): {}", .0.len(), summarize(.0))]
    Rejected(Vec<Rejection>),

    // =========================================================================
    // Caller Errors
    // =========================================================================
    /// Caller data violates a field rule.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Patch for a PLU the device does not have, with upserts disabled.
    #[error("Product not found: PLU {plu}")]
    ProductNotFound { plu: Plu },

    /// Upload requested before anything was fetched or staged.
    #[error("No cached products for device {0}; fetch from the scale first")]
    EmptyCache(DeviceId),

    /// Device not registered with this service.
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    // =========================================================================
    // Service Errors
    // =========================================================================
    /// Invalid schedule or service configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Config file could not be read or parsed.
    #[error("Failed to load config: {0}")]
    ConfigLoad(String),

    /// Durable storage failed; in-memory state was left unchanged.
    #[error("Storage error: {0}")]
    Storage(String),
}

fn summarize(rejections: &[Rejection]) -> String {
    rejections
        .iter()
        .map(|r| format!("PLU {} ({})", r.plu, r.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<LinkError> for SyncError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Connection(msg) => SyncError::Connection(msg),
            LinkError::Protocol(msg) => SyncError::Protocol(msg),
            LinkError::Timeout(after) => SyncError::Timeout(after),
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(v) => SyncError::Validation(v),
            CoreError::ProductNotFound { plu } => SyncError::ProductNotFound { plu },
            CoreError::DateOverflow { .. } => SyncError::Validation(ValidationError::InvalidFormat {
                field: "sellByDate".to_string(),
                reason: err.to_string(),
            }),
        }
    }
}

impl From<scale_db::DbError> for SyncError {
    fn from(err: scale_db::DbError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoad(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoad(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Maps this error onto the caller-facing taxonomy.
    ///
    /// Device rejections count as protocol errors: the device answered, but
    /// not with what was asked.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Connection(_) => ErrorKind::Connection,
            SyncError::Protocol(_) | SyncError::Rejected(_) => ErrorKind::Protocol,
            SyncError::Timeout(_) => ErrorKind::Timeout,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::ProductNotFound { .. }
            | SyncError::EmptyCache(_)
            | SyncError::UnknownDevice(_) => ErrorKind::NotFound,
            SyncError::Config(_) | SyncError::ConfigLoad(_) => ErrorKind::Config,
            SyncError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Returns true if the next scheduled tick may succeed without anyone
    /// changing anything.
    ///
    /// ## Retryable Errors
    /// - Connection failures
    /// - Timeouts (handled identically to connection failures)
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Timeout)
    }

    /// Returns true if the device was unreachable or silent, meaning any
    /// open session to it should be dropped.
    pub fn is_link_failure(&self) -> bool {
        self.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plu(n: u32) -> Plu {
        Plu::new(n).unwrap()
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(SyncError::from(LinkError::Timeout(Duration::from_secs(5))).kind(), ErrorKind::Timeout);
        assert_eq!(SyncError::from(LinkError::Connection("refused".into())).kind(), ErrorKind::Connection);
        assert_eq!(SyncError::from(LinkError::Protocol("garbage".into())).kind(), ErrorKind::Protocol);
        assert_eq!(SyncError::Rejected(vec![]).kind(), ErrorKind::Protocol);
        assert_eq!(SyncError::EmptyCache(DeviceId(1)).kind(), ErrorKind::NotFound);
        assert_eq!(SyncError::Config("bad".into()).kind(), ErrorKind::Config);
        assert_eq!(SyncError::from(scale_db::DbError::PoolExhausted).kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Connection("network error".into()).is_retryable());
        assert!(SyncError::Timeout(Duration::from_secs(5)).is_retryable());

        assert!(!SyncError::Protocol("bad frame".into()).is_retryable());
        assert!(!SyncError::Config("bad config".into()).is_retryable());
        assert!(!SyncError::Validation(ValidationError::Required { field: "name".into() }).is_retryable());
    }

    #[test]
    fn test_core_error_conversion() {
        let err: SyncError = CoreError::ProductNotFound { plu: plu(9) }.into();
        assert!(matches!(err, SyncError::ProductNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::Rejected(vec![Rejection {
            plu: plu(100),
            reason: "name too long".into(),
        }]);
        assert_eq!(err.to_string(), "Device rejected 1 product(s): PLU 100 (name too long)");
        assert_eq!(
            SyncError::Timeout(Duration::from_millis(5000)).to_string(),
            "Device did not answer within 5000ms"
        );
    }

    #[test]
    fn test_error_kind_strings() {
        for kind in [
            ErrorKind::Connection,
            ErrorKind::Protocol,
            ErrorKind::Timeout,
            ErrorKind::Validation,
            ErrorKind::Config,
            ErrorKind::NotFound,
            ErrorKind::Storage,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
    }
}
