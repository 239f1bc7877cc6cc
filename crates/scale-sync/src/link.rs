//! # Device Link
//!
//! The contract between this crate and the code that actually speaks a
//! scale's wire protocol.
//!
//! ## Collaborators
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  CacheSyncEngine                                                       │
//! │       │                                                                 │
//! │       │ 1. descriptor from DeviceDirectory                             │
//! │       │ 2. credentials from CredentialStore (never logged/stored)      │
//! │       ▼                                                                 │
//! │  DeviceLinkFactory::connect(params) ──► Arc<dyn DeviceLink>            │
//! │                                              │                          │
//! │                    fetch_all() ◄─────────────┤                          │
//! │                    push_patch(products) ◄────┘                          │
//! │                                                                         │
//! │  Every call may block for a hardware round trip. The engine wraps      │
//! │  each one in its own deadline.                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use scale_core::{DeviceId, Plu, Product};

use crate::error::{LinkResult, Rejection, SyncResult};

// =============================================================================
// Descriptors
// =============================================================================

/// How the scale is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Vendor protocol over TCP.
    #[default]
    Tcp,
    /// PLU table kept in a JSON file (bench setups, demos).
    File,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::File => write!(f, "file"),
        }
    }
}

/// Connection descriptor for one scale, as supplied by the device registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub transport: Transport,
}

/// Decrypted connection secrets.
///
/// Lives only for the duration of a connect call. `Debug` never prints
/// the secret.
#[derive(Clone, Default)]
pub struct Credentials {
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Everything a factory needs to open a session.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub descriptor: DeviceDescriptor,
    pub credentials: Credentials,
    pub connect_timeout: Duration,
}

// =============================================================================
// Acknowledgements
// =============================================================================

/// Per-entry answer to a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryAck {
    Accepted(Plu),
    Rejected { plu: Plu, reason: String },
}

impl EntryAck {
    pub fn plu(&self) -> Plu {
        match self {
            EntryAck::Accepted(plu) | EntryAck::Rejected { plu, .. } => *plu,
        }
    }
}

/// Splits acks for `sent` into accepted PLUs and rejections.
///
/// A sent PLU the device never acknowledged counts as rejected.
pub fn partition_acks(sent: &[Product], acks: &[EntryAck]) -> (Vec<Plu>, Vec<Rejection>) {
    let by_plu: HashMap<Plu, &EntryAck> = acks.iter().map(|a| (a.plu(), a)).collect();

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for product in sent {
        match by_plu.get(&product.plu) {
            Some(EntryAck::Accepted(plu)) => accepted.push(*plu),
            Some(EntryAck::Rejected { plu, reason }) => rejected.push(Rejection {
                plu: *plu,
                reason: reason.clone(),
            }),
            None => rejected.push(Rejection {
                plu: product.plu,
                reason: "no acknowledgement from device".to_string(),
            }),
        }
    }
    (accepted, rejected)
}

// =============================================================================
// Traits
// =============================================================================

/// One open session with a scale.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Reads the whole PLU table in device order.
    async fn fetch_all(&self) -> LinkResult<Vec<Product>>;

    /// Writes the given records and acknowledges each one.
    async fn push_patch(&self, changes: &[Product]) -> LinkResult<Vec<EntryAck>>;
}

/// Opens sessions. May fail with `LinkError::Connection` when the device
/// cannot be reached at setup time.
#[async_trait]
pub trait DeviceLinkFactory: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> LinkResult<Arc<dyn DeviceLink>>;
}

/// Supplies decrypted connection secrets on demand.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credentials(&self, device_id: DeviceId) -> SyncResult<Credentials>;
}

/// For scales that need no password.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialStore for NoCredentials {
    async fn credentials(&self, _device_id: DeviceId) -> SyncResult<Credentials> {
        Ok(Credentials::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scale_core::Money;

    fn product(plu: u32) -> Product {
        Product::new(Plu::new(plu).unwrap(), "Item", Money::from_cents(100))
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials {
            password: Some("hunter2".to_string()),
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_partition_acks() {
        let sent = vec![product(1), product(2), product(3)];
        let acks = vec![
            EntryAck::Accepted(Plu::new(1).unwrap()),
            EntryAck::Rejected {
                plu: Plu::new(2).unwrap(),
                reason: "bad name".into(),
            },
        ];

        let (accepted, rejected) = partition_acks(&sent, &acks);
        assert_eq!(accepted, vec![Plu::new(1).unwrap()]);
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].reason, "bad name");
        assert_eq!(rejected[1].plu.get(), 3);
    }

    #[test]
    fn test_transport_display() {
        assert_eq!(Transport::Tcp.to_string(), "tcp");
        assert_eq!(Transport::default(), Transport::Tcp);
    }
}
