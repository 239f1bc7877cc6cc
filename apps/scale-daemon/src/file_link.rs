//! # File-Backed Device Link
//!
//! Stands in for a scale on bench setups: the PLU table lives in a JSON
//! file at the descriptor's `address`.
//!
//! ```text
//! { "products": [ { "pluNumber": 1, "name": "Apples", "price": "1.50", ... } ] }
//! ```
//!
//! Pushed records are checked with the same field rules a scale enforces
//! and rejected per entry when they fail.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use scale_core::validation::validate_product;
use scale_core::Product;
use scale_sync::{
    ConnectionParams, DeviceLink, DeviceLinkFactory, EntryAck, LinkError, LinkResult, Transport,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct PluTable {
    #[serde(default)]
    products: Vec<Product>,
}

/// One JSON file acting as a scale.
pub struct FileLink {
    path: PathBuf,
    write: Mutex<()>,
}

impl FileLink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileLink {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    async fn read_table(&self) -> LinkResult<PluTable> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|e| LinkError::Connection(format!("{}: {}", self.path.display(), e)))?;
        serde_json::from_slice(&raw)
            .map_err(|e| LinkError::Protocol(format!("{}: {}", self.path.display(), e)))
    }

    async fn write_table(&self, table: &PluTable) -> LinkResult<()> {
        let json = serde_json::to_vec_pretty(table)
            .map_err(|e| LinkError::Protocol(e.to_string()))?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| LinkError::Connection(e.to_string()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| LinkError::Connection(e.to_string()))
    }
}

#[async_trait]
impl DeviceLink for FileLink {
    async fn fetch_all(&self) -> LinkResult<Vec<Product>> {
        Ok(self.read_table().await?.products)
    }

    async fn push_patch(&self, changes: &[Product]) -> LinkResult<Vec<EntryAck>> {
        let _write = self.write.lock().await;
        let mut table = self.read_table().await?;

        let mut acks = Vec::with_capacity(changes.len());
        for product in changes {
            if let Err(e) = validate_product(product) {
                acks.push(EntryAck::Rejected {
                    plu: product.plu,
                    reason: e.to_string(),
                });
                continue;
            }
            match table.products.iter_mut().find(|p| p.plu == product.plu) {
                Some(existing) => *existing = product.clone(),
                None => table.products.push(product.clone()),
            }
            acks.push(EntryAck::Accepted(product.plu));
        }

        self.write_table(&table).await?;
        debug!(path = %self.path.display(), count = changes.len(), "PLU table written");
        Ok(acks)
    }
}

/// Opens `FileLink`s for `transport = "file"` devices.
///
/// TCP scales need a vendor driver, which this host does not ship.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileLinkFactory;

#[async_trait]
impl DeviceLinkFactory for FileLinkFactory {
    async fn connect(&self, params: &ConnectionParams) -> LinkResult<Arc<dyn DeviceLink>> {
        let descriptor = &params.descriptor;
        match descriptor.transport {
            Transport::File => {
                let path = PathBuf::from(&descriptor.address);
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Err(LinkError::Connection(format!(
                        "no PLU table at {}",
                        path.display()
                    )));
                }
                Ok(Arc::new(FileLink::new(path)))
            }
            Transport::Tcp => Err(LinkError::Connection(format!(
                "no driver for tcp scale {}:{}",
                descriptor.address, descriptor.port
            ))),
        }
    }
}
