//! # Product Cache Repository
//!
//! Persists each device's PLU table as a single JSON row.
//!
//! ## Why One Row
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  product_caches                                                         │
//! │  ┌───────────┬──────────────────────────────┬─────────┬─────────────┐  │
//! │  │ device_id │ snapshot (JSON)              │ version │ last_synced │  │
//! │  ├───────────┼──────────────────────────────┼─────────┼─────────────┤  │
//! │  │ 1         │ {"products":[...],"dirty":[]}│ 14      │ 2025-02-27… │  │
//! │  └───────────┴──────────────────────────────┴─────────┴─────────────┘  │
//! │                                                                         │
//! │  A single UPSERT replaces the whole table: a crash mid-write leaves    │
//! │  the previous snapshot, never half of each.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use scale_core::{DeviceId, Plu, Product};

/// Everything needed to rebuild a device's in-memory cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Products in device order.
    pub products: Vec<Product>,

    /// Bumped on every successful mutation.
    pub version: u64,

    /// Last successful full or partial sync with the device.
    pub last_synced_at: Option<DateTime<Utc>>,

    /// PLUs with staged edits not yet pushed.
    #[serde(default)]
    pub dirty: Vec<Plu>,
}

/// Repository for product cache snapshots.
#[derive(Debug, Clone)]
pub struct ProductCacheRepository {
    pool: SqlitePool,
}

impl ProductCacheRepository {
    /// Creates a new ProductCacheRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ProductCacheRepository { pool }
    }

    /// Writes the full snapshot for a device, replacing any previous one.
    pub async fn save(&self, device_id: DeviceId, snapshot: &CacheSnapshot) -> DbResult<()> {
        let payload = serde_json::to_string(snapshot)?;
        let now = Utc::now();

        debug!(
            device_id = %device_id,
            version = snapshot.version,
            products = snapshot.products.len(),
            "Saving cache snapshot"
        );

        sqlx::query(
            r#"
            INSERT INTO product_caches (
                device_id, snapshot, product_count, version, last_synced_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(device_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                product_count = excluded.product_count,
                version = excluded.version,
                last_synced_at = excluded.last_synced_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(device_id.0)
        .bind(payload)
        .bind(snapshot.products.len() as i64)
        .bind(snapshot.version as i64)
        .bind(snapshot.last_synced_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Loads the snapshot for a device, `None` if never saved.
    pub async fn load(&self, device_id: DeviceId) -> DbResult<Option<CacheSnapshot>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT snapshot FROM product_caches WHERE device_id = ?1")
                .bind(device_id.0)
                .fetch_optional(&self.pool)
                .await?;

        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Lists devices that have a stored snapshot.
    pub async fn list_device_ids(&self) -> DbResult<Vec<DeviceId>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT device_id FROM product_caches ORDER BY device_id")
                .fetch_all(&self.pool)
                .await?;

        Ok(ids.into_iter().map(DeviceId).collect())
    }

    /// Deletes a device's snapshot. Returns whether a row existed.
    pub async fn delete(&self, device_id: DeviceId) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM product_caches WHERE device_id = ?1")
            .bind(device_id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use scale_core::Money;

    fn snapshot(version: u64, prices: &[(u32, i64)]) -> CacheSnapshot {
        CacheSnapshot {
            products: prices
                .iter()
                .map(|(plu, cents)| {
                    Product::new(Plu::new(*plu).unwrap(), "Item", Money::from_cents(*cents))
                })
                .collect(),
            version,
            last_synced_at: Some(Utc::now()),
            dirty: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.caches();
        let id = DeviceId(1);

        assert!(repo.load(id).await.unwrap().is_none());

        let first = snapshot(1, &[(100, 150), (200, 990)]);
        repo.save(id, &first).await.unwrap();
        assert_eq!(repo.load(id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_save_replaces_whole_table() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.caches();
        let id = DeviceId(1);

        repo.save(id, &snapshot(1, &[(100, 150), (200, 990)])).await.unwrap();
        let mut second = snapshot(2, &[(300, 10)]);
        second.dirty = vec![Plu::new(300).unwrap()];
        repo.save(id, &second).await.unwrap();

        let loaded = repo.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.products.len(), 1);
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.dirty, second.dirty);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.caches();

        repo.save(DeviceId(2), &snapshot(1, &[])).await.unwrap();
        repo.save(DeviceId(1), &snapshot(1, &[])).await.unwrap();
        assert_eq!(repo.list_device_ids().await.unwrap(), vec![DeviceId(1), DeviceId(2)]);

        assert!(repo.delete(DeviceId(1)).await.unwrap());
        assert!(!repo.delete(DeviceId(1)).await.unwrap());
        assert_eq!(repo.list_device_ids().await.unwrap(), vec![DeviceId(2)]);
    }
}
