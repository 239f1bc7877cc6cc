//! # Product Cache Store
//!
//! Per-device product tables, shared by HTTP readers and the sync engine.
//!
//! ## Snapshot Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  readers ──load()──► Arc<ProductCache> v7 ──┐                          │
//! │                                              │  (kept alive while read)  │
//! │  writer:                                     │                          │
//! │    1. clone v7 into a working copy           │                          │
//! │    2. validate + mutate the copy             ▼                          │
//! │    3. persist the copy (if a database is configured)                   │
//! │    4. ArcSwap::store(v8) ── new readers see v8, old readers keep v7    │
//! │                                                                         │
//! │  A reader holds either v7 or v8, never a mix. No reader lock exists.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writers on the same device are serialized by a per-slot write mutex,
//! so two mutations can never race on the same base version. Hardware
//! ordering is the engine's business (see [`crate::lock`]).

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use scale_core::validation::{validate_plu_uniqueness, validate_product};
use scale_core::{DeviceId, Plu, Product, ProductPatch};
use scale_db::{CacheSnapshot, Database, ProductCacheRepository};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Product Cache
// =============================================================================

/// An immutable snapshot of one device's product table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductCache {
    entries: BTreeMap<Plu, Product>,
    /// PLUs in device order; new local PLUs are appended.
    order: Vec<Plu>,
    version: u64,
    last_synced_at: Option<DateTime<Utc>>,
    dirty: BTreeSet<Plu>,
}

impl ProductCache {
    /// Products in device order.
    pub fn products(&self) -> Vec<Product> {
        self.order
            .iter()
            .filter_map(|plu| self.entries.get(plu).cloned())
            .collect()
    }

    pub fn get(&self, plu: Plu) -> Option<&Product> {
        self.entries.get(&plu)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Incremented by every mutation; 0 means never written.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    /// PLUs with staged edits not yet on the device.
    pub fn dirty(&self) -> &BTreeSet<Plu> {
        &self.dirty
    }

    fn put(&mut self, product: Product) {
        let plu = product.plu;
        if self.entries.insert(plu, product).is_none() {
            self.order.push(plu);
        }
    }

    fn take(&mut self, plu: Plu) {
        if self.entries.remove(&plu).is_some() {
            self.order.retain(|p| *p != plu);
        }
    }

    fn to_snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            products: self.products(),
            version: self.version,
            last_synced_at: self.last_synced_at,
            dirty: self.dirty.iter().copied().collect(),
        }
    }

    fn from_snapshot(snapshot: CacheSnapshot) -> Self {
        let mut cache = ProductCache {
            version: snapshot.version,
            last_synced_at: snapshot.last_synced_at,
            ..Default::default()
        };
        for product in snapshot.products {
            cache.put(product);
        }
        cache.dirty = snapshot
            .dirty
            .into_iter()
            .filter(|plu| cache.entries.contains_key(plu))
            .collect();
        cache
    }
}

// =============================================================================
// Mutation Results
// =============================================================================

/// What is needed to put one entry back the way it was.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchUndo {
    pub plu: Plu,
    /// `None` when the entry did not exist before.
    pub previous: Option<Product>,
    pub was_dirty: bool,
}

/// Result of applying one patch.
#[derive(Debug, Clone)]
pub struct AppliedPatch {
    /// The product as it now stands in the cache.
    pub product: Product,
    pub undo: PatchUndo,
    /// False when the patch matched what the cache already held.
    pub changed: bool,
}

/// Result of applying a batch: each PLU independently.
#[derive(Debug, Default)]
pub struct BatchApplied {
    pub applied: Vec<AppliedPatch>,
    pub failed: Vec<(Plu, SyncError)>,
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Default)]
struct Slot {
    current: ArcSwap<ProductCache>,
    write: AsyncMutex<()>,
}

/// Owner of every device's product cache.
#[derive(Debug)]
pub struct ProductCacheStore {
    slots: RwLock<HashMap<DeviceId, Arc<Slot>>>,
    repo: Option<ProductCacheRepository>,
    require_existing_plu: bool,
}

impl ProductCacheStore {
    /// Memory-only store.
    pub fn new(require_existing_plu: bool) -> Self {
        ProductCacheStore {
            slots: RwLock::new(HashMap::new()),
            repo: None,
            require_existing_plu,
        }
    }

    /// Persists every mutation to `db` before it becomes visible.
    pub fn with_database(mut self, db: &Database) -> Self {
        self.repo = Some(db.caches());
        self
    }

    fn existing_slot(&self, device_id: DeviceId) -> Option<Arc<Slot>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.get(&device_id).cloned()
    }

    fn slot(&self, device_id: DeviceId) -> Arc<Slot> {
        if let Some(slot) = self.existing_slot(device_id) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.entry(device_id).or_default().clone()
    }

    /// Persists `next` and publishes it.
    async fn commit(
        &self,
        device_id: DeviceId,
        slot: &Slot,
        next: ProductCache,
    ) -> SyncResult<Arc<ProductCache>> {
        if let Some(repo) = &self.repo {
            repo.save(device_id, &next.to_snapshot()).await?;
        }
        let next = Arc::new(next);
        slot.current.store(next.clone());
        Ok(next)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current snapshot; an empty cache if the device was never fetched.
    pub fn load(&self, device_id: DeviceId) -> Arc<ProductCache> {
        match self.existing_slot(device_id) {
            Some(slot) => slot.current.load_full(),
            None => Arc::new(ProductCache::default()),
        }
    }

    /// The current records for `touched`, in device order.
    ///
    /// PLUs no longer in the cache are skipped.
    pub fn diff_since(&self, device_id: DeviceId, touched: &BTreeSet<Plu>) -> Vec<Product> {
        let cache = self.load(device_id);
        cache
            .order
            .iter()
            .filter(|plu| touched.contains(plu))
            .filter_map(|plu| cache.entries.get(plu).cloned())
            .collect()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Replaces the whole table with a fresh fetch.
    ///
    /// Staged edits are discarded: the device is the source of truth after
    /// a full refresh.
    pub async fn replace_all(
        &self,
        device_id: DeviceId,
        products: Vec<Product>,
    ) -> SyncResult<Arc<ProductCache>> {
        validate_plu_uniqueness(&products)?;

        let slot = self.slot(device_id);
        let _write = slot.write.lock().await;
        let base_version = slot.current.load().version;

        let mut next = ProductCache {
            version: base_version + 1,
            last_synced_at: Some(Utc::now()),
            ..Default::default()
        };
        for product in products {
            next.put(product);
        }

        let count = next.len();
        let next = self.commit(device_id, &slot, next).await?;
        info!(device_id = %device_id, count, version = next.version, "Cache replaced");
        Ok(next)
    }

    /// Validates `patch` against the current entry and applies it.
    ///
    /// On any error the cache is unchanged. With `stage`, the PLU is marked
    /// dirty for a later upload.
    pub async fn apply_patch(
        &self,
        device_id: DeviceId,
        plu: Plu,
        patch: &ProductPatch,
        stage: bool,
    ) -> SyncResult<AppliedPatch> {
        let slot = self.slot(device_id);
        let _write = slot.write.lock().await;
        let base = slot.current.load_full();

        let mut next = (*base).clone();
        let applied = self.apply_one(&mut next, plu, patch, stage)?;

        if applied.changed {
            next.version += 1;
            self.commit(device_id, &slot, next).await?;
            debug!(device_id = %device_id, plu = %plu, staged = stage, "Patch applied");
        }
        Ok(applied)
    }

    /// Applies each patch independently; one invalid PLU does not block the
    /// others. All successful entries become visible together.
    pub async fn apply_batch(
        &self,
        device_id: DeviceId,
        items: &[(Plu, ProductPatch)],
        stage: bool,
    ) -> SyncResult<BatchApplied> {
        let slot = self.slot(device_id);
        let _write = slot.write.lock().await;
        let base = slot.current.load_full();

        let mut next = (*base).clone();
        let mut result = BatchApplied::default();
        for (plu, patch) in items {
            match self.apply_one(&mut next, *plu, patch, stage) {
                Ok(applied) => result.applied.push(applied),
                Err(err) => result.failed.push((*plu, err)),
            }
        }

        if result.applied.iter().any(|a| a.changed) {
            next.version += 1;
            self.commit(device_id, &slot, next).await?;
        }
        debug!(
            device_id = %device_id,
            applied = result.applied.len(),
            failed = result.failed.len(),
            "Batch applied"
        );
        Ok(result)
    }

    fn apply_one(
        &self,
        cache: &mut ProductCache,
        plu: Plu,
        patch: &ProductPatch,
        stage: bool,
    ) -> SyncResult<AppliedPatch> {
        let previous = cache.entries.get(&plu).cloned();
        let was_dirty = cache.dirty.contains(&plu);
        let product = patch.resolve(plu, previous.as_ref(), self.require_existing_plu)?;

        let changed = previous.as_ref() != Some(&product) || (stage && !was_dirty);
        if changed {
            cache.put(product.clone());
            if stage {
                cache.dirty.insert(plu);
            }
        }

        Ok(AppliedPatch {
            product,
            undo: PatchUndo {
                plu,
                previous,
                was_dirty,
            },
            changed,
        })
    }

    /// Overwrites whole records (label refresh). Every record is validated
    /// first; on any error nothing changes.
    pub async fn apply_records(
        &self,
        device_id: DeviceId,
        products: Vec<Product>,
    ) -> SyncResult<Vec<PatchUndo>> {
        for product in &products {
            validate_product(product)?;
        }

        let slot = self.slot(device_id);
        let _write = slot.write.lock().await;
        let mut next = (**slot.current.load()).clone();

        let mut undos = Vec::with_capacity(products.len());
        for product in products {
            undos.push(PatchUndo {
                plu: product.plu,
                previous: next.entries.get(&product.plu).cloned(),
                was_dirty: next.dirty.contains(&product.plu),
            });
            next.put(product);
        }

        if !undos.is_empty() {
            next.version += 1;
            self.commit(device_id, &slot, next).await?;
        }
        Ok(undos)
    }

    /// Puts entries back to their pre-patch state, newest change first.
    ///
    /// The in-memory table is always restored, even when persisting the
    /// restored table fails; that failure is returned afterwards.
    pub async fn revert(&self, device_id: DeviceId, undos: &[PatchUndo]) -> SyncResult<()> {
        if undos.is_empty() {
            return Ok(());
        }

        let slot = self.slot(device_id);
        let _write = slot.write.lock().await;
        let mut next = (**slot.current.load()).clone();

        for undo in undos.iter().rev() {
            match &undo.previous {
                Some(product) => next.put(product.clone()),
                None => next.take(undo.plu),
            }
            if undo.was_dirty {
                next.dirty.insert(undo.plu);
            } else {
                next.dirty.remove(&undo.plu);
            }
        }
        next.version += 1;

        let next = Arc::new(next);
        slot.current.store(next.clone());
        warn!(device_id = %device_id, count = undos.len(), "Reverted local changes");

        if let Some(repo) = &self.repo {
            repo.save(device_id, &next.to_snapshot()).await?;
        }
        Ok(())
    }

    /// Records that `pushed` PLUs are now on the device.
    pub async fn mark_synced(&self, device_id: DeviceId, pushed: &[Plu]) -> SyncResult<()> {
        let slot = self.slot(device_id);
        let _write = slot.write.lock().await;
        let mut next = (**slot.current.load()).clone();

        for plu in pushed {
            next.dirty.remove(plu);
        }
        next.last_synced_at = Some(Utc::now());
        next.version += 1;

        self.commit(device_id, &slot, next).await?;
        Ok(())
    }

    /// Drops a device's cache from memory and storage.
    pub async fn remove(&self, device_id: DeviceId) -> SyncResult<()> {
        {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            slots.remove(&device_id);
        }
        if let Some(repo) = &self.repo {
            repo.delete(device_id).await?;
        }
        info!(device_id = %device_id, "Cache removed");
        Ok(())
    }

    /// Loads every stored snapshot into memory. Returns how many were loaded.
    pub async fn restore(&self) -> SyncResult<usize> {
        let Some(repo) = &self.repo else {
            return Ok(0);
        };

        let mut restored = 0;
        for device_id in repo.list_device_ids().await? {
            if let Some(snapshot) = repo.load(device_id).await? {
                let cache = ProductCache::from_snapshot(snapshot);
                let slot = self.slot(device_id);
                slot.current.store(Arc::new(cache));
                restored += 1;
            }
        }

        info!(restored, "Product caches restored");
        Ok(restored)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
