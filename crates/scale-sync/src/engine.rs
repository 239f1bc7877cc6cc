//! # Cache Sync Engine
//!
//! Orchestrates every conversation between a product cache and its scale.
//! Owns no product state itself: it combines the [`ProductCacheStore`], the
//! device link and the per-device [`SyncLocks`].
//!
//! ## Patch Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  push_patch(device, plu, fields)                                       │
//! │       │                                                                 │
//! │       ├── parse + validate fields ──✗──► Validation (nothing sent)     │
//! │       │                                                                 │
//! │       ├── acquire sync lock                                            │
//! │       ├── apply locally (keep undo record)                             │
//! │       ├── push the one record ──✗──► revert entry, surface error       │
//! │       ├── device rejects it ────────► revert entry, Rejected           │
//! │       └── accepted ─────────────────► mark synced, return product      │
//! │                                                                         │
//! │  Whatever happens, when the call returns the cache entry matches       │
//! │  what the device holds.                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Device Calls
//! Every link call runs under `request_timeout`; opening the session runs
//! under `connect_timeout`. An expired deadline is reported as `Timeout`.
//! Any failed call drops the cached session so the next call reconnects.
//!
//! The engine never retries. Retry policy belongs to the scheduler.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use scale_core::labels::relabel;
use scale_core::validation::validate_plu_uniqueness;
use scale_core::{DeviceId, Plu, Product, ProductPatch};

use crate::config::LinkSettings;
use crate::devices::DeviceDirectory;
use crate::diagnostics::{classify_attempt, find_breaking_products, DiagnosisSettings, UploadDiagnosis};
use crate::error::{ErrorKind, LinkResult, Rejection, SyncError, SyncResult};
use crate::link::{partition_acks, ConnectionParams, CredentialStore, DeviceLink, DeviceLinkFactory};
use crate::lock::{SyncGuard, SyncLocks};
use crate::store::{PatchUndo, ProductCache, ProductCacheStore};

// =============================================================================
// Settings & Reports
// =============================================================================

/// Deadlines and diagnosis tuning.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub diagnosis: DiagnosisSettings,
    /// Diagnose the cached table when a staged upload is refused.
    pub diagnose_on_reject: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings::from_link(&LinkSettings::default())
    }
}

impl EngineSettings {
    pub fn from_link(link: &LinkSettings) -> Self {
        EngineSettings {
            connect_timeout: link.connect_timeout(),
            request_timeout: link.request_timeout(),
            diagnosis: DiagnosisSettings::default(),
            diagnose_on_reject: false,
        }
    }
}

/// Why one PLU of a batch did not make it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluFailure {
    pub plu: Plu,
    pub kind: ErrorKind,
    pub message: String,
}

impl PluFailure {
    pub fn new(plu: Plu, err: &SyncError) -> Self {
        PluFailure {
            plu,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    fn rejected(rejection: &Rejection) -> Self {
        PluFailure {
            plu: rejection.plu,
            kind: ErrorKind::Protocol,
            message: format!("Rejected by device: {}", rejection.reason),
        }
    }
}

/// Per-PLU outcome of a batch patch.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Products now on the device and in the cache.
    pub updated: Vec<Product>,
    pub failed: Vec<PluFailure>,
}

/// Outcome of uploading staged edits.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    pub pushed: Vec<Plu>,
    /// Still dirty in the cache.
    pub rejected: Vec<Rejection>,
    /// Set when the upload was refused and `diagnose_on_reject` is on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<UploadDiagnosis>,
}

/// What a scheduled run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduledRun {
    pub fetched: usize,
    pub relabelled: usize,
}

// =============================================================================
// Engine
// =============================================================================

pub struct CacheSyncEngine {
    directory: Arc<DeviceDirectory>,
    store: Arc<ProductCacheStore>,
    locks: Arc<SyncLocks>,
    factory: Arc<dyn DeviceLinkFactory>,
    credentials: Arc<dyn CredentialStore>,
    links: Mutex<HashMap<DeviceId, Arc<dyn DeviceLink>>>,
    settings: EngineSettings,
}

impl CacheSyncEngine {
    pub fn new(
        directory: Arc<DeviceDirectory>,
        store: Arc<ProductCacheStore>,
        factory: Arc<dyn DeviceLinkFactory>,
        credentials: Arc<dyn CredentialStore>,
        settings: EngineSettings,
    ) -> Self {
        CacheSyncEngine {
            directory,
            store,
            locks: Arc::new(SyncLocks::new()),
            factory,
            credentials,
            links: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<ProductCacheStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<SyncLocks> {
        &self.locks
    }

    pub fn directory(&self) -> &Arc<DeviceDirectory> {
        &self.directory
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    fn cached_link(&self, device_id: DeviceId) -> Option<Arc<dyn DeviceLink>> {
        let links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        links.get(&device_id).cloned()
    }

    /// Drops the open session; the next call reconnects.
    pub fn forget_link(&self, device_id: DeviceId) {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        if links.remove(&device_id).is_some() {
            debug!(device_id = %device_id, "Session dropped");
        }
    }

    async fn link(&self, device_id: DeviceId) -> SyncResult<Arc<dyn DeviceLink>> {
        if let Some(link) = self.cached_link(device_id) {
            return Ok(link);
        }

        let descriptor = self.directory.get(device_id)?;
        let credentials = self.credentials.credentials(device_id).await?;
        let params = ConnectionParams {
            descriptor,
            credentials,
            connect_timeout: self.settings.connect_timeout,
        };

        let link = match timeout(self.settings.connect_timeout, self.factory.connect(&params)).await {
            Ok(result) => result?,
            Err(_) => return Err(SyncError::Timeout(self.settings.connect_timeout)),
        };

        info!(
            device_id = %device_id,
            address = %params.descriptor.address,
            transport = %params.descriptor.transport,
            "Session opened"
        );
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        links.insert(device_id, link.clone());
        Ok(link)
    }

    /// Runs one device call under its deadline, with timing logs.
    async fn call<T, F, Fut>(&self, device_id: DeviceId, op: &'static str, f: F) -> SyncResult<T>
    where
        F: FnOnce(Arc<dyn DeviceLink>) -> Fut,
        Fut: Future<Output = LinkResult<T>>,
    {
        let started = Instant::now();
        debug!(device_id = %device_id, op, "Device call started");

        let result = match self.link(device_id).await {
            Ok(link) => match timeout(self.settings.request_timeout, f(link)).await {
                Ok(result) => result.map_err(SyncError::from),
                Err(_) => Err(SyncError::Timeout(self.settings.request_timeout)),
            },
            Err(err) => Err(err),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(device_id = %device_id, op, duration_ms, "Device call succeeded"),
            Err(err) => {
                self.forget_link(device_id);
                warn!(
                    device_id = %device_id,
                    op,
                    duration_ms,
                    kind = %err.kind(),
                    error = %err,
                    "Device call failed"
                );
            }
        }
        result
    }

    /// Pushes `records` and splits the acknowledgements.
    async fn push_locked(
        &self,
        device_id: DeviceId,
        records: &[Product],
    ) -> SyncResult<(Vec<Plu>, Vec<Rejection>)> {
        let acks = self
            .call(device_id, "push_patch", |link| async move {
                link.push_patch(records).await
            })
            .await?;
        Ok(partition_acks(records, &acks))
    }

    async fn rollback(&self, device_id: DeviceId, undos: &[PatchUndo]) {
        if let Err(err) = self.store.revert(device_id, undos).await {
            error!(device_id = %device_id, error = %err, "Failed to persist reverted cache");
        }
    }

    /// The device already holds `pushed`; failing to record that locally
    /// only leaves them dirty for the next upload.
    async fn record_synced(&self, device_id: DeviceId, pushed: &[Plu]) {
        if let Err(err) = self.store.mark_synced(device_id, pushed).await {
            error!(
                device_id = %device_id,
                plus = pushed.len(),
                error = %err,
                "Failed to persist sync marker"
            );
        }
    }

    /// Takes the device's sync lock. A device deleted while we waited is
    /// reported as unknown, and its cache is left alone.
    async fn lock_known(&self, device_id: DeviceId) -> SyncResult<SyncGuard> {
        let guard = self.locks.lock(device_id).await;
        self.directory.get(device_id)?;
        Ok(guard)
    }

    // =========================================================================
    // Full Refresh
    // =========================================================================

    /// Replaces the cache with the device's table.
    ///
    /// On any failure the cache is left as it was.
    pub async fn refresh(&self, device_id: DeviceId) -> SyncResult<Arc<ProductCache>> {
        self.directory.get(device_id)?;
        let _guard = self.lock_known(device_id).await?;
        self.refresh_locked(device_id).await
    }

    async fn refresh_locked(&self, device_id: DeviceId) -> SyncResult<Arc<ProductCache>> {
        let products = self
            .call(device_id, "fetch_all", |link| async move { link.fetch_all().await })
            .await?;

        if let Err(err) = validate_plu_uniqueness(&products) {
            warn!(device_id = %device_id, error = %err, "Device returned a corrupt table");
            return Err(SyncError::Protocol(format!("Device returned a corrupt table: {}", err)));
        }

        self.store.replace_all(device_id, products).await
    }

    // =========================================================================
    // Patches
    // =========================================================================

    /// Validates and applies one patch locally, then pushes that record.
    pub async fn push_patch(
        &self,
        device_id: DeviceId,
        plu: Plu,
        fields: &Map<String, Value>,
    ) -> SyncResult<Product> {
        self.directory.get(device_id)?;
        let patch = ProductPatch::from_fields(plu, fields)?;

        let _guard = self.lock_known(device_id).await?;
        let applied = self.store.apply_patch(device_id, plu, &patch, false).await?;
        let records = [applied.product.clone()];

        match self.push_locked(device_id, &records).await {
            Ok((_, rejected)) if rejected.is_empty() => {
                self.record_synced(device_id, &[plu]).await;
                info!(device_id = %device_id, plu = %plu, "Product updated");
                Ok(applied.product)
            }
            Ok((_, rejected)) => {
                self.rollback(device_id, &[applied.undo]).await;
                Err(SyncError::Rejected(rejected))
            }
            Err(err) => {
                self.rollback(device_id, &[applied.undo]).await;
                Err(err)
            }
        }
    }

    /// Patches several PLUs; each one succeeds or fails on its own.
    ///
    /// Valid entries go to the device in one call. Entries the device
    /// rejects are reverted individually. A link failure reverts the whole
    /// batch and is returned as the error.
    pub async fn push_batch(
        &self,
        device_id: DeviceId,
        items: &[(Plu, Map<String, Value>)],
    ) -> SyncResult<BatchReport> {
        self.directory.get(device_id)?;

        let mut report = BatchReport::default();
        let mut patches = Vec::with_capacity(items.len());
        for (plu, fields) in items {
            match ProductPatch::from_fields(*plu, fields) {
                Ok(patch) => patches.push((*plu, patch)),
                Err(err) => report.failed.push(PluFailure::new(*plu, &SyncError::from(err))),
            }
        }

        let _guard = self.lock_known(device_id).await?;
        let applied = self.store.apply_batch(device_id, &patches, false).await?;
        report
            .failed
            .extend(applied.failed.iter().map(|(plu, err)| PluFailure::new(*plu, err)));

        if applied.applied.is_empty() {
            return Ok(report);
        }

        let records: Vec<Product> = applied.applied.iter().map(|a| a.product.clone()).collect();
        let undos: Vec<PatchUndo> = applied.applied.iter().map(|a| a.undo.clone()).collect();

        let (accepted, rejected) = match self.push_locked(device_id, &records).await {
            Ok(acks) => acks,
            Err(err) => {
                self.rollback(device_id, &undos).await;
                return Err(err);
            }
        };

        if !rejected.is_empty() {
            let refused: HashSet<Plu> = rejected.iter().map(|r| r.plu).collect();
            let refused_undos: Vec<PatchUndo> = undos
                .into_iter()
                .filter(|u| refused.contains(&u.plu))
                .collect();
            self.rollback(device_id, &refused_undos).await;
            report.failed.extend(rejected.iter().map(PluFailure::rejected));
        }

        self.record_synced(device_id, &accepted).await;
        let accepted: HashSet<Plu> = accepted.into_iter().collect();
        report.updated = records
            .into_iter()
            .filter(|p| accepted.contains(&p.plu))
            .collect();

        info!(
            device_id = %device_id,
            updated = report.updated.len(),
            failed = report.failed.len(),
            "Batch patch finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Staging
    // =========================================================================

    /// Applies a patch locally and marks it for a later upload.
    pub async fn stage_patch(
        &self,
        device_id: DeviceId,
        plu: Plu,
        fields: &Map<String, Value>,
    ) -> SyncResult<Product> {
        self.directory.get(device_id)?;
        let patch = ProductPatch::from_fields(plu, fields)?;

        let _guard = self.lock_known(device_id).await?;
        let applied = self.store.apply_patch(device_id, plu, &patch, true).await?;
        debug!(device_id = %device_id, plu = %plu, "Product staged");
        Ok(applied.product)
    }

    /// Pushes every staged record as one patch.
    ///
    /// Rejected PLUs stay staged. A link failure leaves everything staged.
    /// With `diagnose_on_reject`, a refused upload is followed by a
    /// diagnosis of the whole cached table before the lock is released.
    pub async fn push_staged(&self, device_id: DeviceId) -> SyncResult<PushReport> {
        self.directory.get(device_id)?;
        let _guard = self.lock_known(device_id).await?;

        let cache = self.store.load(device_id);
        if cache.is_empty() {
            return Err(SyncError::EmptyCache(device_id));
        }

        let records = self.store.diff_since(device_id, cache.dirty());
        if records.is_empty() {
            debug!(device_id = %device_id, "Nothing staged");
            return Ok(PushReport::default());
        }

        let (pushed, rejected) = match self.push_locked(device_id, &records).await {
            Ok(acks) => acks,
            Err(err) => {
                if self.settings.diagnose_on_reject && err.kind() == ErrorKind::Protocol {
                    warn!(device_id = %device_id, error = %err, "Upload refused, diagnosing");
                    // The upload error is what the caller gets either way.
                    let _ = self.diagnose_locked(device_id, &cache.products()).await;
                }
                return Err(err);
            }
        };
        self.record_synced(device_id, &pushed).await;

        let mut diagnosis = None;
        if !rejected.is_empty() {
            warn!(
                device_id = %device_id,
                rejected = rejected.len(),
                "Device rejected staged products"
            );
            if self.settings.diagnose_on_reject {
                match self.diagnose_locked(device_id, &cache.products()).await {
                    Ok(found) => diagnosis = Some(found),
                    Err(err) => {
                        warn!(device_id = %device_id, error = %err, "Diagnosis aborted")
                    }
                }
            }
        }
        info!(device_id = %device_id, pushed = pushed.len(), "Staged products uploaded");
        Ok(PushReport {
            pushed,
            rejected,
            diagnosis,
        })
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Uploads the cached table piece by piece to find what the device
    /// refuses. The cache itself is not modified.
    pub async fn diagnose(&self, device_id: DeviceId) -> SyncResult<UploadDiagnosis> {
        self.directory.get(device_id)?;
        let _guard = self.lock_known(device_id).await?;

        let products = self.store.load(device_id).products();
        if products.is_empty() {
            return Err(SyncError::EmptyCache(device_id));
        }
        self.diagnose_locked(device_id, &products).await
    }

    async fn diagnose_locked(
        &self,
        device_id: DeviceId,
        products: &[Product],
    ) -> SyncResult<UploadDiagnosis> {
        let diagnosis = find_breaking_products(products, self.settings.diagnosis, |batch| async move {
            let attempt = match self.push_locked(device_id, &batch).await {
                Ok((_, rejected)) if rejected.is_empty() => Ok(()),
                Ok((_, rejected)) => Err(SyncError::Rejected(rejected)),
                Err(err) => Err(err),
            };
            classify_attempt(attempt)
        })
        .await?;

        info!(
            device_id = %device_id,
            ok = diagnosis.ok_count,
            total = diagnosis.total_count,
            bad = diagnosis.bad_products.len(),
            "Upload diagnosis finished"
        );
        Ok(diagnosis)
    }

    // =========================================================================
    // Scheduled Runs
    // =========================================================================

    /// One auto-update run. The caller already holds the device's sync lock.
    ///
    /// With `relabel_on`, label dates are moved to that day after the fetch
    /// and the changed products pushed back. Rejected or unsent products are
    /// reverted.
    pub async fn run_scheduled(
        &self,
        _guard: &SyncGuard,
        device_id: DeviceId,
        relabel_on: Option<NaiveDate>,
    ) -> SyncResult<ScheduledRun> {
        self.directory.get(device_id)?;
        let cache = self.refresh_locked(device_id).await?;
        let mut run = ScheduledRun {
            fetched: cache.len(),
            relabelled: 0,
        };

        let Some(today) = relabel_on else {
            return Ok(run);
        };

        let changed = relabel(&cache.products(), today)?;
        if changed.is_empty() {
            return Ok(run);
        }

        let undos = self.store.apply_records(device_id, changed.clone()).await?;
        let (accepted, rejected) = match self.push_locked(device_id, &changed).await {
            Ok(acks) => acks,
            Err(err) => {
                self.rollback(device_id, &undos).await;
                return Err(err);
            }
        };

        self.record_synced(device_id, &accepted).await;
        if !rejected.is_empty() {
            let refused: HashSet<Plu> = rejected.iter().map(|r| r.plu).collect();
            let refused_undos: Vec<PatchUndo> = undos
                .into_iter()
                .filter(|u| refused.contains(&u.plu))
                .collect();
            self.rollback(device_id, &refused_undos).await;
            return Err(SyncError::Rejected(rejected));
        }

        run.relabelled = accepted.len();
        info!(device_id = %device_id, relabelled = run.relabelled, "Label dates refreshed");
        Ok(run)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
