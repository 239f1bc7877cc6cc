//! # Scale Service
//!
//! The facade the HTTP layer and the device registry talk to.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  HTTP handlers                    Device registry                      │
//! │   get_products ─────┐              device_created ──┐                  │
//! │   refresh_products  │              device_updated   │                  │
//! │   patch_product(s)  │              device_deleted ──┤                  │
//! │   stage / upload    │                               │                  │
//! │   diagnose_upload   │                               │                  │
//! │   auto-update status/set                            │                  │
//! │                     ▼                               ▼                  │
//! │              ┌────────────────────────────────────────────┐            │
//! │              │                ScaleService                │            │
//! │              └──┬──────────────┬─────────────┬────────────┘            │
//! │                 ▼              ▼             ▼                          │
//! │        ProductCacheStore  CacheSyncEngine  ScheduleRegistry            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use scale_core::{AutoUpdateConfig, DeviceId, Plu, Product};
use scale_db::Database;

use crate::config::ServiceConfig;
use crate::devices::DeviceDirectory;
use crate::diagnostics::UploadDiagnosis;
use crate::engine::{BatchReport, CacheSyncEngine, EngineSettings, PushReport};
use crate::error::{SyncError, SyncResult};
use crate::link::{CredentialStore, DeviceDescriptor, DeviceLinkFactory};
use crate::registry::ScheduleRegistry;
use crate::scheduler::AutoUpdateStatus;
use crate::store::ProductCacheStore;

/// One per process. Owns the cache store, the engine and the timers.
pub struct ScaleService {
    config: ServiceConfig,
    directory: Arc<DeviceDirectory>,
    store: Arc<ProductCacheStore>,
    engine: Arc<CacheSyncEngine>,
    registry: ScheduleRegistry,
    database: Option<Database>,
}

impl ScaleService {
    /// Wires up the subsystem. With a database, caches and schedules are
    /// persisted; call [`ScaleService::restore`] to load them back.
    pub fn new(
        config: ServiceConfig,
        factory: Arc<dyn DeviceLinkFactory>,
        credentials: Arc<dyn CredentialStore>,
        database: Option<Database>,
    ) -> Self {
        let directory = Arc::new(DeviceDirectory::new());

        let mut store = ProductCacheStore::new(config.cache.require_existing_plu);
        if let Some(db) = &database {
            store = store.with_database(db);
        }
        let store = Arc::new(store);

        let engine = Arc::new(CacheSyncEngine::new(
            directory.clone(),
            store.clone(),
            factory,
            credentials,
            EngineSettings {
                diagnose_on_reject: config.cache.diagnose_on_reject,
                ..EngineSettings::from_link(&config.link)
            },
        ));

        let mut registry = ScheduleRegistry::new(engine.clone(), config.auto_update.clone());
        if let Some(db) = &database {
            registry = registry.with_database(db);
        }

        ScaleService {
            config,
            directory,
            store,
            engine,
            registry,
            database,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<CacheSyncEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &ScheduleRegistry {
        &self.registry
    }

    // =========================================================================
    // Products
    // =========================================================================

    /// Cached products in device order. No hardware call.
    pub fn get_products(&self, device_id: DeviceId) -> SyncResult<Vec<Product>> {
        self.directory.get(device_id)?;
        Ok(self.store.load(device_id).products())
    }

    /// Full resync from the device.
    pub async fn refresh_products(&self, device_id: DeviceId) -> SyncResult<Vec<Product>> {
        let cache = self.engine.refresh(device_id).await?;
        Ok(cache.products())
    }

    /// Changes one product on the device and in the cache.
    ///
    /// Only the fields present in `fields` change. The cache entry is put
    /// back if the device refuses the record or the call fails.
    ///
    /// ## Errors
    /// - `Validation` for a bad field, with nothing sent
    /// - `Rejected` if the device refuses the record
    /// - `Connection` or `Timeout` from the link
    pub async fn patch_product(
        &self,
        device_id: DeviceId,
        plu: Plu,
        fields: &Map<String, Value>,
    ) -> SyncResult<Product> {
        self.engine.push_patch(device_id, plu, fields).await
    }

    /// Like [`ScaleService::patch_product`] for several PLUs in one push.
    /// The report says which PLUs made it.
    pub async fn patch_products(
        &self,
        device_id: DeviceId,
        items: &[(Plu, Map<String, Value>)],
    ) -> SyncResult<BatchReport> {
        self.engine.push_batch(device_id, items).await
    }

    /// Local edit for a later [`ScaleService::upload_staged`].
    pub async fn stage_product(
        &self,
        device_id: DeviceId,
        plu: Plu,
        fields: &Map<String, Value>,
    ) -> SyncResult<Product> {
        self.engine.stage_patch(device_id, plu, fields).await
    }

    /// Sends every staged edit in one push. Rejected PLUs stay staged; with
    /// `cache.diagnose_on_reject` the report also carries a diagnosis.
    pub async fn upload_staged(&self, device_id: DeviceId) -> SyncResult<PushReport> {
        self.engine.push_staged(device_id).await
    }

    /// Finds the cached products the device refuses. Holds the device for
    /// many uploads.
    pub async fn diagnose_upload(&self, device_id: DeviceId) -> SyncResult<UploadDiagnosis> {
        self.engine.diagnose(device_id).await
    }

    // =========================================================================
    // Auto-Update
    // =========================================================================

    /// A device without a schedule reads as disabled with the default
    /// interval.
    pub fn get_auto_update_status(&self, device_id: DeviceId) -> SyncResult<AutoUpdateStatus> {
        self.directory.get(device_id)?;
        Ok(self.registry.status(device_id).unwrap_or_else(|| {
            AutoUpdateStatus::disabled(device_id, self.config.auto_update.default_interval_secs)
        }))
    }

    /// Turns the device's schedule on or off with the given interval.
    ///
    /// ## Errors
    /// - `Config` for a zero interval or one that is not whole seconds
    /// - `UnknownDevice` for a device this service was never told about
    pub async fn set_auto_update(
        &self,
        device_id: DeviceId,
        enabled: bool,
        interval: Duration,
    ) -> SyncResult<()> {
        self.directory.get(device_id)?;
        let config = AutoUpdateConfig::from_interval(enabled, interval)
            .map_err(|e| SyncError::Config(format!("device {}: {}", device_id, e)))?;
        self.registry.apply(device_id, config).await
    }

    // =========================================================================
    // Device Notifications
    // =========================================================================

    /// Registers the device and arms its schedule when enabled.
    pub async fn device_created(
        &self,
        descriptor: DeviceDescriptor,
        auto_update: AutoUpdateConfig,
    ) -> SyncResult<()> {
        let device_id = descriptor.id;
        self.directory.upsert(descriptor);
        self.registry.apply(device_id, auto_update).await?;
        info!(device_id = %device_id, "Device registered");
        Ok(())
    }

    /// A changed descriptor drops the open session. The timer is only
    /// rebuilt when the schedule itself changed.
    pub async fn device_updated(
        &self,
        descriptor: DeviceDescriptor,
        auto_update: AutoUpdateConfig,
    ) -> SyncResult<()> {
        let device_id = descriptor.id;
        let previous = self.directory.upsert(descriptor.clone());
        if previous.as_ref() != Some(&descriptor) {
            self.engine.forget_link(device_id);
        }

        if self.registry.config(device_id) != Some(auto_update) {
            self.registry.apply(device_id, auto_update).await?;
        }
        info!(device_id = %device_id, "Device updated");
        Ok(())
    }

    /// Cancels the schedule and drops the cache. A sync already running
    /// for the device finishes first; calls still queued on its lock then
    /// fail with `UnknownDevice`.
    pub async fn device_deleted(&self, device_id: DeviceId) -> SyncResult<()> {
        self.directory.remove(device_id);
        self.registry.remove(device_id).await?;
        self.engine.forget_link(device_id);
        {
            let _guard = self.engine.locks().lock(device_id).await;
            self.store.remove(device_id).await?;
        }
        self.engine.locks().remove_idle(device_id);
        info!(device_id = %device_id, "Device removed");
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Loads persisted caches and schedules. Schedules of devices already
    /// registered are re-armed; the rest wait for `device_created`.
    pub async fn restore(&self) -> SyncResult<()> {
        let caches = self.store.restore().await?;
        let schedules = self.registry.restore().await?;

        let mut armed = 0;
        for device_id in schedules {
            if self.directory.contains(device_id) && self.registry.resume(device_id) {
                armed += 1;
            }
        }
        info!(caches, armed, "Service state restored");
        Ok(())
    }

    /// Stops all timers (letting running syncs finish) and closes storage.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        if let Some(db) = &self.database {
            db.close().await;
        }
        info!("Scale service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, SyncError};
    use crate::link::{NoCredentials, Transport};
    use crate::mock::MockLinkFactory;
    use crate::scheduler::ScheduleState;
    use scale_core::Money;
    use scale_db::DbConfig;
    use serde_json::json;

    const DEV: DeviceId = DeviceId(3);

    fn descriptor(address: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DEV,
            name: "Produce".into(),
            address: address.into(),
            port: 1111,
            transport: Transport::Tcp,
        }
    }

    fn service(factory: Arc<MockLinkFactory>, db: Option<Database>) -> ScaleService {
        ScaleService::new(ServiceConfig::default(), factory, Arc::new(NoCredentials), db)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_everywhere() {
        let svc = service(Arc::new(MockLinkFactory::new()), None);
        assert!(matches!(svc.get_products(DEV), Err(SyncError::UnknownDevice(_))));
        assert!(matches!(svc.get_auto_update_status(DEV), Err(SyncError::UnknownDevice(_))));
        let err = svc.set_auto_update(DEV, true, Duration::from_secs(60)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_second_intervals_rejected() {
        let svc = service(Arc::new(MockLinkFactory::new()), None);
        svc.device_created(descriptor("10.0.0.3"), AutoUpdateConfig::default())
            .await
            .unwrap();

        for millis in [500, 1999] {
            let err = svc
                .set_auto_update(DEV, true, Duration::from_millis(millis))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config);
        }
        let status = svc.get_auto_update_status(DEV).unwrap();
        assert!(!status.enabled);
        assert_eq!(status.interval_secs, 3600);

        svc.set_auto_update(DEV, true, Duration::from_secs(2)).await.unwrap();
        assert_eq!(svc.get_auto_update_status(DEV).unwrap().interval_secs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_lifecycle() {
        let factory = Arc::new(MockLinkFactory::new());
        let svc = service(factory.clone(), None);

        svc.device_created(descriptor("10.0.0.3"), AutoUpdateConfig::default())
            .await
            .unwrap();
        let status = svc.get_auto_update_status(DEV).unwrap();
        assert_eq!(status.state, ScheduleState::Disabled);

        factory.link(DEV).set_products(vec![Product::new(
            Plu::new(100).unwrap(),
            "Apples",
            Money::from_cents(150),
        )]);
        svc.refresh_products(DEV).await.unwrap();
        assert_eq!(factory.connect_count(), 1);

        // New address: next call opens a new session.
        svc.device_updated(
            descriptor("10.0.0.4"),
            AutoUpdateConfig::new(true, Duration::from_secs(600)),
        )
        .await
        .unwrap();
        svc.refresh_products(DEV).await.unwrap();
        assert_eq!(factory.connect_count(), 2);
        assert!(svc.registry().has_timer(DEV));

        svc.device_deleted(DEV).await.unwrap();
        assert!(!svc.registry().has_timer(DEV));
        assert!(svc.get_products(DEV).is_err());
        assert!(svc.engine().store().load(DEV).is_empty());
    }

    #[tokio::test]
    async fn test_patch_queued_behind_delete() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let factory = Arc::new(MockLinkFactory::new());
        factory.link(DEV).set_products(vec![Product::new(
            Plu::new(100).unwrap(),
            "Apples",
            Money::from_cents(150),
        )]);
        let svc = Arc::new(service(factory.clone(), Some(db.clone())));
        svc.device_created(descriptor("10.0.0.3"), AutoUpdateConfig::default())
            .await
            .unwrap();
        svc.refresh_products(DEV).await.unwrap();

        let held = svc.engine().locks().lock(DEV).await;
        let patch = tokio::spawn({
            let svc = svc.clone();
            async move {
                let fields = json!({"price": 2});
                svc.patch_product(DEV, Plu::new(100).unwrap(), fields.as_object().unwrap())
                    .await
            }
        });
        while svc.engine().locks().users(DEV) < 2 {
            tokio::task::yield_now().await;
        }
        let delete = tokio::spawn({
            let svc = svc.clone();
            async move { svc.device_deleted(DEV).await }
        });
        while svc.directory.contains(DEV) {
            tokio::task::yield_now().await;
        }
        drop(held);

        let err = patch.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::UnknownDevice(_)));
        delete.await.unwrap().unwrap();

        assert_eq!(factory.link(DEV).push_count(), 0);
        assert!(svc.engine().store().load(DEV).is_empty());
        assert!(db.caches().load(DEV).await.unwrap().is_none());
        assert_eq!(svc.engine().locks().users(DEV), 0);

        // Re-created under the same id: one lock, one conversation at a time.
        svc.device_created(descriptor("10.0.0.3"), AutoUpdateConfig::default())
            .await
            .unwrap();
        let first = svc.engine().locks().lock(DEV).await;
        assert!(svc
            .engine()
            .locks()
            .try_lock_for(DEV, Duration::from_millis(20))
            .await
            .is_none());
        drop(first);
    }

    #[tokio::test]
    async fn test_accepted_patch_survives_marker_write_failure() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let factory = Arc::new(MockLinkFactory::new());
        factory.link(DEV).set_products(vec![Product::new(
            Plu::new(100).unwrap(),
            "Apples",
            Money::from_cents(150),
        )]);
        let svc = service(factory.clone(), Some(db.clone()));
        svc.device_created(descriptor("10.0.0.3"), AutoUpdateConfig::default())
            .await
            .unwrap();
        svc.refresh_products(DEV).await.unwrap();

        // The local apply is the next write; the write after it fails.
        let applied_version = svc.engine().store().load(DEV).version() + 1;
        sqlx::query(&format!(
            "CREATE TRIGGER refuse_cache_writes BEFORE UPDATE ON product_caches \
             WHEN NEW.version > {} BEGIN SELECT RAISE(ABORT, 'disk full'); END",
            applied_version
        ))
        .execute(db.pool())
        .await
        .unwrap();

        let fields = json!({"price": 2});
        let product = svc
            .patch_product(DEV, Plu::new(100).unwrap(), fields.as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(product.price, Money::from_cents(200));
        assert_eq!(factory.link(DEV).products()[0].price, Money::from_cents(200));
        assert_eq!(svc.get_products(DEV).unwrap()[0].price, Money::from_cents(200));
    }

    #[tokio::test]
    async fn test_restore_rearms_known_devices() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let factory = Arc::new(MockLinkFactory::new());
        factory.link(DEV).set_products(vec![Product::new(
            Plu::new(1).unwrap(),
            "Bread",
            Money::from_cents(300),
        )]);

        let first = service(factory.clone(), Some(db.clone()));
        first
            .device_created(descriptor("10.0.0.3"), AutoUpdateConfig::new(true, Duration::from_secs(3600)))
            .await
            .unwrap();
        first.refresh_products(DEV).await.unwrap();
        first
            .stage_product(DEV, Plu::new(1).unwrap(), json!({"price": 4}).as_object().unwrap())
            .await
            .unwrap();
        first.registry().shutdown().await;

        let second = service(factory, Some(db));
        second.engine().directory().upsert(descriptor("10.0.0.3"));
        second.restore().await.unwrap();

        let products = second.get_products(DEV).unwrap();
        assert_eq!(products[0].price, Money::from_cents(400));
        assert_eq!(second.engine().store().load(DEV).dirty().len(), 1);
        assert!(second.registry().has_timer(DEV));
        second.shutdown().await;
    }
}
