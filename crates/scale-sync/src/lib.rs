//! # scale-sync: Cache Sync Engine and Auto-Update Scheduler
//!
//! Keeps a server-side copy of every scale's PLU table in step with the
//! device, pushes operator edits back entry by entry, and re-synchronises
//! each device on its own schedule.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Scale Sync Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   ScaleService (facade)                          │  │
//! │  │  products, patches, staging, diagnostics, auto-update status,    │  │
//! │  │  device created / updated / deleted notifications                │  │
//! │  └───────────┬─────────────────────────────┬────────────────────────┘  │
//! │              ▼                             ▼                            │
//! │  ┌────────────────────────┐    ┌─────────────────────────────────┐     │
//! │  │   CacheSyncEngine      │◄───│  ScheduleRegistry               │     │
//! │  │                        │    │  one timer task per device,     │     │
//! │  │  refresh / push_patch  │    │  generation-checked rebuilds,   │     │
//! │  │  batch / staged / diag │    │  capped exponential backoff     │     │
//! │  └───┬──────────┬─────────┘    └─────────────────────────────────┘     │
//! │      │          │                                                       │
//! │      ▼          ▼                                                       │
//! │  ┌────────┐ ┌──────────────────┐   ┌────────────────────────────┐     │
//! │  │SyncLock│ │ProductCacheStore │──►│ scale-db (optional SQLite) │     │
//! │  │per dev │ │ArcSwap snapshots │   └────────────────────────────┘     │
//! │  └────────┘ └──────────────────┘                                       │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  DeviceLink (trait) ── hardware drivers, MockLink for tests            │
//! │                                                                         │
//! │  RULES:                                                                │
//! │  • Every hardware call happens under the device's sync lock            │
//! │  • Readers never take the sync lock                                    │
//! │  • The engine never retries; only scheduled runs back off              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`link`] - Device link traits, descriptors, credentials
//! - [`devices`] - Directory of known devices
//! - [`lock`] - Per-device sync locks
//! - [`store`] - Product cache store
//! - [`engine`] - Cache sync engine
//! - [`diagnostics`] - Bisection search for products a device refuses
//! - [`scheduler`] - Timer tasks, schedule states, retry policy
//! - [`registry`] - Schedule registry
//! - [`service`] - `ScaleService` facade
//! - [`config`] - Service configuration
//! - [`error`] - Error types
//! - [`mock`] - In-memory device link
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scale_sync::{ScaleService, ServiceConfig, NoCredentials};
//!
//! let config = ServiceConfig::load(None)?;
//! let service = ScaleService::new(config, factory, Arc::new(NoCredentials), None);
//! service.device_created(descriptor, AutoUpdateConfig::new(true, Duration::from_secs(3600))).await?;
//!
//! let products = service.refresh_products(device_id).await?;
//! let updated = service.patch_product(device_id, plu, &fields).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod devices;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod link;
pub mod lock;
pub mod mock;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{
    AutoUpdateSettings, CacheSettings, DatabaseSettings, DeviceEntry, LinkSettings, ServiceConfig,
};
pub use devices::DeviceDirectory;
pub use diagnostics::{DiagnosisSettings, UploadDiagnosis};
pub use engine::{BatchReport, CacheSyncEngine, EngineSettings, PluFailure, PushReport, ScheduledRun};
pub use error::{ErrorKind, LinkError, LinkResult, Rejection, SyncError, SyncResult};
pub use link::{
    ConnectionParams, CredentialStore, Credentials, DeviceDescriptor, DeviceLink,
    DeviceLinkFactory, EntryAck, NoCredentials, Transport,
};
pub use lock::{SyncGuard, SyncLocks};
pub use registry::ScheduleRegistry;
pub use scheduler::{AutoUpdateStatus, RetryPolicy, RunOutcome, ScheduleState};
pub use service::ScaleService;
pub use store::{AppliedPatch, BatchApplied, PatchUndo, ProductCache, ProductCacheStore};
