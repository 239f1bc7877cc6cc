//! # scale-db
//!
//! Durable storage for the scale sync service: one JSON snapshot per
//! device's product cache, and one record per device's auto-update
//! schedule. Nothing here locks, caches or talks to hardware; the
//! scale-sync store and registry decide when to write.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ProductCacheStore ──► db.caches()    ──► product_cache                │
//! │  ScheduleRegistry  ──► db.schedules() ──► auto_update_schedule         │
//! │                                                                         │
//! │  Database::new(DbConfig) opens the file (or memory) and migrates it.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ```rust,ignore
//! use scale_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("scales.db")).await?;
//! for device_id in db.caches().list_device_ids().await? {
//!     if let Some(snapshot) = db.caches().load(device_id).await? {
//!         println!("device {} v{}", device_id, snapshot.version);
//!     }
//! }
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::cache::{CacheSnapshot, ProductCacheRepository};
pub use repository::schedule::{RunStatus, ScheduleRecord, ScheduleRepository};
