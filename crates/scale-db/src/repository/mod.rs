//! # Repository Module
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repositories                                         │
//! │                                                                         │
//! │  ProductCacheStore (scale-sync)                                        │
//! │       │  db.caches().save(device_id, &snapshot)                        │
//! │       ▼                                                                 │
//! │  ProductCacheRepository ── product_caches (one JSON row per device)    │
//! │                                                                         │
//! │  ScheduleRegistry (scale-sync)                                         │
//! │       │  db.schedules().record_failure(device_id, ...)                 │
//! │       ▼                                                                 │
//! │  ScheduleRepository ────── auto_update_schedules                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`ProductCacheRepository`](cache::ProductCacheRepository) - Whole-table snapshots
//! - [`ScheduleRepository`](schedule::ScheduleRepository) - Auto-update config and last run

pub mod cache;
pub mod schedule;
