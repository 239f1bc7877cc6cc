//! # Schedule Registry
//!
//! The set of per-device auto-update timers, keyed by device.
//!
//! ## Rebuild Guarantee
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  apply(device, config)        (one change at a time)                   │
//! │    1. store the config                                                 │
//! │    2. take the old TimerHandle  ── dropping it cancels the timer       │
//! │    3. arm a new timer with a fresh generation number                   │
//! │                                                                         │
//! │  old timer sleeping   → wakes on cancel, exits, never fires            │
//! │  old timer mid-run    → run completes, records last_run, then exits    │
//! │                         (state/next_run only written by the current    │
//! │                          generation)                                   │
//! │                                                                         │
//! │  At no point do two timers for one device both have a future tick.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{info, warn};

use scale_core::{AutoUpdateConfig, DeviceId};
use scale_db::{Database, ScheduleRepository};

use crate::config::AutoUpdateSettings;
use crate::engine::CacheSyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::scheduler::{
    wall_clock, AutoUpdateStatus, ScheduleSlot, ScheduleState, SlotMap, Timer,
};

pub struct ScheduleRegistry {
    slots: SlotMap,
    /// Held across the whole of a config change, storage write included.
    changes: AsyncMutex<()>,
    engine: Arc<CacheSyncEngine>,
    settings: AutoUpdateSettings,
    repo: Option<ScheduleRepository>,
    generation: AtomicU64,
}

impl ScheduleRegistry {
    pub fn new(engine: Arc<CacheSyncEngine>, settings: AutoUpdateSettings) -> Self {
        ScheduleRegistry {
            slots: Arc::new(Mutex::new(HashMap::new())),
            changes: AsyncMutex::new(()),
            engine,
            settings,
            repo: None,
            generation: AtomicU64::new(0),
        }
    }

    /// Stores configuration and run results in `db`.
    pub fn with_database(mut self, db: &Database) -> Self {
        self.repo = Some(db.schedules());
        self
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<DeviceId, ScheduleSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Configuration Changes
    // =========================================================================

    /// Turns auto-update on with `interval`.
    pub async fn enable(&self, device_id: DeviceId, interval: Duration) -> SyncResult<()> {
        let config = checked(device_id, true, interval)?;
        self.update(device_id, |_| config).await
    }

    /// Turns auto-update off, keeping the interval. A running sync finishes;
    /// no further tick happens.
    pub async fn disable(&self, device_id: DeviceId) -> SyncResult<()> {
        let default_interval = self.settings.default_interval_secs;
        self.update(device_id, |current| AutoUpdateConfig {
            enabled: false,
            interval_secs: current.map_or(default_interval, |c| c.interval_secs),
        })
        .await
    }

    /// Changes the interval, keeping the enabled flag.
    pub async fn rebuild(&self, device_id: DeviceId, interval: Duration) -> SyncResult<()> {
        let config = checked(device_id, false, interval)?;
        self.update(device_id, |current| AutoUpdateConfig {
            enabled: current.is_some_and(|c| c.enabled),
            ..config
        })
        .await
    }

    /// Stores `config` and re-arms the device's timer to match it.
    ///
    /// ## Errors
    /// - `Config` for a zero interval; nothing changes
    /// - `Storage` if the config could not be saved; nothing changes
    pub async fn apply(&self, device_id: DeviceId, config: AutoUpdateConfig) -> SyncResult<()> {
        self.update(device_id, |_| config).await
    }

    /// Derives the new config from the current one, stores it and re-arms.
    ///
    /// Changes are serialised end to end, so the stored record and the live
    /// timer always end up describing the same change.
    async fn update(
        &self,
        device_id: DeviceId,
        derive: impl FnOnce(Option<AutoUpdateConfig>) -> AutoUpdateConfig,
    ) -> SyncResult<()> {
        let _changing = self.changes.lock().await;

        let config = derive(self.config(device_id));
        config
            .validate()
            .map_err(|e| SyncError::Config(format!("device {}: {}", device_id, e)))?;

        if let Some(repo) = &self.repo {
            repo.upsert_config(device_id, &config).await?;
        }

        let mut slots = self.slots();
        let slot = slots
            .entry(device_id)
            .or_insert_with(|| ScheduleSlot::new(config));
        slot.config = config;
        self.arm(device_id, slot);
        Ok(())
    }

    /// Replaces the slot's timer according to its config.
    fn arm(&self, device_id: DeviceId, slot: &mut ScheduleSlot) {
        // Cancel first so the old and new timers never overlap.
        slot.timer = None;
        slot.retry_delay = None;

        if !slot.config.enabled || !self.settings.enabled {
            slot.state = ScheduleState::Disabled;
            slot.next_run_at = None;
            info!(
                device_id = %device_id,
                configured = slot.config.enabled,
                service_enabled = self.settings.enabled,
                "Auto-update disabled"
            );
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let interval = slot.config.interval();
        let first_tick = Instant::now() + interval;

        slot.timer = Some(
            Timer {
                device_id,
                generation,
                interval,
                first_tick,
                slots: self.slots.clone(),
                engine: self.engine.clone(),
                settings: self.settings.clone(),
                repo: self.repo.clone(),
            }
            .spawn(),
        );
        slot.state = ScheduleState::Scheduled;
        slot.next_run_at = Some(wall_clock(first_tick));

        info!(
            device_id = %device_id,
            interval_secs = slot.config.interval_secs,
            generation,
            "Auto-update scheduled"
        );
    }

    /// Cancels the timer and forgets the schedule, including stored records.
    pub async fn remove(&self, device_id: DeviceId) -> SyncResult<()> {
        let _changing = self.changes.lock().await;
        let removed = self.slots().remove(&device_id);
        if removed.is_some() {
            info!(device_id = %device_id, "Auto-update schedule removed");
        }
        if let Some(repo) = &self.repo {
            repo.delete(device_id).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn config(&self, device_id: DeviceId) -> Option<AutoUpdateConfig> {
        self.slots().get(&device_id).map(|slot| slot.config)
    }

    pub fn status(&self, device_id: DeviceId) -> Option<AutoUpdateStatus> {
        self.slots().get(&device_id).map(|slot| slot.status(device_id))
    }

    /// Number of live timers across all devices.
    pub fn active_timer_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| slot.timer.as_ref().is_some_and(|t| !t.is_finished()))
            .count()
    }

    pub fn has_timer(&self, device_id: DeviceId) -> bool {
        self.slots()
            .get(&device_id)
            .is_some_and(|slot| slot.timer.is_some())
    }

    // =========================================================================
    // Startup & Shutdown
    // =========================================================================

    /// Loads stored schedules without arming them. Returns the device ids.
    pub async fn restore(&self) -> SyncResult<Vec<DeviceId>> {
        let Some(repo) = &self.repo else {
            return Ok(Vec::new());
        };

        let records = repo.list().await?;
        let mut slots = self.slots();
        let mut ids = Vec::with_capacity(records.len());
        for record in &records {
            let device_id = record.device_id();
            slots
                .entry(device_id)
                .or_insert_with(|| ScheduleSlot::from_record(record));
            ids.push(device_id);
        }

        info!(restored = ids.len(), "Auto-update schedules restored");
        Ok(ids)
    }

    /// Arms a restored schedule that has no timer yet. Returns true if a
    /// timer is now running.
    pub fn resume(&self, device_id: DeviceId) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&device_id) else {
            return false;
        };
        if slot.timer.is_none() {
            self.arm(device_id, slot);
        }
        slot.timer.is_some()
    }

    /// Cancels every timer and waits for in-flight runs to finish.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = {
            let mut slots = self.slots();
            slots
                .values_mut()
                .filter_map(|slot| {
                    slot.state = ScheduleState::Disabled;
                    slot.next_run_at = None;
                    slot.timer.take()
                })
                .map(|timer| timer.stop())
                .collect()
        };

        let count = tasks.len();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Auto-update timer ended abnormally");
            }
        }
        info!(stopped = count, "Auto-update timers stopped");
    }
}

/// Turns a caller-supplied interval into a config.
fn checked(device_id: DeviceId, enabled: bool, interval: Duration) -> SyncResult<AutoUpdateConfig> {
    AutoUpdateConfig::from_interval(enabled, interval)
        .map_err(|e| SyncError::Config(format!("device {}: {}", device_id, e)))
}

// =============================================================================
// Unit Tests
// =============================================================================
