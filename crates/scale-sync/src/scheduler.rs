//! # Auto-Update Scheduler
//!
//! One timer task per device, each driving scheduled refreshes through the
//! [`CacheSyncEngine`].
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │              enable / create                                            │
//! │   Disabled ─────────────────► Scheduled ◄──────────────┐               │
//! │      ▲                            │                     │ success       │
//! │      │ disable / delete           │ timer fires         │ (next = fire  │
//! │      │ (from any state;           ▼                     │  + interval)  │
//! │      │  a running sync    ┌──► Running ────────────────┘               │
//! │      │  finishes first)   │       │                                     │
//! │      │                    │       │ failure                             │
//! │      │       retry fires  │       ▼                                     │
//! │      │                    └── FailedBackoff (next = now + backoff)     │
//! │                                                                         │
//! │  Device busy for longer than lock_wait: the tick is skipped and the    │
//! │  timer re-armed one interval later. No run queues up.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Backoff
//! Failed runs retry after `initial_retry`, doubling per consecutive
//! failure, capped at `min(interval, backoff_cap)`. A success resets the
//! sequence and the timer returns to the normal interval.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use scale_core::{AutoUpdateConfig, DeviceId};
use scale_db::{RunStatus, ScheduleRecord, ScheduleRepository};

use crate::config::AutoUpdateSettings;
use crate::engine::CacheSyncEngine;
use crate::error::{ErrorKind, SyncError};

// =============================================================================
// Status Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    Disabled,
    Scheduled,
    Running,
    FailedBackoff,
}

/// Result of the most recent scheduled run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Success {
        at: DateTime<Utc>,
    },
    Failure {
        at: DateTime<Utc>,
        error_kind: ErrorKind,
        message: String,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }

    /// Rebuilds the outcome stored on a schedule record.
    pub fn from_record(record: &ScheduleRecord) -> Option<Self> {
        let at = record.last_run_at?;
        match record.status()? {
            RunStatus::Ok => Some(RunOutcome::Success { at }),
            RunStatus::Error => Some(RunOutcome::Failure {
                at,
                error_kind: record
                    .last_error_kind
                    .as_deref()
                    .and_then(ErrorKind::parse)
                    .unwrap_or(ErrorKind::Connection),
                message: record.last_error.clone().unwrap_or_default(),
            }),
        }
    }
}

/// Snapshot of one device's schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoUpdateStatus {
    pub device_id: DeviceId,
    pub enabled: bool,
    pub interval_secs: u64,
    pub state: ScheduleState,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run: Option<RunOutcome>,
    pub consecutive_failures: u32,
    /// Delay used for the pending retry while in `FailedBackoff`.
    pub retry_delay_secs: Option<u64>,
}

impl AutoUpdateStatus {
    /// Status of a device that never had a schedule.
    pub fn disabled(device_id: DeviceId, interval_secs: u64) -> Self {
        AutoUpdateStatus {
            device_id,
            enabled: false,
            interval_secs,
            state: ScheduleState::Disabled,
            next_run_at: None,
            last_run: None,
            consecutive_failures: 0,
            retry_delay_secs: None,
        }
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Capped exponential delays for failed scheduled runs.
#[derive(Debug)]
pub struct RetryPolicy {
    backoff: ExponentialBackoff,
    cap: Duration,
}

impl RetryPolicy {
    pub fn new(interval: Duration, settings: &AutoUpdateSettings) -> Self {
        let cap = interval.min(settings.backoff_cap());
        let initial = settings.initial_retry().min(cap);
        RetryPolicy {
            backoff: ExponentialBackoff {
                current_interval: initial,
                initial_interval: initial,
                randomization_factor: 0.0,
                multiplier: 2.0,
                max_interval: cap,
                max_elapsed_time: None,
                ..Default::default()
            },
            cap,
        }
    }

    /// Whole milliseconds; the backoff crate can add a nanosecond of jitter
    /// even with randomization off.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.backoff.next_backoff().unwrap_or(self.cap).min(self.cap);
        Duration::from_millis(delay.as_millis() as u64)
    }

    pub fn reset(&mut self) {
        self.backoff.reset();
    }
}

// =============================================================================
// Schedule Slots
// =============================================================================

/// Cancels the timer task when dropped. An in-flight run is not interrupted.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    pub(crate) generation: u64,
    cancel: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancels the timer and hands back its task so the caller can wait
    /// for an in-flight run to finish.
    pub(crate) fn stop(self) -> JoinHandle<()> {
        drop(self.cancel);
        self.task
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Everything the registry knows about one device's schedule.
#[derive(Debug)]
pub(crate) struct ScheduleSlot {
    pub(crate) config: AutoUpdateConfig,
    pub(crate) state: ScheduleState,
    pub(crate) next_run_at: Option<DateTime<Utc>>,
    pub(crate) last_run: Option<RunOutcome>,
    pub(crate) consecutive_failures: u32,
    pub(crate) retry_delay: Option<Duration>,
    pub(crate) timer: Option<TimerHandle>,
}

impl ScheduleSlot {
    pub(crate) fn new(config: AutoUpdateConfig) -> Self {
        ScheduleSlot {
            config,
            state: ScheduleState::Disabled,
            next_run_at: None,
            last_run: None,
            consecutive_failures: 0,
            retry_delay: None,
            timer: None,
        }
    }

    pub(crate) fn from_record(record: &ScheduleRecord) -> Self {
        let mut slot = ScheduleSlot::new(record.config());
        slot.last_run = RunOutcome::from_record(record);
        slot.consecutive_failures = record.consecutive_failures.max(0) as u32;
        slot
    }

    fn is_current(&self, generation: u64) -> bool {
        self.timer.as_ref().map(|t| t.generation) == Some(generation)
    }

    pub(crate) fn status(&self, device_id: DeviceId) -> AutoUpdateStatus {
        AutoUpdateStatus {
            device_id,
            enabled: self.config.enabled,
            interval_secs: self.config.interval_secs,
            state: self.state,
            next_run_at: self.next_run_at,
            last_run: self.last_run.clone(),
            consecutive_failures: self.consecutive_failures,
            retry_delay_secs: self.retry_delay.map(|d| d.as_secs()),
        }
    }
}

pub(crate) type SlotMap = Arc<Mutex<HashMap<DeviceId, ScheduleSlot>>>;

/// Wall-clock time of a tokio deadline.
pub(crate) fn wall_clock(deadline: Instant) -> DateTime<Utc> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
}

// =============================================================================
// Timer Task
// =============================================================================

/// What a timer task needs to run.
pub(crate) struct Timer {
    pub(crate) device_id: DeviceId,
    pub(crate) generation: u64,
    pub(crate) interval: Duration,
    pub(crate) first_tick: Instant,
    pub(crate) slots: SlotMap,
    pub(crate) engine: Arc<CacheSyncEngine>,
    pub(crate) settings: AutoUpdateSettings,
    pub(crate) repo: Option<ScheduleRepository>,
}

impl Timer {
    /// Spawns the task. It stops when the returned handle is dropped.
    pub(crate) fn spawn(self) -> TimerHandle {
        let (cancel, cancelled) = watch::channel(());
        let generation = self.generation;
        let task = tokio::spawn(self.run(cancelled));
        TimerHandle {
            generation,
            cancel,
            task,
        }
    }

    async fn run(self, mut cancelled: watch::Receiver<()>) {
        let device_id = self.device_id;
        let mut retry = RetryPolicy::new(self.interval, &self.settings);
        let mut next = self.first_tick;

        debug!(device_id = %device_id, generation = self.generation, "Timer armed");

        loop {
            tokio::select! {
                biased;
                _ = cancelled.changed() => break,
                _ = sleep_until(next) => {}
            }

            let fired_at = Instant::now();
            let guard = tokio::select! {
                biased;
                _ = cancelled.changed() => break,
                guard = self
                    .engine
                    .locks()
                    .try_lock_for(device_id, self.settings.lock_wait()) => guard,
            };

            let Some(guard) = guard else {
                next = skip_to_next(fired_at, self.interval, Instant::now());
                warn!(device_id = %device_id, "Device busy, auto-update tick skipped");
                self.update(|slot| {
                    slot.state = ScheduleState::Scheduled;
                    slot.next_run_at = Some(wall_clock(next));
                    slot.retry_delay = None;
                });
                continue;
            };

            self.update(|slot| {
                slot.state = ScheduleState::Running;
                slot.next_run_at = None;
            });

            info!(device_id = %device_id, "Auto-update run started");
            let relabel_on = self
                .settings
                .relabel_dates
                .then(|| Local::now().date_naive());
            let result = self.engine.run_scheduled(&guard, device_id, relabel_on).await;
            drop(guard);

            let finished = Instant::now();
            match result {
                Ok(run) => {
                    retry.reset();
                    next = (fired_at + self.interval).max(finished);
                    info!(
                        device_id = %device_id,
                        fetched = run.fetched,
                        relabelled = run.relabelled,
                        "Auto-update run succeeded"
                    );
                    self.record_success(next).await;
                }
                Err(err) => {
                    let delay = retry.next_delay();
                    next = finished + delay;
                    warn!(
                        device_id = %device_id,
                        kind = %err.kind(),
                        error = %err,
                        retry_in_secs = delay.as_secs(),
                        "Auto-update run failed"
                    );
                    self.record_failure(&err, next, delay).await;
                }
            }
        }

        debug!(device_id = %device_id, generation = self.generation, "Timer stopped");
    }

    /// Applies `f` while this timer is still the device's current one.
    fn update(&self, f: impl FnOnce(&mut ScheduleSlot)) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(&self.device_id) {
            if slot.is_current(self.generation) {
                f(slot);
            }
        }
    }

    async fn record_success(&self, next: Instant) {
        let at = Utc::now();
        let exists = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get_mut(&self.device_id) {
                Some(slot) => {
                    slot.last_run = Some(RunOutcome::Success { at });
                    slot.consecutive_failures = 0;
                    if slot.is_current(self.generation) {
                        slot.state = ScheduleState::Scheduled;
                        slot.next_run_at = Some(wall_clock(next));
                        slot.retry_delay = None;
                    }
                    true
                }
                None => false,
            }
        };

        if let (true, Some(repo)) = (exists, &self.repo) {
            if let Err(err) = repo.record_success(self.device_id, at).await {
                warn!(device_id = %self.device_id, error = %err, "Failed to store run result");
            }
        }
    }

    async fn record_failure(&self, err: &SyncError, next: Instant, delay: Duration) {
        let at = Utc::now();
        let kind = err.kind();
        let message = err.to_string();

        let failures = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get_mut(&self.device_id) {
                Some(slot) => {
                    slot.last_run = Some(RunOutcome::Failure {
                        at,
                        error_kind: kind,
                        message: message.clone(),
                    });
                    slot.consecutive_failures += 1;
                    if slot.is_current(self.generation) {
                        slot.state = ScheduleState::FailedBackoff;
                        slot.next_run_at = Some(wall_clock(next));
                        slot.retry_delay = Some(delay);
                    }
                    Some(slot.consecutive_failures)
                }
                None => None,
            }
        };

        if let (Some(failures), Some(repo)) = (failures, &self.repo) {
            if let Err(err) = repo
                .record_failure(self.device_id, at, kind.as_str(), &message, failures)
                .await
            {
                warn!(device_id = %self.device_id, error = %err, "Failed to store run result");
            }
        }
    }
}

/// First interval boundary after `now`, counted from `fired_at`.
fn skip_to_next(fired_at: Instant, interval: Duration, now: Instant) -> Instant {
    let mut next = fired_at + interval;
    while next <= now {
        next += interval;
    }
    next
}
