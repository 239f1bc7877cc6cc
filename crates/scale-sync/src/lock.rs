//! # Sync Locks
//!
//! One mutex per device serializing every hardware conversation with it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  device 1:  refresh ████████░░░░░░░░ patch ███░░░ tick ██████          │
//! │  device 2:  tick ██████ patch ██ refresh █████████                     │
//! │                                                                         │
//! │  Same device: strictly one after another, in acquisition order         │
//! │  (tokio's Mutex is fair, waiters are served FIFO).                     │
//! │  Different devices: fully concurrent.                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Readers of the product cache never take this lock.
//!
//! An entry outlives its device for as long as anyone holds or waits on
//! it, so a device re-created under the same id shares the old mutex with
//! late callers instead of getting a second one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use scale_core::DeviceId;

/// Proof that the holder owns a device's sync lock.
pub type SyncGuard = OwnedMutexGuard<()>;

/// Per-device async mutexes, created on first use.
#[derive(Debug, Default)]
pub struct SyncLocks {
    locks: Mutex<HashMap<DeviceId, Arc<AsyncMutex<()>>>>,
}

impl SyncLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, device_id: DeviceId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(device_id).or_default().clone()
    }

    /// Waits as long as it takes.
    pub async fn lock(&self, device_id: DeviceId) -> SyncGuard {
        self.handle(device_id).lock_owned().await
    }

    /// Waits at most `wait`; `None` if the device stayed busy.
    pub async fn try_lock_for(&self, device_id: DeviceId, wait: Duration) -> Option<SyncGuard> {
        tokio::time::timeout(wait, self.handle(device_id).lock_owned())
            .await
            .ok()
    }

    /// Returns true if someone currently holds the device's lock.
    /// Advisory only: the answer can change right after.
    pub fn is_locked(&self, device_id: DeviceId) -> bool {
        self.handle(device_id).try_lock().is_err()
    }

    /// Holders plus waiters of the device's lock.
    pub fn users(&self, device_id: DeviceId) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(&device_id)
            .map_or(0, |lock| Arc::strong_count(lock) - 1)
    }

    /// Forgets a deleted device's lock unless someone still holds or waits
    /// on it. Returns whether the entry is gone.
    pub fn remove_idle(&self, device_id: DeviceId) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        match locks.get(&device_id) {
            Some(lock) if Arc::strong_count(lock) > 1 => false,
            _ => {
                locks.remove(&device_id);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_try_lock_for_times_out() {
        let locks = SyncLocks::new();
        let id = DeviceId(1);

        let held = locks.lock(id).await;
        assert!(locks.is_locked(id));
        assert!(locks.try_lock_for(id, Duration::from_millis(50)).await.is_none());

        drop(held);
        assert!(locks.try_lock_for(id, Duration::from_millis(50)).await.is_some());
    }

    #[tokio::test]
    async fn test_remove_idle_keeps_contended_lock() {
        let locks = Arc::new(SyncLocks::new());
        let id = DeviceId(1);

        let held = locks.lock(id).await;
        let waiter = tokio::spawn({
            let locks = locks.clone();
            async move {
                let _g = locks.lock(id).await;
            }
        });
        while locks.users(id) < 2 {
            tokio::task::yield_now().await;
        }

        assert!(!locks.remove_idle(id));
        // Still the same mutex: a newcomer has to queue behind both.
        assert!(locks.try_lock_for(id, Duration::from_millis(5)).await.is_none());

        drop(held);
        waiter.await.unwrap();
        assert_eq!(locks.users(id), 0);
        assert!(locks.remove_idle(id));
        assert!(locks.remove_idle(id));
    }

    #[tokio::test]
    async fn test_devices_are_independent() {
        let locks = SyncLocks::new();
        let _one = locks.lock(DeviceId(1)).await;
        assert!(locks
            .try_lock_for(DeviceId(2), Duration::from_millis(1))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_fifo_acquisition() {
        let locks = Arc::new(SyncLocks::new());
        let id = DeviceId(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.lock(id).await;
        let mut tasks = Vec::new();
        for n in 0..3 {
            let locks = locks.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _g = locks.lock(id).await;
                order.lock().unwrap().push(n);
            }));
            // Let the task enqueue before spawning the next one.
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }
        drop(first);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
