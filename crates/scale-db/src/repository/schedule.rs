//! # Schedule Repository
//!
//! Auto-update configuration and the result of the last scheduled run,
//! one row per device. The in-memory timer state (next run, backoff) is
//! rebuilt at startup and never stored.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use scale_core::{AutoUpdateConfig, DeviceId};

/// Outcome of the last scheduled run as stored in `last_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "OK",
            RunStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(RunStatus::Ok),
            "ERROR" => Some(RunStatus::Error),
            _ => None,
        }
    }
}

/// A row of `auto_update_schedules`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ScheduleRecord {
    pub device_id: i64,
    pub enabled: bool,
    pub interval_secs: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub last_error_kind: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: i64,
}

impl ScheduleRecord {
    pub fn device_id(&self) -> DeviceId {
        DeviceId(self.device_id)
    }

    pub fn config(&self) -> AutoUpdateConfig {
        AutoUpdateConfig {
            enabled: self.enabled,
            interval_secs: self.interval_secs.max(0) as u64,
        }
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.last_status.as_deref().and_then(RunStatus::parse)
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT device_id, enabled, interval_secs, last_run_at, last_status,
           last_error_kind, last_error, consecutive_failures
    FROM auto_update_schedules
"#;

/// Repository for auto-update schedule records.
#[derive(Debug, Clone)]
pub struct ScheduleRepository {
    pool: SqlitePool,
}

impl ScheduleRepository {
    /// Creates a new ScheduleRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ScheduleRepository { pool }
    }

    /// Stores the configuration, keeping any recorded last run.
    pub async fn upsert_config(&self, device_id: DeviceId, config: &AutoUpdateConfig) -> DbResult<()> {
        debug!(
            device_id = %device_id,
            enabled = config.enabled,
            interval_secs = config.interval_secs,
            "Saving auto-update config"
        );

        sqlx::query(
            r#"
            INSERT INTO auto_update_schedules (device_id, enabled, interval_secs, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(device_id) DO UPDATE SET
                enabled = excluded.enabled,
                interval_secs = excluded.interval_secs,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(device_id.0)
        .bind(config.enabled)
        .bind(config.interval_secs as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records a successful run and clears the failure streak.
    pub async fn record_success(&self, device_id: DeviceId, at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE auto_update_schedules SET
                last_run_at = ?2,
                last_status = 'OK',
                last_error_kind = NULL,
                last_error = NULL,
                consecutive_failures = 0,
                updated_at = ?2
            WHERE device_id = ?1
            "#,
        )
        .bind(device_id.0)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records a failed run.
    pub async fn record_failure(
        &self,
        device_id: DeviceId,
        at: DateTime<Utc>,
        error_kind: &str,
        message: &str,
        consecutive_failures: u32,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE auto_update_schedules SET
                last_run_at = ?2,
                last_status = 'ERROR',
                last_error_kind = ?3,
                last_error = ?4,
                consecutive_failures = ?5,
                updated_at = ?2
            WHERE device_id = ?1
            "#,
        )
        .bind(device_id.0)
        .bind(at)
        .bind(error_kind)
        .bind(message)
        .bind(consecutive_failures as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Gets the record for a device.
    pub async fn get(&self, device_id: DeviceId) -> DbResult<Option<ScheduleRecord>> {
        let query = format!("{} WHERE device_id = ?1", SELECT_COLUMNS);
        let record = sqlx::query_as::<_, ScheduleRecord>(&query)
            .bind(device_id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// Lists all records, ordered by device.
    pub async fn list(&self) -> DbResult<Vec<ScheduleRecord>> {
        let query = format!("{} ORDER BY device_id", SELECT_COLUMNS);
        let records = sqlx::query_as::<_, ScheduleRecord>(&query)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Deletes a device's record. Returns whether a row existed.
    pub async fn delete(&self, device_id: DeviceId) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM auto_update_schedules WHERE device_id = ?1")
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
    use std::time::Duration;

    async fn repo() -> ScheduleRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().schedules()
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let repo = repo().await;
        let id = DeviceId(3);

        assert!(repo.get(id).await.unwrap().is_none());

        repo.upsert_config(id, &AutoUpdateConfig::new(true, Duration::from_secs(60)))
            .await
            .unwrap();
        let record = repo.get(id).await.unwrap().unwrap();
        assert_eq!(record.device_id(), id);
        assert_eq!(record.config(), AutoUpdateConfig::new(true, Duration::from_secs(60)));
        assert!(record.status().is_none());
    }

    #[tokio::test]
    async fn test_run_results_survive_config_change() {
        let repo = repo().await;
        let id = DeviceId(3);
        repo.upsert_config(id, &AutoUpdateConfig::new(true, Duration::from_secs(60)))
            .await
            .unwrap();

        repo.record_failure(id, Utc::now(), "timeout", "no answer", 2)
            .await
            .unwrap();
        repo.upsert_config(id, &AutoUpdateConfig::new(true, Duration::from_secs(10)))
            .await
            .unwrap();

        let record = repo.get(id).await.unwrap().unwrap();
        assert_eq!(record.interval_secs, 10);
        assert_eq!(record.status(), Some(RunStatus::Error));
        assert_eq!(record.last_error_kind.as_deref(), Some("timeout"));
        assert_eq!(record.consecutive_failures, 2);

        repo.record_success(id, Utc::now()).await.unwrap();
        let record = repo.get(id).await.unwrap().unwrap();
        assert_eq!(record.status(), Some(RunStatus::Ok));
        assert!(record.last_error.is_none());
        assert_eq!(record.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let repo = repo().await;
        let cfg = AutoUpdateConfig::new(false, Duration::from_secs(3600));
        repo.upsert_config(DeviceId(2), &cfg).await.unwrap();
        repo.upsert_config(DeviceId(1), &cfg).await.unwrap();

        let ids: Vec<_> = repo.list().await.unwrap().iter().map(|r| r.device_id).collect();
        assert_eq!(ids, vec![1, 2]);

        assert!(repo.delete(DeviceId(2)).await.unwrap());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[test]
    fn test_run_status_strings() {
        assert_eq!(RunStatus::parse(RunStatus::Ok.as_str()), Some(RunStatus::Ok));
        assert_eq!(RunStatus::parse("ERROR"), Some(RunStatus::Error));
        assert_eq!(RunStatus::parse("??"), None);
    }
}
