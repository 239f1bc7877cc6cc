//! # Database Handle
//!
//! Opens the SQLite file that backs product cache snapshots and schedule
//! records, and hands out the two repositories.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  DbConfig::new("scales.db")          DbConfig::in_memory()             │
//! │          │                                   │                          │
//! │          └──────────────┬────────────────────┘                          │
//! │                         ▼                                               │
//! │               Database::new(config)                                    │
//! │                 │  open (WAL for files)                                 │
//! │                 │  migrate                                              │
//! │                 ▼                                                       │
//! │     ┌──────────────────────┐     ┌──────────────────────┐              │
//! │     │ db.caches()          │     │ db.schedules()       │              │
//! │     │ one snapshot row per │     │ config + last run    │              │
//! │     │ device               │     │ per device           │              │
//! │     └──────────────────────┘     └──────────────────────┘              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Snapshot writes are small and serialised per device by the cache store,
//! so a handful of connections is plenty. A writer that finds the file
//! locked waits up to `busy_timeout` before failing with `Storage`.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::cache::ProductCacheRepository;
use crate::repository::schedule::ScheduleRepository;

// =============================================================================
// Configuration
// =============================================================================

/// Where the database lives and how the pool behaves.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// `None` means a private in-memory database.
    pub path: Option<PathBuf>,

    /// Default: 4 for files, 1 in memory.
    pub max_connections: u32,

    /// How long a caller waits for a free connection. Default: 10 seconds.
    pub acquire_timeout: Duration,

    /// How long a writer waits on a locked file. Default: 5 seconds.
    pub busy_timeout: Duration,

    /// Apply pending migrations when opening. Default: true.
    pub migrate: bool,
}

impl DbConfig {
    /// A file database, created on first open.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            path: Some(path.into()),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
            migrate: true,
        }
    }

    /// A private database that disappears with the pool.
    ///
    /// Pinned to one connection that is never recycled; every new SQLite
    /// memory connection would otherwise see an empty database.
    pub fn in_memory() -> Self {
        DbConfig {
            path: None,
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
            migrate: true,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn migrate(mut self, migrate: bool) -> Self {
        self.migrate = migrate;
        self
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        let options = SqliteConnectOptions::new()
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout);

        match &self.path {
            Some(path) => options
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal),
            None => options.in_memory(true),
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Shared handle to the pool. Clones share one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the database and, unless disabled, brings its schema up to
    /// date.
    ///
    /// ## Errors
    /// - `ConnectionFailed` if the file cannot be opened or created
    /// - `MigrationFailed` if a migration does not apply
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        let location = config
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string());
        info!(location = %location, "Opening database");

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout);
        if config.path.is_none() {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
        }

        let pool = pool_options
            .connect_with(config.connect_options())
            .await
            .map_err(|e| DbError::ConnectionFailed(format!("{}: {}", location, e)))?;
        debug!(max_connections = config.max_connections, "Pool ready");

        let db = Database { pool };
        if config.migrate {
            migrations::run_migrations(&db.pool).await?;
        }
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Product cache snapshots.
    pub fn caches(&self) -> ProductCacheRepository {
        ProductCacheRepository::new(self.pool.clone())
    }

    /// Auto-update schedule records.
    pub fn schedules(&self) -> ScheduleRepository {
        ScheduleRepository::new(self.pool.clone())
    }

    /// Waits for in-flight queries, then closes every connection.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database closed");
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);

        let (known, applied) = migrations::migration_status(db.pool()).await.unwrap();
        assert_eq!(known, applied);
        assert!(known >= 1);
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scales.db");

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        assert!(db.health_check().await);
        db.close().await;

        let reopened = Database::new(DbConfig::new(&path).migrate(false)).await.unwrap();
        let (known, applied) = migrations::migration_status(reopened.pool()).await.unwrap();
        assert_eq!(known, applied);
    }

    #[test]
    fn test_config_defaults() {
        let file = DbConfig::new("/var/lib/scales/scales.db").max_connections(0);
        assert_eq!(file.max_connections, 1);
        assert!(file.migrate);

        let memory = DbConfig::in_memory();
        assert!(memory.path.is_none());
        assert_eq!(memory.max_connections, 1);
    }
}
