//! Schema migrations, embedded at compile time from `migrations/sqlite/`.
//!
//! Files are applied in name order (`NNN_description.sql`), each in its own
//! transaction, and recorded in `_sqlx_migrations`. Released files are never
//! edited; schema changes go in a new file.

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Applies whatever has not been applied yet.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    let (known, applied) = migration_status(pool).await.unwrap_or((MIGRATOR.migrations.len(), 0));
    debug!(known, applied, "Migration state");

    MIGRATOR.run(pool).await?;
    if applied < known {
        info!(applied = known - applied, "Schema migrated");
    }
    Ok(())
}

/// `(known, applied)` migration counts. Fails before the first run, when
/// the bookkeeping table does not exist yet.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let applied: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
            .fetch_one(pool)
            .await?;
    Ok((MIGRATOR.migrations.len(), applied as usize))
}
