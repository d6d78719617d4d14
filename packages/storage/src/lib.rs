// ABOUTME: Persistence layer for Bay - sqlx/SQLite stores for all orchestration state
// ABOUTME: Row-level version columns back optimistic concurrency across instances

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use thiserror::Error;

pub mod cargos;
pub mod executions;
pub mod idempotency;
pub mod leases;
pub mod models;
pub mod sandboxes;
pub mod sessions;
pub mod skills;

pub use cargos::CargoStore;
pub use executions::{ExecutionFilter, ExecutionStore};
pub use idempotency::IdempotencyStore;
pub use leases::GcLeaseStore;
pub use models::*;
pub use sandboxes::SandboxStore;
pub use sessions::SessionStore;
pub use skills::SkillStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Version conflict on {0}")]
    VersionConflict(String),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Invalid stored value: {0}")]
    InvalidValue(#[from] models::InvalidValue),

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timestamp column error: {0}")]
    Timestamp(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Open (creating if needed) the Bay database and run migrations.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(StorageError::Database)?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// In-memory pool for tests.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePool::connect("sqlite::memory:").await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

pub(crate) fn to_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn to_opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(to_ts)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Timestamp(format!("{s}: {e}")))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}
