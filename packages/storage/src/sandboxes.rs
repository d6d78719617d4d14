// ABOUTME: Sandbox store - CRUD plus optimistic versioned updates
// ABOUTME: Soft-deleted rows stay for audit; readers filter them explicitly

use crate::models::{Sandbox, SandboxDesiredState};
use crate::{is_unique_violation, parse_opt_ts, parse_ts, to_opt_ts, to_ts, Result, StorageError};
use sqlx::{Row, SqlitePool};

const COLUMNS: &str = "id, owner, profile_id, cargo_id, current_session_id, desired_state, \
     expires_at, idle_expires_at, last_activity, created_at, updated_at, deleted_at, version";

pub struct SandboxStore {
    pool: SqlitePool,
}

impl SandboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, sandbox: &Sandbox) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO sandboxes (
                id, owner, profile_id, cargo_id, current_session_id, desired_state,
                expires_at, idle_expires_at, last_activity, created_at, updated_at,
                deleted_at, version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&sandbox.id)
        .bind(&sandbox.owner)
        .bind(&sandbox.profile_id)
        .bind(&sandbox.cargo_id)
        .bind(&sandbox.current_session_id)
        .bind(sandbox.desired_state.as_str())
        .bind(to_opt_ts(&sandbox.expires_at))
        .bind(to_opt_ts(&sandbox.idle_expires_at))
        .bind(to_ts(&sandbox.last_activity))
        .bind(to_ts(&sandbox.created_at))
        .bind(to_ts(&sandbox.updated_at))
        .bind(to_opt_ts(&sandbox.deleted_at))
        .bind(sandbox.version)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StorageError::UniqueViolation(sandbox.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a live (not soft-deleted) sandbox scoped to its owner.
    pub async fn get(&self, id: &str, owner: &str) -> Result<Option<Sandbox>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sandboxes WHERE id = ?1 AND owner = ?2 AND deleted_at IS NULL"
        ))
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_sandbox).transpose()
    }

    /// Fetch regardless of soft-deletion, still owner-scoped.
    pub async fn get_any(&self, id: &str, owner: &str) -> Result<Option<Sandbox>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sandboxes WHERE id = ?1 AND owner = ?2"
        ))
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_sandbox).transpose()
    }

    /// Unscoped fetch for internal paths (locks already resolved the owner).
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Sandbox>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM sandboxes WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_sandbox).transpose()
    }

    /// Keyset-paginated listing of live sandboxes for an owner.
    pub async fn list(&self, owner: &str, limit: i64, cursor: Option<&str>) -> Result<Vec<Sandbox>> {
        let rows = match cursor {
            Some(cursor) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM sandboxes \
                     WHERE owner = ?1 AND deleted_at IS NULL AND id > ?2 \
                     ORDER BY id LIMIT ?3"
                ))
                .bind(owner)
                .bind(cursor)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM sandboxes \
                     WHERE owner = ?1 AND deleted_at IS NULL \
                     ORDER BY id LIMIT ?2"
                ))
                .bind(owner)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(row_to_sandbox).collect()
    }

    /// Write back every mutable field, guarded by the row version.
    ///
    /// On success the model's version is bumped in place. A concurrent
    /// writer from another instance surfaces as `VersionConflict`.
    pub async fn save(&self, sandbox: &mut Sandbox) -> Result<()> {
        let now = chrono::Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE sandboxes SET
                current_session_id = ?1,
                desired_state = ?2,
                expires_at = ?3,
                idle_expires_at = ?4,
                last_activity = ?5,
                deleted_at = ?6,
                updated_at = ?7,
                version = version + 1
            WHERE id = ?8 AND version = ?9
            "#,
        )
        .bind(&sandbox.current_session_id)
        .bind(sandbox.desired_state.as_str())
        .bind(to_opt_ts(&sandbox.expires_at))
        .bind(to_opt_ts(&sandbox.idle_expires_at))
        .bind(to_ts(&sandbox.last_activity))
        .bind(to_opt_ts(&sandbox.deleted_at))
        .bind(to_ts(&now))
        .bind(&sandbox.id)
        .bind(sandbox.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM sandboxes WHERE id = ?1")
                .bind(&sandbox.id)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            return if exists {
                Err(StorageError::VersionConflict(sandbox.id.clone()))
            } else {
                Err(StorageError::NotFound(sandbox.id.clone()))
            };
        }

        sandbox.version += 1;
        sandbox.updated_at = now;
        Ok(())
    }

    /// Live sandboxes whose expiry has passed, for the expired-sandbox reaper.
    pub async fn list_expired(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        limit: i64,
    ) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sandboxes \
             WHERE deleted_at IS NULL AND expires_at IS NOT NULL \
             ORDER BY expires_at LIMIT ?1"
        ))
        .bind(limit * 4)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        for row in rows {
            let sandbox = row_to_sandbox(row)?;
            if sandbox.is_expired(now) {
                out.push(sandbox);
                if out.len() as i64 >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Ids of live sandboxes referencing a cargo (the active reference count).
    pub async fn active_references(&self, cargo_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT id FROM sandboxes WHERE cargo_id = ?1 AND deleted_at IS NULL ORDER BY id",
        )
        .bind(cargo_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }
}

fn row_to_sandbox(row: sqlx::sqlite::SqliteRow) -> Result<Sandbox> {
    Ok(Sandbox {
        id: row.get("id"),
        owner: row.get("owner"),
        profile_id: row.get("profile_id"),
        cargo_id: row.get("cargo_id"),
        current_session_id: row.get("current_session_id"),
        desired_state: SandboxDesiredState::parse(&row.get::<String, _>("desired_state"))?,
        expires_at: parse_opt_ts(row.get("expires_at"))?,
        idle_expires_at: parse_opt_ts(row.get("idle_expires_at"))?,
        last_activity: parse_ts(&row.get::<String, _>("last_activity"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
        deleted_at: parse_opt_ts(row.get("deleted_at"))?,
        version: row.get("version"),
    })
}
