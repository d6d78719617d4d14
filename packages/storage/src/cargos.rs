// ABOUTME: Cargo store - persistent volume records
// ABOUTME: Managed cargos belong to exactly one sandbox; external ones are shared

use crate::models::{Cargo, CargoKind};
use crate::{parse_opt_ts, parse_ts, to_opt_ts, to_ts, Result, StorageError};
use sqlx::{Row, SqlitePool};

const COLUMNS: &str = "id, owner, backend_handle, kind, mount_path, managed_by_sandbox_id, \
     created_at, updated_at, deleted_at, version";

pub struct CargoStore {
    pool: SqlitePool,
}

impl CargoStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, cargo: &Cargo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cargos (
                id, owner, backend_handle, kind, mount_path, managed_by_sandbox_id,
                created_at, updated_at, deleted_at, version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&cargo.id)
        .bind(&cargo.owner)
        .bind(&cargo.backend_handle)
        .bind(cargo.kind.as_str())
        .bind(&cargo.mount_path)
        .bind(&cargo.managed_by_sandbox_id)
        .bind(to_ts(&cargo.created_at))
        .bind(to_ts(&cargo.updated_at))
        .bind(to_opt_ts(&cargo.deleted_at))
        .bind(cargo.version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str, owner: &str) -> Result<Option<Cargo>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM cargos WHERE id = ?1 AND owner = ?2 AND deleted_at IS NULL"
        ))
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_cargo).transpose()
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Cargo>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM cargos WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_cargo).transpose()
    }

    pub async fn list(&self, owner: &str, limit: i64, cursor: Option<&str>) -> Result<Vec<Cargo>> {
        let rows = match cursor {
            Some(cursor) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM cargos \
                     WHERE owner = ?1 AND deleted_at IS NULL AND id > ?2 ORDER BY id LIMIT ?3"
                ))
                .bind(owner)
                .bind(cursor)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM cargos \
                     WHERE owner = ?1 AND deleted_at IS NULL ORDER BY id LIMIT ?2"
                ))
                .bind(owner)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(row_to_cargo).collect()
    }

    pub async fn mark_deleted(&self, id: &str) -> Result<()> {
        let now = chrono::Utc::now();
        let result = sqlx::query(
            "UPDATE cargos SET deleted_at = ?1, updated_at = ?1, version = version + 1 \
             WHERE id = ?2 AND deleted_at IS NULL",
        )
        .bind(to_ts(&now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Hard-remove a record. Used after the backend volume is gone.
    pub async fn remove(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cargos WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Managed cargos whose owning sandbox is soft-deleted or missing.
    pub async fn list_orphan_managed(&self, limit: i64) -> Result<Vec<Cargo>> {
        let rows = sqlx::query(
            "SELECT c.id, c.owner, c.backend_handle, c.kind, c.mount_path, \
             c.managed_by_sandbox_id, c.created_at, c.updated_at, c.deleted_at, c.version \
             FROM cargos c \
             WHERE c.kind = 'managed' AND c.deleted_at IS NULL AND NOT EXISTS ( \
                 SELECT 1 FROM sandboxes s \
                 WHERE s.id = c.managed_by_sandbox_id AND s.deleted_at IS NULL \
             ) ORDER BY c.id LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_cargo).collect()
    }
}

fn row_to_cargo(row: sqlx::sqlite::SqliteRow) -> Result<Cargo> {
    Ok(Cargo {
        id: row.get("id"),
        owner: row.get("owner"),
        backend_handle: row.get("backend_handle"),
        kind: CargoKind::parse(&row.get::<String, _>("kind"))?,
        mount_path: row.get("mount_path"),
        managed_by_sandbox_id: row.get("managed_by_sandbox_id"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
        deleted_at: parse_opt_ts(row.get("deleted_at"))?,
        version: row.get("version"),
    })
}
