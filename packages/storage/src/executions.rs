// ABOUTME: Execution history store - one row per semantically weighted capability call
// ABOUTME: Rows are immutable except the annotation fields

use crate::models::{ExecType, ExecutionRecord};
use crate::{parse_ts, to_ts, Result, StorageError};
use sqlx::{Row, SqlitePool};

const COLUMNS: &str = "id, owner, sandbox_id, exec_type, input, output, error, exit_code, \
     success, duration_ms, started_at, tags, description, notes, created_at";

/// List filters; everything is optional.
#[derive(Debug, Default, Clone)]
pub struct ExecutionFilter {
    pub sandbox_id: Option<String>,
    pub exec_type: Option<ExecType>,
    pub success: Option<bool>,
    pub tag: Option<String>,
    pub limit: i64,
}

pub struct ExecutionStore {
    pool: SqlitePool,
}

impl ExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, owner, sandbox_id, exec_type, input, output, error, exit_code,
                success, duration_ms, started_at, tags, description, notes, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&record.id)
        .bind(&record.owner)
        .bind(&record.sandbox_id)
        .bind(record.exec_type.as_str())
        .bind(&record.input)
        .bind(&record.output)
        .bind(&record.error)
        .bind(record.exit_code)
        .bind(record.success)
        .bind(record.duration_ms)
        .bind(to_ts(&record.started_at))
        .bind(serde_json::to_string(&record.tags)?)
        .bind(&record.description)
        .bind(&record.notes)
        .bind(to_ts(&record.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str, owner: &str) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM executions WHERE id = ?1 AND owner = ?2"
        ))
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_record).transpose()
    }

    pub async fn list(&self, owner: &str, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let mut query = format!("SELECT {COLUMNS} FROM executions WHERE owner = ?1");
        let mut index = 1;

        if filter.sandbox_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND sandbox_id = ?{index}"));
        }
        if filter.exec_type.is_some() {
            index += 1;
            query.push_str(&format!(" AND exec_type = ?{index}"));
        }
        if filter.success.is_some() {
            index += 1;
            query.push_str(&format!(" AND success = ?{index}"));
        }
        query.push_str(" ORDER BY started_at DESC");
        index += 1;
        query.push_str(&format!(" LIMIT ?{index}"));

        let mut q = sqlx::query(&query).bind(owner);
        if let Some(sandbox_id) = &filter.sandbox_id {
            q = q.bind(sandbox_id);
        }
        if let Some(exec_type) = &filter.exec_type {
            q = q.bind(exec_type.as_str());
        }
        if let Some(success) = filter.success {
            q = q.bind(success);
        }
        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        let mut records: Vec<ExecutionRecord> =
            rows.into_iter().map(row_to_record).collect::<Result<_>>()?;

        // Tag filtering happens after the JSON column is decoded.
        if let Some(tag) = &filter.tag {
            records.retain(|r| r.tags.iter().any(|t| t == tag));
        }
        Ok(records)
    }

    pub async fn last_for_sandbox(
        &self,
        sandbox_id: &str,
        owner: &str,
    ) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM executions WHERE sandbox_id = ?1 AND owner = ?2 \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(sandbox_id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_record).transpose()
    }

    /// Update annotation fields only; execution payloads stay immutable.
    pub async fn annotate(
        &self,
        id: &str,
        owner: &str,
        description: Option<&str>,
        tags: Option<&[String]>,
        notes: Option<&str>,
    ) -> Result<()> {
        let mut query = String::from("UPDATE executions SET id = id");
        let mut index = 0;

        if description.is_some() {
            index += 1;
            query.push_str(&format!(", description = ?{index}"));
        }
        if tags.is_some() {
            index += 1;
            query.push_str(&format!(", tags = ?{index}"));
        }
        if notes.is_some() {
            index += 1;
            query.push_str(&format!(", notes = ?{index}"));
        }
        query.push_str(&format!(" WHERE id = ?{} AND owner = ?{}", index + 1, index + 2));

        let mut q = sqlx::query(&query);
        if let Some(description) = description {
            q = q.bind(description);
        }
        let tags_json = tags.map(serde_json::to_string).transpose()?;
        if let Some(tags_json) = &tags_json {
            q = q.bind(tags_json);
        }
        if let Some(notes) = notes {
            q = q.bind(notes);
        }
        let result = q.bind(id).bind(owner).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get("id"),
        owner: row.get("owner"),
        sandbox_id: row.get("sandbox_id"),
        exec_type: ExecType::parse(&row.get::<String, _>("exec_type"))?,
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        exit_code: row.get("exit_code"),
        success: row.get("success"),
        duration_ms: row.get("duration_ms"),
        started_at: parse_ts(&row.get::<String, _>("started_at"))?,
        tags: serde_json::from_str(&row.get::<String, _>("tags"))?,
        description: row.get("description"),
        notes: row.get("notes"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}
