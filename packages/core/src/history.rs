// ABOUTME: Execution history service - records capability invocations
// ABOUTME: Rows are immutable; only the annotation fields can change later

use crate::error::{CoreError, Result};
use crate::ids::new_id;
use bay_storage::{ExecType, ExecutionFilter, ExecutionRecord, ExecutionStore};
use chrono::{DateTime, Utc};

pub struct ExecutionHistory {
    store: ExecutionStore,
}

impl ExecutionHistory {
    pub fn new(store: ExecutionStore) -> Self {
        Self { store }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        owner: &str,
        sandbox_id: &str,
        exec_type: ExecType,
        input: &str,
        output: Option<String>,
        error: Option<String>,
        exit_code: Option<i64>,
        success: bool,
        started_at: DateTime<Utc>,
        duration_ms: i64,
    ) -> Result<ExecutionRecord> {
        let record = ExecutionRecord {
            id: new_id("exec"),
            owner: owner.to_string(),
            sandbox_id: sandbox_id.to_string(),
            exec_type,
            input: input.to_string(),
            output,
            error,
            exit_code,
            success,
            duration_ms,
            started_at,
            tags: Vec::new(),
            description: None,
            notes: None,
            created_at: Utc::now(),
        };
        self.store.create(&record).await?;
        Ok(record)
    }

    pub async fn list(&self, owner: &str, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        Ok(self.store.list(owner, filter).await?)
    }

    pub async fn get(&self, id: &str, owner: &str) -> Result<ExecutionRecord> {
        self.store
            .get(id, owner)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Execution not found: {id}")))
    }

    pub async fn last_for_sandbox(
        &self,
        sandbox_id: &str,
        owner: &str,
    ) -> Result<ExecutionRecord> {
        self.store
            .last_for_sandbox(sandbox_id, owner)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("No executions recorded for sandbox {sandbox_id}"))
            })
    }

    /// Update the mutable annotation fields; at least one must be present.
    pub async fn annotate(
        &self,
        id: &str,
        owner: &str,
        description: Option<&str>,
        tags: Option<&[String]>,
        notes: Option<&str>,
    ) -> Result<ExecutionRecord> {
        if description.is_none() && tags.is_none() && notes.is_none() {
            return Err(CoreError::Validation(
                "annotation requires description, tags, or notes".to_string(),
            ));
        }
        self.store.annotate(id, owner, description, tags, notes).await?;
        self.get(id, owner).await
    }
}
