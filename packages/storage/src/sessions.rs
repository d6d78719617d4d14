// ABOUTME: Session and session-container store
// ABOUTME: A partial unique index keeps at most one live session per sandbox

use crate::models::{ContainerObservedState, Session, SessionContainer, SessionState};
use crate::{is_unique_violation, parse_opt_ts, parse_ts, to_opt_ts, to_ts, Result, StorageError};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

const COLUMNS: &str = "id, sandbox_id, desired_state, observed_state, primary_container_id, \
     endpoint, network_id, idle_timeout_seconds, last_activity, ready_at, failed_reason, \
     created_at, updated_at, version";

pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, session: &Session) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions (
                id, sandbox_id, desired_state, observed_state, primary_container_id,
                endpoint, network_id, idle_timeout_seconds, last_activity, ready_at,
                failed_reason, created_at, updated_at, version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&session.id)
        .bind(&session.sandbox_id)
        .bind(session.desired_state.as_str())
        .bind(session.observed_state.as_str())
        .bind(&session.primary_container_id)
        .bind(&session.endpoint)
        .bind(&session.network_id)
        .bind(session.idle_timeout_seconds)
        .bind(to_ts(&session.last_activity))
        .bind(to_opt_ts(&session.ready_at))
        .bind(&session.failed_reason)
        .bind(to_ts(&session.created_at))
        .bind(to_ts(&session.updated_at))
        .bind(session.version)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            // Another live session already exists for this sandbox.
            Err(e) if is_unique_violation(&e) => {
                Err(StorageError::UniqueViolation(session.sandbox_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM sessions WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_session).transpose()
    }

    pub async fn list_for_sandbox(&self, sandbox_id: &str) -> Result<Vec<Session>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sessions WHERE sandbox_id = ?1 ORDER BY created_at"
        ))
        .bind(sandbox_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_session).collect()
    }

    /// Version-guarded write-back of every mutable field.
    pub async fn save(&self, session: &mut Session) -> Result<()> {
        let now = chrono::Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE sessions SET
                desired_state = ?1,
                observed_state = ?2,
                primary_container_id = ?3,
                endpoint = ?4,
                network_id = ?5,
                last_activity = ?6,
                ready_at = ?7,
                failed_reason = ?8,
                updated_at = ?9,
                version = version + 1
            WHERE id = ?10 AND version = ?11
            "#,
        )
        .bind(session.desired_state.as_str())
        .bind(session.observed_state.as_str())
        .bind(&session.primary_container_id)
        .bind(&session.endpoint)
        .bind(&session.network_id)
        .bind(to_ts(&session.last_activity))
        .bind(to_opt_ts(&session.ready_at))
        .bind(&session.failed_reason)
        .bind(to_ts(&now))
        .bind(&session.id)
        .bind(session.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM sessions WHERE id = ?1")
                .bind(&session.id)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            return if exists {
                Err(StorageError::VersionConflict(session.id.clone()))
            } else {
                Err(StorageError::NotFound(session.id.clone()))
            };
        }

        session.version += 1;
        session.updated_at = now;
        Ok(())
    }

    /// Sessions in any of the given observed states.
    pub async fn list_by_observed_states(&self, states: &[SessionState]) -> Result<Vec<Session>> {
        let mut out = Vec::new();
        for state in states {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM sessions WHERE observed_state = ?1"
            ))
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                out.push(row_to_session(row)?);
            }
        }
        Ok(out)
    }

    /// Ids of sessions that still own backend containers.
    pub async fn live_session_ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT id FROM sessions WHERE observed_state NOT IN ('stopped', 'failed')",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    // ========================================================================
    // SESSION CONTAINER ROWS
    // ========================================================================

    /// Replace the container roster for a session in one transaction.
    pub async fn replace_containers(
        &self,
        session_id: &str,
        containers: &[SessionContainer],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM session_containers WHERE session_id = ?1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        for container in containers {
            sqlx::query(
                r#"
                INSERT INTO session_containers (
                    session_id, name, role, image, runtime_kind, container_id,
                    endpoint, capabilities, observed_state, position
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(session_id)
            .bind(&container.name)
            .bind(&container.role)
            .bind(&container.image)
            .bind(&container.runtime_kind)
            .bind(&container.container_id)
            .bind(&container.endpoint)
            .bind(serde_json::to_string(&container.capabilities)?)
            .bind(container.observed_state.as_str())
            .bind(container.position)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn containers(&self, session_id: &str) -> Result<Vec<SessionContainer>> {
        let rows = sqlx::query(
            "SELECT session_id, name, role, image, runtime_kind, container_id, endpoint, \
             capabilities, observed_state, position \
             FROM session_containers WHERE session_id = ?1 ORDER BY position",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_container).collect()
    }

    pub async fn update_container_state(
        &self,
        session_id: &str,
        name: &str,
        container_id: Option<&str>,
        endpoint: Option<&str>,
        observed_state: ContainerObservedState,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE session_containers SET container_id = ?1, endpoint = ?2, observed_state = ?3 \
             WHERE session_id = ?4 AND name = ?5",
        )
        .bind(container_id)
        .bind(endpoint)
        .bind(observed_state.as_str())
        .bind(session_id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("{session_id}/{name}")));
        }
        Ok(())
    }
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row.get("id"),
        sandbox_id: row.get("sandbox_id"),
        desired_state: SessionState::parse(&row.get::<String, _>("desired_state"))?,
        observed_state: SessionState::parse(&row.get::<String, _>("observed_state"))?,
        primary_container_id: row.get("primary_container_id"),
        endpoint: row.get("endpoint"),
        network_id: row.get("network_id"),
        idle_timeout_seconds: row.get("idle_timeout_seconds"),
        last_activity: parse_ts(&row.get::<String, _>("last_activity"))?,
        ready_at: parse_opt_ts(row.get("ready_at"))?,
        failed_reason: row.get("failed_reason"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
        version: row.get("version"),
    })
}

fn row_to_container(row: sqlx::sqlite::SqliteRow) -> Result<SessionContainer> {
    Ok(SessionContainer {
        session_id: row.get("session_id"),
        name: row.get("name"),
        role: row.get("role"),
        image: row.get("image"),
        runtime_kind: row.get("runtime_kind"),
        container_id: row.get("container_id"),
        endpoint: row.get("endpoint"),
        capabilities: serde_json::from_str(&row.get::<String, _>("capabilities"))?,
        observed_state: ContainerObservedState::parse(&row.get::<String, _>("observed_state"))?,
        position: row.get("position"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect_in_memory;
    use crate::models::{Sandbox, SandboxDesiredState};
    use crate::SandboxStore;
    use chrono::Utc;

    async fn seed_sandbox(pool: &SqlitePool, id: &str) {
        let now = Utc::now();
        SandboxStore::new(pool.clone())
            .create(&Sandbox {
                id: id.to_string(),
                owner: "acme".to_string(),
                profile_id: "python-default".to_string(),
                cargo_id: "cargo-1".to_string(),
                current_session_id: None,
                desired_state: SandboxDesiredState::Running,
                expires_at: None,
                idle_expires_at: None,
                last_activity: now,
                created_at: now,
                updated_at: now,
                deleted_at: None,
                version: 0,
            })
            .await
            .unwrap();
    }

    fn fresh(id: &str, sandbox_id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            desired_state: SessionState::Running,
            observed_state: SessionState::Pending,
            primary_container_id: None,
            endpoint: None,
            network_id: None,
            idle_timeout_seconds: 1800,
            last_activity: now,
            ready_at: None,
            failed_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_single_active_session_enforced() {
        let pool = connect_in_memory().await.unwrap();
        seed_sandbox(&pool, "sandbox-1").await;
        let store = SessionStore::new(pool);

        store.create(&fresh("sess-1", "sandbox-1")).await.unwrap();

        // A second live session for the same sandbox violates the index.
        let err = store.create(&fresh("sess-2", "sandbox-1")).await.unwrap_err();
        assert!(matches!(err, StorageError::UniqueViolation(_)));

        // After the first goes terminal, a replacement is allowed.
        let mut first = store.get("sess-1").await.unwrap().unwrap();
        first.observed_state = SessionState::Stopped;
        store.save(&mut first).await.unwrap();
        store.create(&fresh("sess-2", "sandbox-1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_container_roster_roundtrip() {
        let pool = connect_in_memory().await.unwrap();
        seed_sandbox(&pool, "sandbox-1").await;
        let store = SessionStore::new(pool);
        store.create(&fresh("sess-1", "sandbox-1")).await.unwrap();

        let roster = vec![
            SessionContainer {
                session_id: "sess-1".to_string(),
                name: "main".to_string(),
                role: "primary".to_string(),
                image: "ship:latest".to_string(),
                runtime_kind: "ship".to_string(),
                container_id: None,
                endpoint: None,
                capabilities: vec!["python".to_string(), "shell".to_string()],
                observed_state: ContainerObservedState::Pending,
                position: 0,
            },
            SessionContainer {
                session_id: "sess-1".to_string(),
                name: "browser".to_string(),
                role: "sidecar".to_string(),
                image: "gull:latest".to_string(),
                runtime_kind: "gull".to_string(),
                container_id: None,
                endpoint: None,
                capabilities: vec!["browser".to_string()],
                observed_state: ContainerObservedState::Pending,
                position: 1,
            },
        ];
        store.replace_containers("sess-1", &roster).await.unwrap();

        store
            .update_container_state(
                "sess-1",
                "main",
                Some("ctr-9"),
                Some("http://10.0.0.2:8000"),
                ContainerObservedState::Running,
            )
            .await
            .unwrap();

        let got = store.containers("sess-1").await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].name, "main");
        assert_eq!(got[0].container_id.as_deref(), Some("ctr-9"));
        assert_eq!(got[0].observed_state, ContainerObservedState::Running);
        assert_eq!(got[1].capabilities, vec!["browser".to_string()]);
    }

    #[tokio::test]
    async fn test_live_session_ids_excludes_terminal() {
        let pool = connect_in_memory().await.unwrap();
        seed_sandbox(&pool, "sandbox-1").await;
        seed_sandbox(&pool, "sandbox-2").await;
        let store = SessionStore::new(pool);

        let mut stopped = fresh("sess-1", "sandbox-1");
        stopped.observed_state = SessionState::Stopped;
        store.create(&stopped).await.unwrap();

        let mut running = fresh("sess-2", "sandbox-2");
        running.observed_state = SessionState::Running;
        store.create(&running).await.unwrap();

        let live = store.live_session_ids().await.unwrap();
        assert!(live.contains("sess-2"));
        assert!(!live.contains("sess-1"));
    }
}
