// ABOUTME: Skill lifecycle store - candidates, evaluations, releases, payload blobs
// ABOUTME: A partial unique index keeps one active release per (skill key, stage)

use crate::models::{
    SkillCandidate, SkillCandidateStatus, SkillEvaluation, SkillPayload, SkillRelease,
    SkillReleaseStage,
};
use crate::{is_unique_violation, parse_opt_ts, parse_ts, to_opt_ts, to_ts, Result, StorageError};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

const CANDIDATE_COLUMNS: &str = "id, skill_key, source_execution_ids, payload_ref, summary, \
     status, latest_score, latest_pass, last_evaluated_at, promotion_release_id, created_by, \
     created_at, updated_at, deleted_at, deleted_by, delete_reason";

const RELEASE_COLUMNS: &str = "id, skill_key, candidate_id, version, stage, is_active, \
     rolled_back_at, promoted_by, promoted_at, deleted_at, deleted_by, delete_reason";

pub struct SkillStore {
    pool: SqlitePool,
}

impl SkillStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // CANDIDATES
    // ========================================================================

    pub async fn create_candidate(&self, candidate: &SkillCandidate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO skill_candidates (
                id, skill_key, source_execution_ids, payload_ref, summary, status,
                latest_score, latest_pass, last_evaluated_at, promotion_release_id,
                created_by, created_at, updated_at, deleted_at, deleted_by, delete_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(&candidate.id)
        .bind(&candidate.skill_key)
        .bind(serde_json::to_string(&candidate.source_execution_ids)?)
        .bind(&candidate.payload_ref)
        .bind(&candidate.summary)
        .bind(candidate.status.as_str())
        .bind(candidate.latest_score)
        .bind(candidate.latest_pass)
        .bind(to_opt_ts(&candidate.last_evaluated_at))
        .bind(&candidate.promotion_release_id)
        .bind(&candidate.created_by)
        .bind(to_ts(&candidate.created_at))
        .bind(to_ts(&candidate.updated_at))
        .bind(to_opt_ts(&candidate.deleted_at))
        .bind(&candidate.deleted_by)
        .bind(&candidate.delete_reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_candidate(&self, id: &str) -> Result<Option<SkillCandidate>> {
        let row = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM skill_candidates WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_candidate).transpose()
    }

    /// Live (not soft-deleted) candidates, newest first.
    pub async fn list_candidates(
        &self,
        skill_key: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SkillCandidate>> {
        let rows = match skill_key {
            Some(key) => {
                sqlx::query(&format!(
                    "SELECT {CANDIDATE_COLUMNS} FROM skill_candidates \
                     WHERE skill_key = ?1 AND deleted_at IS NULL \
                     ORDER BY created_at DESC LIMIT ?2"
                ))
                .bind(key)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {CANDIDATE_COLUMNS} FROM skill_candidates \
                     WHERE deleted_at IS NULL \
                     ORDER BY created_at DESC LIMIT ?1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(row_to_candidate).collect()
    }

    pub async fn update_candidate(&self, candidate: &SkillCandidate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE skill_candidates SET
                status = ?1, latest_score = ?2, latest_pass = ?3,
                last_evaluated_at = ?4, promotion_release_id = ?5, updated_at = ?6
            WHERE id = ?7
            "#,
        )
        .bind(candidate.status.as_str())
        .bind(candidate.latest_score)
        .bind(candidate.latest_pass)
        .bind(to_opt_ts(&candidate.last_evaluated_at))
        .bind(&candidate.promotion_release_id)
        .bind(to_ts(&Utc::now()))
        .bind(&candidate.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(candidate.id.clone()));
        }
        Ok(())
    }

    /// Soft-delete a live candidate, recording who and why.
    pub async fn soft_delete_candidate(
        &self,
        id: &str,
        deleted_by: Option<&str>,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE skill_candidates \
             SET deleted_at = ?1, deleted_by = ?2, delete_reason = ?3, updated_at = ?1 \
             WHERE id = ?4 AND deleted_at IS NULL",
        )
        .bind(to_ts(&at))
        .bind(deleted_by)
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // EVALUATIONS
    // ========================================================================

    pub async fn create_evaluation(&self, evaluation: &SkillEvaluation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO skill_evaluations (
                id, candidate_id, passed, score, report, evaluated_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&evaluation.id)
        .bind(&evaluation.candidate_id)
        .bind(evaluation.passed)
        .bind(evaluation.score)
        .bind(&evaluation.report)
        .bind(&evaluation.evaluated_by)
        .bind(to_ts(&evaluation.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_evaluations(&self, candidate_id: &str) -> Result<Vec<SkillEvaluation>> {
        let rows = sqlx::query(
            "SELECT id, candidate_id, passed, score, report, evaluated_by, created_at \
             FROM skill_evaluations WHERE candidate_id = ?1 ORDER BY created_at DESC",
        )
        .bind(candidate_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_evaluation).collect()
    }

    // ========================================================================
    // RELEASES
    // ========================================================================

    pub async fn create_release(&self, release: &SkillRelease) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO skill_releases (
                id, skill_key, candidate_id, version, stage, is_active,
                rolled_back_at, promoted_by, promoted_at, deleted_at, deleted_by, delete_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&release.id)
        .bind(&release.skill_key)
        .bind(&release.candidate_id)
        .bind(release.version)
        .bind(release.stage.as_str())
        .bind(release.is_active)
        .bind(to_opt_ts(&release.rolled_back_at))
        .bind(&release.promoted_by)
        .bind(to_ts(&release.promoted_at))
        .bind(to_opt_ts(&release.deleted_at))
        .bind(&release.deleted_by)
        .bind(&release.delete_reason)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StorageError::UniqueViolation(format!(
                "{}/{}",
                release.skill_key,
                release.stage.as_str()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_release(&self, id: &str) -> Result<Option<SkillRelease>> {
        let row = sqlx::query(&format!(
            "SELECT {RELEASE_COLUMNS} FROM skill_releases WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_release).transpose()
    }

    /// Live (not soft-deleted) releases.
    pub async fn list_releases(&self, skill_key: Option<&str>) -> Result<Vec<SkillRelease>> {
        let rows = match skill_key {
            Some(key) => {
                sqlx::query(&format!(
                    "SELECT {RELEASE_COLUMNS} FROM skill_releases \
                     WHERE skill_key = ?1 AND deleted_at IS NULL \
                     ORDER BY stage, version DESC"
                ))
                .bind(key)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {RELEASE_COLUMNS} FROM skill_releases \
                     WHERE deleted_at IS NULL \
                     ORDER BY skill_key, stage, version DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(row_to_release).collect()
    }

    pub async fn active_release(
        &self,
        skill_key: &str,
        stage: SkillReleaseStage,
    ) -> Result<Option<SkillRelease>> {
        let row = sqlx::query(&format!(
            "SELECT {RELEASE_COLUMNS} FROM skill_releases \
             WHERE skill_key = ?1 AND stage = ?2 AND is_active = 1"
        ))
        .bind(skill_key)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_release).transpose()
    }

    /// Highest version number ever issued for (skill key, stage), including
    /// rolled-back and soft-deleted releases; versions are never reused.
    pub async fn max_version(&self, skill_key: &str, stage: SkillReleaseStage) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS v FROM skill_releases \
             WHERE skill_key = ?1 AND stage = ?2",
        )
        .bind(skill_key)
        .bind(stage.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("v"))
    }

    /// Latest inactive predecessor eligible for rollback: never rolled back
    /// and not soft-deleted.
    pub async fn latest_rollback_target(
        &self,
        skill_key: &str,
        stage: SkillReleaseStage,
        below_version: i64,
    ) -> Result<Option<SkillRelease>> {
        let row = sqlx::query(&format!(
            "SELECT {RELEASE_COLUMNS} FROM skill_releases \
             WHERE skill_key = ?1 AND stage = ?2 AND version < ?3 \
               AND rolled_back_at IS NULL AND deleted_at IS NULL \
             ORDER BY version DESC LIMIT 1"
        ))
        .bind(skill_key)
        .bind(stage.as_str())
        .bind(below_version)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_release).transpose()
    }

    pub async fn set_release_active(&self, id: &str, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE skill_releases SET is_active = ?1 WHERE id = ?2")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn mark_rolled_back(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE skill_releases SET is_active = 0, rolled_back_at = ?1 WHERE id = ?2",
        )
        .bind(to_ts(&at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Soft-delete a live release, recording who and why. Callers refuse
    /// active releases before getting here.
    pub async fn soft_delete_release(
        &self,
        id: &str,
        deleted_by: Option<&str>,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE skill_releases \
             SET deleted_at = ?1, deleted_by = ?2, delete_reason = ?3 \
             WHERE id = ?4 AND deleted_at IS NULL",
        )
        .bind(to_ts(&at))
        .bind(deleted_by)
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // PAYLOAD BLOBS
    // ========================================================================

    pub async fn create_payload(&self, payload: &SkillPayload) -> Result<()> {
        sqlx::query(
            "INSERT INTO skill_payloads (payload_ref, kind, payload, created_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&payload.payload_ref)
        .bind(&payload.kind)
        .bind(serde_json::to_string(&payload.payload)?)
        .bind(&payload.created_by)
        .bind(to_ts(&payload.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_payload(&self, payload_ref: &str) -> Result<Option<SkillPayload>> {
        let row = sqlx::query(
            "SELECT payload_ref, kind, payload, created_by, created_at \
             FROM skill_payloads WHERE payload_ref = ?1",
        )
        .bind(payload_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_payload).transpose()
    }
}

fn row_to_candidate(row: sqlx::sqlite::SqliteRow) -> Result<SkillCandidate> {
    Ok(SkillCandidate {
        id: row.get("id"),
        skill_key: row.get("skill_key"),
        source_execution_ids: serde_json::from_str(&row.get::<String, _>("source_execution_ids"))?,
        payload_ref: row.get("payload_ref"),
        summary: row.get("summary"),
        status: SkillCandidateStatus::parse(&row.get::<String, _>("status"))?,
        latest_score: row.get("latest_score"),
        latest_pass: row.get("latest_pass"),
        last_evaluated_at: parse_opt_ts(row.get("last_evaluated_at"))?,
        promotion_release_id: row.get("promotion_release_id"),
        created_by: row.get("created_by"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
        deleted_at: parse_opt_ts(row.get("deleted_at"))?,
        deleted_by: row.get("deleted_by"),
        delete_reason: row.get("delete_reason"),
    })
}

fn row_to_evaluation(row: sqlx::sqlite::SqliteRow) -> Result<SkillEvaluation> {
    Ok(SkillEvaluation {
        id: row.get("id"),
        candidate_id: row.get("candidate_id"),
        passed: row.get("passed"),
        score: row.get("score"),
        report: row.get("report"),
        evaluated_by: row.get("evaluated_by"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

fn row_to_release(row: sqlx::sqlite::SqliteRow) -> Result<SkillRelease> {
    Ok(SkillRelease {
        id: row.get("id"),
        skill_key: row.get("skill_key"),
        candidate_id: row.get("candidate_id"),
        version: row.get("version"),
        stage: SkillReleaseStage::parse(&row.get::<String, _>("stage"))?,
        is_active: row.get("is_active"),
        rolled_back_at: parse_opt_ts(row.get("rolled_back_at"))?,
        promoted_by: row.get("promoted_by"),
        promoted_at: parse_ts(&row.get::<String, _>("promoted_at"))?,
        deleted_at: parse_opt_ts(row.get("deleted_at"))?,
        deleted_by: row.get("deleted_by"),
        delete_reason: row.get("delete_reason"),
    })
}

fn row_to_payload(row: sqlx::sqlite::SqliteRow) -> Result<SkillPayload> {
    Ok(SkillPayload {
        payload_ref: row.get("payload_ref"),
        kind: row.get("kind"),
        payload: serde_json::from_str(&row.get::<String, _>("payload"))?,
        created_by: row.get("created_by"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}
