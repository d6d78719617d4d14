// ABOUTME: Skill lifecycle service - candidate, evaluation, release, rollback, payloads
// ABOUTME: At most one active release per (skill key, stage); deletes are soft with a reason

use crate::error::{CoreError, Result};
use crate::ids::new_id;
use bay_storage::{
    ExecutionStore, SkillCandidate, SkillCandidateStatus, SkillEvaluation, SkillPayload,
    SkillRelease, SkillReleaseStage, SkillStore,
};
use chrono::Utc;
use tracing::info;

pub struct SkillLifecycle {
    skills: SkillStore,
    executions: ExecutionStore,
}

/// Result of a rollback: the deactivated release and the one reactivated in
/// its place, if a predecessor existed.
pub struct RollbackOutcome {
    pub rolled_back: SkillRelease,
    pub reactivated: Option<SkillRelease>,
}

impl SkillLifecycle {
    pub fn new(skills: SkillStore, executions: ExecutionStore) -> Self {
        Self { skills, executions }
    }

    /// Create a draft candidate from recorded executions, optionally carrying
    /// a stored payload blob.
    pub async fn create_candidate(
        &self,
        owner: &str,
        skill_key: &str,
        source_execution_ids: &[String],
        payload_ref: Option<String>,
        summary: Option<String>,
    ) -> Result<SkillCandidate> {
        if skill_key.trim().is_empty() {
            return Err(CoreError::Validation("skill_key must not be empty".to_string()));
        }
        if source_execution_ids.is_empty() {
            return Err(CoreError::Validation(
                "at least one source execution is required".to_string(),
            ));
        }
        for execution_id in source_execution_ids {
            if self.executions.get(execution_id, owner).await?.is_none() {
                return Err(CoreError::Validation(format!(
                    "unknown source execution: {execution_id}"
                )));
            }
        }
        if let Some(payload_ref) = &payload_ref {
            if self.skills.get_payload(payload_ref).await?.is_none() {
                return Err(CoreError::Validation(format!(
                    "unknown payload ref: {payload_ref}"
                )));
            }
        }

        let now = Utc::now();
        let candidate = SkillCandidate {
            id: new_id("cand"),
            skill_key: skill_key.to_string(),
            source_execution_ids: source_execution_ids.to_vec(),
            payload_ref,
            summary,
            status: SkillCandidateStatus::Draft,
            latest_score: None,
            latest_pass: None,
            last_evaluated_at: None,
            promotion_release_id: None,
            created_by: Some(owner.to_string()),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted_by: None,
            delete_reason: None,
        };
        self.skills.create_candidate(&candidate).await?;
        info!(candidate_id = %candidate.id, skill_key = %skill_key, "skill.candidate.create");
        Ok(candidate)
    }

    pub async fn get_candidate(&self, id: &str) -> Result<SkillCandidate> {
        self.skills
            .get_candidate(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Skill candidate not found: {id}")))
    }

    fn require_live(candidate: &SkillCandidate) -> Result<()> {
        if candidate.is_deleted() {
            return Err(CoreError::Conflict(format!(
                "candidate {} is deleted",
                candidate.id
            )));
        }
        Ok(())
    }

    pub async fn list_candidates(
        &self,
        skill_key: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SkillCandidate>> {
        Ok(self.skills.list_candidates(skill_key, limit).await?)
    }

    /// Attach an evaluation. A failing evaluation rejects the candidate; a
    /// passing one makes it promotable.
    pub async fn evaluate(
        &self,
        candidate_id: &str,
        passed: bool,
        score: Option<f64>,
        report: Option<String>,
        evaluated_by: Option<String>,
    ) -> Result<SkillEvaluation> {
        let mut candidate = self.get_candidate(candidate_id).await?;
        Self::require_live(&candidate)?;
        if candidate.status == SkillCandidateStatus::Promoted {
            return Err(CoreError::Conflict(format!(
                "candidate {candidate_id} is already promoted"
            )));
        }

        let evaluation = SkillEvaluation {
            id: new_id("eval"),
            candidate_id: candidate_id.to_string(),
            passed,
            score,
            report,
            evaluated_by,
            created_at: Utc::now(),
        };
        self.skills.create_evaluation(&evaluation).await?;

        candidate.status = if passed {
            SkillCandidateStatus::Evaluated
        } else {
            SkillCandidateStatus::Rejected
        };
        candidate.latest_score = score;
        candidate.latest_pass = Some(passed);
        candidate.last_evaluated_at = Some(evaluation.created_at);
        self.skills.update_candidate(&candidate).await?;

        info!(candidate_id = %candidate_id, passed, "skill.candidate.evaluate");
        Ok(evaluation)
    }

    /// Promote an evaluated candidate to the active release of a stage,
    /// superseding the prior active release for that (key, stage).
    pub async fn promote(
        &self,
        candidate_id: &str,
        stage: SkillReleaseStage,
        promoted_by: Option<String>,
    ) -> Result<SkillRelease> {
        let mut candidate = self.get_candidate(candidate_id).await?;
        Self::require_live(&candidate)?;

        match candidate.status {
            SkillCandidateStatus::Evaluated if candidate.latest_pass == Some(true) => {}
            SkillCandidateStatus::Promoted => {
                // Idempotent replay of a finished promotion.
                if let Some(release_id) = &candidate.promotion_release_id {
                    if let Some(release) = self.skills.get_release(release_id).await? {
                        return Ok(release);
                    }
                }
                return Err(CoreError::Conflict(format!(
                    "candidate {candidate_id} was promoted but its release is missing"
                )));
            }
            _ => {
                return Err(CoreError::Conflict(format!(
                    "candidate {candidate_id} has no passing evaluation"
                )));
            }
        }

        if let Some(previous) = self.skills.active_release(&candidate.skill_key, stage).await? {
            self.skills.set_release_active(&previous.id, false).await?;
        }

        let version = self.skills.max_version(&candidate.skill_key, stage).await? + 1;
        let release = SkillRelease {
            id: new_id("rel"),
            skill_key: candidate.skill_key.clone(),
            candidate_id: candidate_id.to_string(),
            version,
            stage,
            is_active: true,
            rolled_back_at: None,
            promoted_by,
            promoted_at: Utc::now(),
            deleted_at: None,
            deleted_by: None,
            delete_reason: None,
        };
        self.skills.create_release(&release).await?;

        candidate.status = SkillCandidateStatus::Promoted;
        candidate.promotion_release_id = Some(release.id.clone());
        self.skills.update_candidate(&candidate).await?;

        info!(
            candidate_id = %candidate_id,
            release_id = %release.id,
            stage = %stage.as_str(),
            version,
            "skill.candidate.promote"
        );
        Ok(release)
    }

    pub async fn list_releases(&self, skill_key: Option<&str>) -> Result<Vec<SkillRelease>> {
        Ok(self.skills.list_releases(skill_key).await?)
    }

    pub async fn get_release(&self, id: &str) -> Result<SkillRelease> {
        self.skills
            .get_release(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Skill release not found: {id}")))
    }

    /// Roll the active release back to its most recent eligible predecessor
    /// (never rolled back, not deleted).
    pub async fn rollback(&self, release_id: &str) -> Result<RollbackOutcome> {
        let release = self.get_release(release_id).await?;
        if !release.is_active {
            return Err(CoreError::Conflict(format!(
                "release {release_id} is not active"
            )));
        }

        self.skills.mark_rolled_back(&release.id, Utc::now()).await?;

        let predecessor = self
            .skills
            .latest_rollback_target(&release.skill_key, release.stage, release.version)
            .await?;
        let reactivated = match predecessor {
            Some(previous) => {
                self.skills.set_release_active(&previous.id, true).await?;
                self.skills.get_release(&previous.id).await?
            }
            None => None,
        };

        let rolled_back = self.get_release(release_id).await?;
        info!(
            release_id = %release_id,
            reactivated = reactivated.as_ref().map(|r| r.id.as_str()).unwrap_or("none"),
            "skill.release.rollback"
        );
        Ok(RollbackOutcome {
            rolled_back,
            reactivated,
        })
    }

    /// Soft-delete a candidate, keeping the row for audit. A candidate whose
    /// promotion release is still active must be rolled back first.
    pub async fn delete_candidate(
        &self,
        candidate_id: &str,
        deleted_by: Option<String>,
        reason: Option<String>,
    ) -> Result<SkillCandidate> {
        let candidate = self.get_candidate(candidate_id).await?;
        Self::require_live(&candidate)?;

        if let Some(release_id) = &candidate.promotion_release_id {
            if let Some(release) = self.skills.get_release(release_id).await? {
                if release.is_active {
                    return Err(CoreError::Conflict(format!(
                        "candidate {candidate_id} backs active release {release_id}"
                    )));
                }
            }
        }

        self.skills
            .soft_delete_candidate(
                candidate_id,
                deleted_by.as_deref(),
                reason.as_deref(),
                Utc::now(),
            )
            .await?;

        info!(candidate_id = %candidate_id, "skill.candidate.delete");
        self.get_candidate(candidate_id).await
    }

    /// Soft-delete an inactive release. Active releases must be rolled back
    /// or superseded first so the single-active invariant never dangles.
    pub async fn delete_release(
        &self,
        release_id: &str,
        deleted_by: Option<String>,
        reason: Option<String>,
    ) -> Result<SkillRelease> {
        let release = self.get_release(release_id).await?;
        if release.is_deleted() {
            return Err(CoreError::Conflict(format!(
                "release {release_id} is already deleted"
            )));
        }
        if release.is_active {
            return Err(CoreError::Conflict(format!(
                "release {release_id} is active; roll it back or supersede it first"
            )));
        }

        self.skills
            .soft_delete_release(
                release_id,
                deleted_by.as_deref(),
                reason.as_deref(),
                Utc::now(),
            )
            .await?;

        info!(release_id = %release_id, "skill.release.delete");
        self.get_release(release_id).await
    }

    // ========================================================================
    // PAYLOAD BLOBS
    // ========================================================================

    /// Store an opaque payload blob and hand back its reference.
    pub async fn create_payload(
        &self,
        owner: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<SkillPayload> {
        if kind.trim().is_empty() {
            return Err(CoreError::Validation("payload kind must not be empty".to_string()));
        }
        if !(payload.is_object() || payload.is_array()) {
            return Err(CoreError::Validation(
                "payload must be a JSON object or array".to_string(),
            ));
        }

        let record = SkillPayload {
            payload_ref: new_id("payload"),
            kind: kind.to_string(),
            payload,
            created_by: Some(owner.to_string()),
            created_at: Utc::now(),
        };
        self.skills.create_payload(&record).await?;
        info!(payload_ref = %record.payload_ref, kind = %kind, "skill.payload.create");
        Ok(record)
    }

    pub async fn get_payload(&self, payload_ref: &str) -> Result<SkillPayload> {
        self.skills
            .get_payload(payload_ref)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Skill payload not found: {payload_ref}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bay_storage::{connect_in_memory, ExecType, ExecutionRecord};
    use serde_json::json;

    async fn service_with_execution() -> (SkillLifecycle, String) {
        let pool = connect_in_memory().await.unwrap();
        let executions = ExecutionStore::new(pool.clone());

        let now = Utc::now();
        let record = ExecutionRecord {
            id: "exec-1".to_string(),
            owner: "acme".to_string(),
            sandbox_id: "sandbox-1".to_string(),
            exec_type: ExecType::Browser,
            input: "open http://example.com".to_string(),
            output: Some("done".to_string()),
            error: None,
            exit_code: None,
            success: true,
            duration_ms: 5,
            started_at: now,
            tags: Vec::new(),
            description: None,
            notes: None,
            created_at: now,
        };
        executions.create(&record).await.unwrap();

        (
            SkillLifecycle::new(SkillStore::new(pool.clone()), executions),
            "exec-1".to_string(),
        )
    }

    #[tokio::test]
    async fn test_candidate_with_payload_lifecycle() {
        let (service, exec_id) = service_with_execution().await;

        let payload = service
            .create_payload("acme", "browser_trace", json!({"steps": ["open"]}))
            .await
            .unwrap();

        // An unknown payload ref is rejected; the stored one is accepted.
        let err = service
            .create_candidate(
                "acme",
                "fetch",
                &[exec_id.clone()],
                Some("payload-missing".to_string()),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let candidate = service
            .create_candidate(
                "acme",
                "fetch",
                &[exec_id],
                Some(payload.payload_ref.clone()),
                Some("fetch flow".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(candidate.payload_ref.as_deref(), Some(payload.payload_ref.as_str()));

        let stored = service.get_payload(&payload.payload_ref).await.unwrap();
        assert_eq!(stored.payload["steps"][0], "open");
    }

    #[tokio::test]
    async fn test_promote_rollback_then_delete_release() {
        let (service, exec_id) = service_with_execution().await;

        let first = service
            .create_candidate("acme", "fetch", &[exec_id.clone()], None, None)
            .await
            .unwrap();
        service.evaluate(&first.id, true, Some(0.9), None, None).await.unwrap();
        let rel_v1 = service
            .promote(&first.id, SkillReleaseStage::Canary, None)
            .await
            .unwrap();

        let second = service
            .create_candidate("acme", "fetch", &[exec_id], None, None)
            .await
            .unwrap();
        service.evaluate(&second.id, true, Some(0.95), None, None).await.unwrap();
        let rel_v2 = service
            .promote(&second.id, SkillReleaseStage::Canary, None)
            .await
            .unwrap();
        assert_eq!(rel_v2.version, 2);

        // Deleting the active release is refused.
        let err = service
            .delete_release(&rel_v2.id, None, Some("nope".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        // Rollback reactivates v1, then v2 can be deleted with a reason.
        let outcome = service.rollback(&rel_v2.id).await.unwrap();
        assert_eq!(outcome.reactivated.unwrap().id, rel_v1.id);

        let deleted = service
            .delete_release(&rel_v2.id, Some("acme".to_string()), Some("regression".to_string()))
            .await
            .unwrap();
        assert!(deleted.is_deleted());
        assert_eq!(deleted.delete_reason.as_deref(), Some("regression"));

        // Deleted releases disappear from listings.
        let listed = service.list_releases(Some("fetch")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, rel_v1.id);
    }

    #[tokio::test]
    async fn test_delete_candidate_guards_active_release() {
        let (service, exec_id) = service_with_execution().await;

        let candidate = service
            .create_candidate("acme", "fetch", &[exec_id], None, None)
            .await
            .unwrap();
        service.evaluate(&candidate.id, true, None, None, None).await.unwrap();
        let release = service
            .promote(&candidate.id, SkillReleaseStage::Stable, None)
            .await
            .unwrap();

        // Backing candidate of an active release cannot be deleted.
        let err = service
            .delete_candidate(&candidate.id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        service.rollback(&release.id).await.unwrap();
        let deleted = service
            .delete_candidate(
                &candidate.id,
                Some("acme".to_string()),
                Some("superseded".to_string()),
            )
            .await
            .unwrap();
        assert!(deleted.is_deleted());

        // A deleted candidate refuses further lifecycle operations.
        let err = service
            .evaluate(&candidate.id, true, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        let err = service
            .promote(&candidate.id, SkillReleaseStage::Stable, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }
}
