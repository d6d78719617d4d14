// ABOUTME: IdempotencyService - fingerprints mutating requests and replays cached replies
// ABOUTME: Same key + same body replays; same key + different body conflicts

use crate::error::{CoreError, Result};
use bay_storage::idempotency::ClaimOutcome;
use bay_storage::{IdempotencyStatus, IdempotencyStore};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};

/// How long completed records replay before the key is treated as new.
const RECORD_TTL_HOURS: i64 = 24;

/// Decision for a request carrying an idempotency key.
#[derive(Debug)]
pub enum IdempotentBegin {
    /// First time: run the handler, then call `complete`.
    Execute,
    /// Same key and body already completed: replay the snapshot verbatim.
    Replay { status: i64, body: String },
}

pub struct IdempotencyService {
    store: IdempotencyStore,
}

impl IdempotencyService {
    pub fn new(store: IdempotencyStore) -> Self {
        Self { store }
    }

    /// Canonical fingerprint of a request body. serde_json orders object
    /// keys, so two bodies with the same content hash identically.
    pub fn fingerprint(body: &serde_json::Value) -> String {
        let canonical = body.to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn begin(
        &self,
        owner: &str,
        key: &str,
        scope: &str,
        body: &serde_json::Value,
    ) -> Result<IdempotentBegin> {
        let fingerprint = Self::fingerprint(body);
        let now = Utc::now();
        let expires_at = now + Duration::hours(RECORD_TTL_HOURS);

        match self
            .store
            .claim(owner, key, scope, &fingerprint, now, expires_at)
            .await?
        {
            ClaimOutcome::Claimed => Ok(IdempotentBegin::Execute),
            ClaimOutcome::Existing(record) => {
                if record.fingerprint != fingerprint {
                    return Err(CoreError::Conflict(format!(
                        "idempotency key {key} was used with a different request body"
                    )));
                }
                match record.status {
                    IdempotencyStatus::InProgress => Err(CoreError::Conflict(format!(
                        "request with idempotency key {key} is still in progress"
                    ))),
                    IdempotencyStatus::Complete => {
                        let status = record.response_status.unwrap_or(200);
                        let body = record.response_body.unwrap_or_default();
                        Ok(IdempotentBegin::Replay { status, body })
                    }
                }
            }
        }
    }

    /// Persist the response snapshot for future replays.
    pub async fn complete(
        &self,
        owner: &str,
        key: &str,
        scope: &str,
        status: i64,
        body: &str,
    ) -> Result<()> {
        self.store.complete(owner, key, scope, status, body).await?;
        Ok(())
    }

    /// Release the claim after a handler failure so a retry can run.
    pub async fn abandon(&self, owner: &str, key: &str, scope: &str) -> Result<()> {
        self.store.release(owner, key, scope).await?;
        Ok(())
    }
}
