// ABOUTME: Idempotency key store - request fingerprints and cached replies
// ABOUTME: A unique constraint on (owner, key, scope) picks the winner under races

use crate::models::{IdempotencyRecord, IdempotencyStatus};
use crate::{is_unique_violation, parse_ts, to_ts, Result, StorageError};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

/// Outcome of attempting to claim an idempotency key.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// This request won the insert and should run the handler.
    Claimed,
    /// A record already exists; the caller decides replay vs conflict.
    Existing(IdempotencyRecord),
}

pub struct IdempotencyStore {
    pool: SqlitePool,
}

impl IdempotencyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Try to claim (owner, key, scope). Expired rows are purged first so an
    /// aged key behaves like a new one.
    pub async fn claim(
        &self,
        owner: &str,
        key: &str,
        scope: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        sqlx::query(
            "DELETE FROM idempotency_keys \
             WHERE owner = ?1 AND idem_key = ?2 AND scope = ?3 AND expires_at <= ?4",
        )
        .bind(owner)
        .bind(key)
        .bind(scope)
        .bind(to_ts(&now))
        .execute(&self.pool)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (
                owner, idem_key, scope, fingerprint, status, created_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, 'in_progress', ?5, ?6)
            "#,
        )
        .bind(owner)
        .bind(key)
        .bind(scope)
        .bind(fingerprint)
        .bind(to_ts(&now))
        .bind(to_ts(&expires_at))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(e) if is_unique_violation(&e) => {
                let record = self.get(owner, key, scope).await?.ok_or_else(|| {
                    StorageError::NotFound(format!("idempotency {owner}/{scope}/{key}"))
                })?;
                Ok(ClaimOutcome::Existing(record))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(
        &self,
        owner: &str,
        key: &str,
        scope: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            "SELECT owner, idem_key, scope, fingerprint, status, response_status, \
             response_body, created_at, expires_at \
             FROM idempotency_keys WHERE owner = ?1 AND idem_key = ?2 AND scope = ?3",
        )
        .bind(owner)
        .bind(key)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_record).transpose()
    }

    /// Store the response snapshot and mark the record complete.
    pub async fn complete(
        &self,
        owner: &str,
        key: &str,
        scope: &str,
        response_status: i64,
        response_body: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE idempotency_keys \
             SET status = 'complete', response_status = ?1, response_body = ?2 \
             WHERE owner = ?3 AND idem_key = ?4 AND scope = ?5",
        )
        .bind(response_status)
        .bind(response_body)
        .bind(owner)
        .bind(key)
        .bind(scope)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "idempotency {owner}/{scope}/{key}"
            )));
        }
        Ok(())
    }

    /// Drop a claim when the handler failed; the next attempt starts fresh.
    pub async fn release(&self, owner: &str, key: &str, scope: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM idempotency_keys WHERE owner = ?1 AND idem_key = ?2 AND scope = ?3",
        )
        .bind(owner)
        .bind(key)
        .bind(scope)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= ?1")
            .bind(to_ts(&now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<IdempotencyRecord> {
    Ok(IdempotencyRecord {
        owner: row.get("owner"),
        key: row.get("idem_key"),
        scope: row.get("scope"),
        fingerprint: row.get("fingerprint"),
        status: IdempotencyStatus::parse(&row.get::<String, _>("status"))?,
        response_status: row.get("response_status"),
        response_body: row.get("response_body"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        expires_at: parse_ts(&row.get::<String, _>("expires_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect_in_memory;
    use chrono::Duration;

    #[tokio::test]
    async fn test_claim_then_complete_then_replay() {
        let pool = connect_in_memory().await.unwrap();
        let store = IdempotencyStore::new(pool);
        let now = Utc::now();
        let exp = now + Duration::hours(24);

        let outcome = store
            .claim("acme", "k1", "sandboxes.create", "fp-1", now, exp)
            .await
            .unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed));

        store
            .complete("acme", "k1", "sandboxes.create", 201, r#"{"id":"sandbox-1"}"#)
            .await
            .unwrap();

        let outcome = store
            .claim("acme", "k1", "sandboxes.create", "fp-1", now, exp)
            .await
            .unwrap();
        match outcome {
            ClaimOutcome::Existing(record) => {
                assert_eq!(record.status, IdempotencyStatus::Complete);
                assert_eq!(record.response_status, Some(201));
                assert_eq!(record.fingerprint, "fp-1");
            }
            ClaimOutcome::Claimed => panic!("expected existing record"),
        }
    }

    #[tokio::test]
    async fn test_expired_record_is_treated_as_new() {
        let pool = connect_in_memory().await.unwrap();
        let store = IdempotencyStore::new(pool);
        let past = Utc::now() - Duration::hours(48);

        store
            .claim("acme", "k1", "s", "fp-old", past, past + Duration::hours(24))
            .await
            .unwrap();

        let now = Utc::now();
        let outcome = store
            .claim("acme", "k1", "s", "fp-new", now, now + Duration::hours(24))
            .await
            .unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed));
    }

    #[tokio::test]
    async fn test_scope_isolation() {
        let pool = connect_in_memory().await.unwrap();
        let store = IdempotencyStore::new(pool);
        let now = Utc::now();
        let exp = now + Duration::hours(24);

        store.claim("acme", "k1", "a", "fp", now, exp).await.unwrap();
        let outcome = store.claim("acme", "k1", "b", "fp", now, exp).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed));
    }
}
