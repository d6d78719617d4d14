// ABOUTME: GC task leases - row-level leases so one instance runs each task
// ABOUTME: Leases expire, so a dead instance cannot starve the cluster

use crate::{parse_ts, to_ts, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

pub struct GcLeaseStore {
    pool: SqlitePool,
}

impl GcLeaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Try to take (or renew) the lease for a task. Returns false when a
    /// different live holder owns it.
    pub async fn try_acquire(
        &self,
        task: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let expires_at = now + ttl;

        let result = sqlx::query(
            r#"
            INSERT INTO gc_leases (task, holder, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(task) DO UPDATE SET holder = ?2, expires_at = ?3
                WHERE gc_leases.expires_at <= ?4 OR gc_leases.holder = ?2
            "#,
        )
        .bind(task)
        .bind(holder)
        .bind(to_ts(&expires_at))
        .bind(to_ts(&now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn release(&self, task: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM gc_leases WHERE task = ?1 AND holder = ?2")
            .bind(task)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn current_holder(&self, task: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        let row = sqlx::query("SELECT holder, expires_at FROM gc_leases WHERE task = ?1")
            .bind(task)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            Ok((
                r.get::<String, _>("holder"),
                parse_ts(&r.get::<String, _>("expires_at"))?,
            ))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect_in_memory;

    #[tokio::test]
    async fn test_lease_exclusion_and_expiry() {
        let pool = connect_in_memory().await.unwrap();
        let store = GcLeaseStore::new(pool);
        let now = Utc::now();
        let ttl = Duration::seconds(60);

        assert!(store.try_acquire("idle_sessions", "a", ttl, now).await.unwrap());
        // Another holder is rejected while the lease lives.
        assert!(!store.try_acquire("idle_sessions", "b", ttl, now).await.unwrap());
        // The owner may renew.
        assert!(store.try_acquire("idle_sessions", "a", ttl, now).await.unwrap());

        // After expiry, the other holder can take over.
        let later = now + Duration::seconds(120);
        assert!(store.try_acquire("idle_sessions", "b", ttl, later).await.unwrap());

        let (holder, _) = store.current_holder("idle_sessions").await.unwrap().unwrap();
        assert_eq!(holder, "b");
    }

    #[tokio::test]
    async fn test_release_frees_lease() {
        let pool = connect_in_memory().await.unwrap();
        let store = GcLeaseStore::new(pool);
        let now = Utc::now();
        let ttl = Duration::seconds(60);

        assert!(store.try_acquire("expired_sandboxes", "a", ttl, now).await.unwrap());
        store.release("expired_sandboxes", "a").await.unwrap();
        assert!(store.try_acquire("expired_sandboxes", "b", ttl, now).await.unwrap());
    }
}
