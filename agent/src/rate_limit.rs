use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::errors::Result;

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: 4,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
        }
    }
}

impl RateLimitPolicy {
    /// Entries older than this can no longer influence a decision.
    pub fn retention(&self) -> Duration {
        self.window * 2 + self.cooldown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// Per-user sliding-window throttle over a persisted timestamp log.
///
/// Anonymous callers (`None`) are never checked or recorded.
#[derive(Clone)]
pub struct RateLimiter {
    pool: SqlitePool,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(pool: SqlitePool, policy: RateLimitPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub async fn check(&self, user: Option<&str>) -> Result<RateDecision> {
        self.check_at(user, Utc::now()).await
    }

    pub async fn check_at(&self, user: Option<&str>, now: DateTime<Utc>) -> Result<RateDecision> {
        let Some(user) = user else {
            return Ok(RateDecision::Allowed);
        };
        let now_ms = now.timestamp_millis();
        let window_ms = millis(self.policy.window);
        let cooldown_ms = millis(self.policy.cooldown);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_rate_limits WHERE user_id = ? AND request_time < ?")
            .bind(user)
            .bind(now_ms - millis(self.policy.retention()))
            .execute(&mut *tx)
            .await?;
        let in_window: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT request_time FROM user_rate_limits
            WHERE user_id = ? AND request_time >= ?
            ORDER BY request_time ASC
            "#,
        )
        .bind(user)
        .bind(now_ms - window_ms)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        if (in_window.len() as u64) < u64::from(self.policy.max_requests) {
            return Ok(RateDecision::Allowed);
        }

        let unlock_ms = in_window
            .first()
            .map(|oldest| oldest + window_ms + cooldown_ms)
            .unwrap_or(now_ms + window_ms + cooldown_ms);
        let wait_ms = (unlock_ms - now_ms).max(0);
        debug!(user, requests = in_window.len(), wait_ms, "rate limit reached");
        Ok(RateDecision::Limited {
            retry_after: Duration::from_millis(wait_ms as u64),
        })
    }

    pub async fn record(&self, user: Option<&str>) -> Result<()> {
        self.record_at(user, Utc::now()).await
    }

    pub async fn record_at(&self, user: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        let Some(user) = user else {
            return Ok(());
        };
        sqlx::query("INSERT INTO user_rate_limits (user_id, request_time) VALUES (?, ?)")
            .bind(user)
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of stored timestamps for `user`, purged or not.
    pub async fn stored_entries(&self, user: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM user_rate_limits WHERE user_id = ?")
                .bind(user)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;
    use chrono::TimeZone;

    async fn limiter() -> RateLimiter {
        let pool = store::in_memory().await.unwrap();
        RateLimiter::new(pool, RateLimitPolicy::default())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_780_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn allows_four_then_denies_fifth_with_wait() {
        let limiter = limiter().await;
        let user = Some("ada");
        for offset in [0, 5, 10, 15] {
            assert!(limiter.check_at(user, at(offset)).await.unwrap().is_allowed());
            limiter.record_at(user, at(offset)).await.unwrap();
        }

        let decision = limiter.check_at(user, at(20)).await.unwrap();
        // oldest (0) + 60 + 60 - now (20)
        assert_eq!(
            decision,
            RateDecision::Limited {
                retry_after: Duration::from_secs(100)
            }
        );
    }

    #[tokio::test]
    async fn check_does_not_record() {
        let limiter = limiter().await;
        for _ in 0..10 {
            assert!(limiter.check_at(Some("bo"), at(0)).await.unwrap().is_allowed());
        }
        assert_eq!(limiter.stored_entries("bo").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn window_slides_past_old_requests() {
        let limiter = limiter().await;
        let user = Some("cy");
        for offset in [0, 1, 2, 3] {
            limiter.record_at(user, at(offset)).await.unwrap();
        }
        assert!(!limiter.check_at(user, at(30)).await.unwrap().is_allowed());
        // oldest entry has left the 60s window
        assert!(limiter.check_at(user, at(61)).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn wait_counts_from_oldest_entry_in_window() {
        let limiter = limiter().await;
        let user = Some("di");
        for offset in [0, 1, 2, 3, 59] {
            limiter.record_at(user, at(offset)).await.unwrap();
        }
        // at t=61 the window holds 1, 2, 3 and 59
        match limiter.check_at(user, at(61)).await.unwrap() {
            RateDecision::Limited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(60))
            }
            RateDecision::Allowed => panic!("expected limit"),
        }
    }

    #[tokio::test]
    async fn purges_entries_beyond_retention() {
        let limiter = limiter().await;
        let user = Some("ed");
        limiter.record_at(user, at(0)).await.unwrap();
        limiter.record_at(user, at(100)).await.unwrap();
        limiter.record_at(Some("other"), at(0)).await.unwrap();

        limiter.check_at(user, at(181)).await.unwrap();
        assert_eq!(limiter.stored_entries("ed").await.unwrap(), 1);
        assert_eq!(limiter.stored_entries("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn anonymous_callers_are_exempt() {
        let limiter = limiter().await;
        for _ in 0..10 {
            limiter.record_at(None, at(0)).await.unwrap();
            assert!(limiter.check_at(None, at(0)).await.unwrap().is_allowed());
        }
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_rate_limits")
            .fetch_one(&limiter.pool)
            .await
            .unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn users_are_limited_independently() {
        let limiter = limiter().await;
        for offset in 0..4 {
            limiter.record_at(Some("fay"), at(offset)).await.unwrap();
        }
        assert!(!limiter.check_at(Some("fay"), at(5)).await.unwrap().is_allowed());
        assert!(limiter.check_at(Some("gus"), at(5)).await.unwrap().is_allowed());
    }
}
