use std::fmt::{Display, Formatter};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::errors::Result;

pub const DEFAULT_DAILY_LIMIT: u32 = 20;
pub const DEFAULT_PRIMARY_MODEL: &str = "gemini-2.5-flash-lite";
pub const DEFAULT_SECONDARY_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Primary,
    Secondary,
}

impl ModelTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelTier::Primary => "primary",
            ModelTier::Secondary => "secondary",
        }
    }
}

impl Display for ModelTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    pub daily_limit: u32,
    pub primary_model: String,
    pub secondary_model: String,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
            primary_model: DEFAULT_PRIMARY_MODEL.to_string(),
            secondary_model: DEFAULT_SECONDARY_MODEL.to_string(),
        }
    }
}

impl QuotaPolicy {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Primary => &self.primary_model,
            ModelTier::Secondary => &self.secondary_model,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QuotaStatus {
    pub current_tier: ModelTier,
    pub current_model: String,
    pub primary_count: u32,
    pub secondary_count: u32,
    pub total_count: u32,
    pub daily_limit: u32,
    pub utc_date: String,
}

/// Picks a model tier from per-day request counters kept in the shared store.
///
/// Counters are keyed by (tier, UTC date). A date without a row counts as zero,
/// so rollover needs no reset.
#[derive(Clone)]
pub struct QuotaScheduler {
    pool: SqlitePool,
    policy: QuotaPolicy,
}

impl QuotaScheduler {
    pub fn new(pool: SqlitePool, policy: QuotaPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub async fn select(&self) -> Result<ModelTier> {
        self.select_on(today()).await
    }

    /// Primary while it has headroom, then secondary. With both spent it falls
    /// back to primary and lets the upstream call fail.
    pub async fn select_on(&self, date: NaiveDate) -> Result<ModelTier> {
        let limit = self.policy.daily_limit;
        if self.count_on(ModelTier::Primary, date).await? < limit {
            return Ok(ModelTier::Primary);
        }
        if self.count_on(ModelTier::Secondary, date).await? < limit {
            return Ok(ModelTier::Secondary);
        }
        debug!(%date, "both model tiers exhausted; falling back to primary");
        Ok(ModelTier::Primary)
    }

    pub async fn increment(&self, tier: ModelTier) -> Result<u32> {
        self.increment_on(tier, today()).await
    }

    /// Single-statement upsert, so concurrent callers never lose an update.
    pub async fn increment_on(&self, tier: ModelTier, date: NaiveDate) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO api_requests (model, utc_date, request_count)
            VALUES (?, ?, 1)
            ON CONFLICT(model, utc_date) DO UPDATE SET
                request_count = request_count + 1
            RETURNING request_count
            "#,
        )
        .bind(tier.as_str())
        .bind(date_key(date))
        .fetch_one(&self.pool)
        .await?;
        Ok(clamp_count(count))
    }

    pub async fn count_on(&self, tier: ModelTier, date: NaiveDate) -> Result<u32> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT request_count FROM api_requests WHERE model = ? AND utc_date = ?",
        )
        .bind(tier.as_str())
        .bind(date_key(date))
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.map(clamp_count).unwrap_or(0))
    }

    pub async fn status(&self) -> Result<QuotaStatus> {
        self.status_on(today()).await
    }

    pub async fn status_on(&self, date: NaiveDate) -> Result<QuotaStatus> {
        let current_tier = self.select_on(date).await?;
        let primary_count = self.count_on(ModelTier::Primary, date).await?;
        let secondary_count = self.count_on(ModelTier::Secondary, date).await?;
        Ok(QuotaStatus {
            current_tier,
            current_model: self.policy.model_for(current_tier).to_string(),
            primary_count,
            secondary_count,
            total_count: primary_count.saturating_add(secondary_count),
            daily_limit: self.policy.daily_limit,
            utc_date: date_key(date),
        })
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn clamp_count(count: i64) -> u32 {
    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}
