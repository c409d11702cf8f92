use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{CampaignStore, StoreError};
use crate::database::models::{
    AudienceFilter, Campaign, CampaignId, CampaignRow, NewCampaign, OutcomeRow, Progress,
    RecipientId, RecipientOutcome, CAMPAIGN_COLUMNS, OUTCOME_COLUMNS,
};
use crate::dispatch::state::{CampaignStatus, Transition};
use crate::utils::logging::log_database_operation;

/// Postgres-backed store. Notifications come from the `campaigns` trigger
/// installed by the migrations, so writes here never publish anything
/// themselves.
#[derive(Clone)]
pub struct PgCampaignStore {
    pool: PgPool,
}

impl PgCampaignStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CampaignStore for PgCampaignStore {
    async fn insert_campaign(&self, campaign: &NewCampaign) -> Result<CampaignId, StoreError> {
        campaign.validate()?;
        let payload = serde_json::to_string(&campaign.payload)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let target = serde_json::to_string(&campaign.target)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;

        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO campaigns (kind, payload, target, status, scheduled_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(campaign.kind.as_str())
        .bind(payload)
        .bind(target)
        .bind(campaign.status.as_str())
        .bind(campaign.scheduled_at)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        log_database_operation("INSERT", "campaigns", Some(&format!("id={id} status={}", campaign.status)));
        Ok(id)
    }

    async fn register_recipient(
        &self,
        telegram_id: RecipientId,
        username: Option<&str>,
        registered_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (telegram_id, username, registered_at) VALUES ($1, $2, $3)
             ON CONFLICT (telegram_id) DO UPDATE SET username = EXCLUDED.username",
        )
        .bind(telegram_id)
        .bind(username)
        .bind(registered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_recipient_blocked(
        &self,
        telegram_id: RecipientId,
        blocked: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET is_blocked = $1 WHERE telegram_id = $2")
            .bind(blocked)
            .bind(telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        let row = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Campaign::try_from).transpose()
    }

    async fn recent_campaigns(&self, limit: i64) -> Result<Vec<Campaign>, StoreError> {
        let rows = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY created_at DESC, id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Campaign::try_from).collect()
    }

    async fn dispatchable_campaign_ids(&self) -> Result<Vec<CampaignId>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM campaigns
             WHERE status IN ('pending', 'processing')
             ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn apply_transition(
        &self,
        id: CampaignId,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE campaigns SET
                 status = $1,
                 started_at = CASE WHEN $2 THEN $3 ELSE started_at END,
                 completed_at = CASE WHEN $4 THEN $3 ELSE completed_at END
             WHERE id = $5 AND status = $6",
        )
        .bind(transition.to().as_str())
        .bind(transition.to() == CampaignStatus::Processing)
        .bind(at)
        .bind(transition.to().is_terminal())
        .bind(id)
        .bind(transition.from().as_str())
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() == 1;
        if applied {
            log_database_operation(
                "TRANSITION",
                "campaigns",
                Some(&format!("id={id} {} -> {}", transition.from(), transition.to())),
            );
        }
        Ok(applied)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<CampaignId>, StoreError> {
        let mut ids = sqlx::query_scalar::<_, i64>(
            "UPDATE campaigns SET status = 'pending'
             WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= $1
             RETURNING id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        ids.sort_unstable();
        Ok(ids)
    }

    async fn record_progress(&self, id: CampaignId, progress: &Progress) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE campaigns SET recipients_total = $1, recipients_sent = $2,
                 recipients_failed = $3, recipients_skipped = $4
             WHERE id = $5 AND status = 'processing'",
        )
        .bind(progress.total)
        .bind(progress.sent)
        .bind(progress.failed)
        .bind(progress.skipped)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish(
        &self,
        id: CampaignId,
        transition: Transition,
        progress: &Progress,
        error_class: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !transition.to().is_terminal() {
            return Err(StoreError::Invalid(format!(
                "finish requires a terminal status, got {}",
                transition.to()
            )));
        }

        let result = sqlx::query(
            "UPDATE campaigns SET status = $1, completed_at = $2, recipients_total = $3,
                 recipients_sent = $4, recipients_failed = $5, recipients_skipped = $6,
                 error_class = $7
             WHERE id = $8 AND status = $9",
        )
        .bind(transition.to().as_str())
        .bind(at)
        .bind(progress.total)
        .bind(progress.sent)
        .bind(progress.failed)
        .bind(progress.skipped)
        .bind(error_class)
        .bind(id)
        .bind(transition.from().as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn resolve_audience(
        &self,
        filter: &AudienceFilter,
    ) -> Result<Vec<RecipientId>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT telegram_id FROM users
             WHERE is_blocked = FALSE
               AND ($1::timestamptz IS NULL OR registered_at >= $1)
               AND ($2::timestamptz IS NULL OR registered_at < $2)
             ORDER BY telegram_id",
        )
        .bind(filter.registered_after)
        .bind(filter.registered_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn outcomes(&self, id: CampaignId) -> Result<Vec<RecipientOutcome>, StoreError> {
        let rows = sqlx::query_as::<_, OutcomeRow>(&format!(
            "SELECT {OUTCOME_COLUMNS} FROM recipient_outcomes
             WHERE campaign_id = $1 ORDER BY recipient_id"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RecipientOutcome::try_from).collect()
    }

    async fn record_outcome(&self, outcome: &RecipientOutcome) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO recipient_outcomes
                 (campaign_id, recipient_id, outcome, attempt_count, last_error_class, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (campaign_id, recipient_id) DO UPDATE SET
                 outcome = EXCLUDED.outcome,
                 attempt_count = EXCLUDED.attempt_count,
                 last_error_class = EXCLUDED.last_error_class,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(outcome.campaign_id)
        .bind(outcome.recipient_id)
        .bind(outcome.outcome.as_str())
        .bind(outcome.attempt_count)
        .bind(outcome.last_error_class.as_deref())
        .bind(outcome.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delivered_since(
        &self,
        campaign: Option<CampaignId>,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM recipient_outcomes
             WHERE outcome = 'delivered' AND updated_at >= $1
               AND ($2::bigint IS NULL OR campaign_id = $2)",
        )
        .bind(since)
        .bind(campaign)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
