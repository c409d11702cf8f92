use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{CampaignStore, StoreError};
use crate::database::models::{
    AudienceFilter, Campaign, CampaignId, CampaignRow, NewCampaign, OutcomeRow, Progress,
    RecipientId, RecipientOutcome, CAMPAIGN_COLUMNS, OUTCOME_COLUMNS,
};
use crate::dispatch::feed::ChangeNotifier;
use crate::dispatch::state::{CampaignStatus, Transition};
use crate::utils::logging::log_database_operation;

/// SQLite-backed store. SQLite has no push channel of its own, so the store
/// publishes on a [`ChangeNotifier`] every time one of its writes makes a
/// campaign `pending`, the same condition the Postgres trigger fires on.
#[derive(Clone)]
pub struct SqliteCampaignStore {
    pool: SqlitePool,
    notifier: Option<ChangeNotifier>,
}

impl SqliteCampaignStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, notifier: None }
    }

    pub fn with_notifier(pool: SqlitePool, notifier: ChangeNotifier) -> Self {
        Self {
            pool,
            notifier: Some(notifier),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn notify_pending(&self, id: CampaignId) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(id);
        }
    }
}

#[async_trait]
impl CampaignStore for SqliteCampaignStore {
    async fn insert_campaign(&self, campaign: &NewCampaign) -> Result<CampaignId, StoreError> {
        campaign.validate()?;
        let payload = serde_json::to_string(&campaign.payload)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let target = serde_json::to_string(&campaign.target)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;

        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO campaigns (kind, payload, target, status, scheduled_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
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
        if campaign.status == CampaignStatus::Pending {
            self.notify_pending(id);
        }
        Ok(id)
    }

    async fn register_recipient(
        &self,
        telegram_id: RecipientId,
        username: Option<&str>,
        registered_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (telegram_id, username, registered_at) VALUES (?, ?, ?)
             ON CONFLICT(telegram_id) DO UPDATE SET username = excluded.username",
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
        sqlx::query("UPDATE users SET is_blocked = ? WHERE telegram_id = ?")
            .bind(blocked)
            .bind(telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        let row = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Campaign::try_from).transpose()
    }

    async fn recent_campaigns(&self, limit: i64) -> Result<Vec<Campaign>, StoreError> {
        let rows = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY created_at DESC, id DESC LIMIT ?"
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
                 status = ?,
                 started_at = CASE WHEN ? THEN ? ELSE started_at END,
                 completed_at = CASE WHEN ? THEN ? ELSE completed_at END
             WHERE id = ? AND status = ?",
        )
        .bind(transition.to().as_str())
        .bind(transition.to() == CampaignStatus::Processing)
        .bind(at)
        .bind(transition.to().is_terminal())
        .bind(at)
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
            if transition.to() == CampaignStatus::Pending {
                self.notify_pending(id);
            }
        }
        Ok(applied)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<CampaignId>, StoreError> {
        let mut ids = sqlx::query_scalar::<_, i64>(
            "UPDATE campaigns SET status = 'pending'
             WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?
             RETURNING id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        ids.sort_unstable();
        for id in &ids {
            self.notify_pending(*id);
        }
        Ok(ids)
    }

    async fn record_progress(&self, id: CampaignId, progress: &Progress) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE campaigns SET recipients_total = ?, recipients_sent = ?,
                 recipients_failed = ?, recipients_skipped = ?
             WHERE id = ? AND status = 'processing'",
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
            "UPDATE campaigns SET status = ?, completed_at = ?, recipients_total = ?,
                 recipients_sent = ?, recipients_failed = ?, recipients_skipped = ?,
                 error_class = ?
             WHERE id = ? AND status = ?",
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
               AND (? IS NULL OR registered_at >= ?)
               AND (? IS NULL OR registered_at < ?)
             ORDER BY telegram_id",
        )
        .bind(filter.registered_after)
        .bind(filter.registered_after)
        .bind(filter.registered_before)
        .bind(filter.registered_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn outcomes(&self, id: CampaignId) -> Result<Vec<RecipientOutcome>, StoreError> {
        let rows = sqlx::query_as::<_, OutcomeRow>(&format!(
            "SELECT {OUTCOME_COLUMNS} FROM recipient_outcomes
             WHERE campaign_id = ? ORDER BY recipient_id"
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
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(campaign_id, recipient_id) DO UPDATE SET
                 outcome = excluded.outcome,
                 attempt_count = excluded.attempt_count,
                 last_error_class = excluded.last_error_class,
                 updated_at = excluded.updated_at",
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
             WHERE outcome = 'delivered' AND updated_at >= ?
               AND (? IS NULL OR campaign_id = ?)",
        )
        .bind(since)
        .bind(campaign)
        .bind(campaign)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
