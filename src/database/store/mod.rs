//! Campaign Store: the persisted campaign table, the recipient population and
//! the per-recipient outcome ledger.
//!
//! Both backends expose the same [`CampaignStore`] surface. Every status
//! change is a compare-and-set guarded by the current status, expressed as a
//! [`Transition`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::database::models::{
    AudienceFilter, Campaign, CampaignId, NewCampaign, Progress, RecipientId, RecipientOutcome,
};
use crate::dispatch::state::{IllegalTransition, Transition};

pub mod postgres;
pub mod sqlite;

pub use postgres::PgCampaignStore;
pub use sqlite::SqliteCampaignStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt {field} in campaign {campaign_id}: {reason}")]
    Corrupt {
        campaign_id: CampaignId,
        field: &'static str,
        reason: String,
    },
    #[error("invalid campaign: {0}")]
    Invalid(String),
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
}

impl StoreError {
    /// Stable label recorded as a campaign's `error_class`.
    pub fn class(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "store_unavailable",
            StoreError::Corrupt { .. } => "corrupt_record",
            StoreError::Invalid(_) => "invalid_campaign",
            StoreError::IllegalTransition(_) => "illegal_transition",
        }
    }
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Inserts a campaign on behalf of the administrative producer.
    async fn insert_campaign(&self, campaign: &NewCampaign) -> Result<CampaignId, StoreError>;

    /// Adds or refreshes a member of the recipient population.
    async fn register_recipient(
        &self,
        telegram_id: RecipientId,
        username: Option<&str>,
        registered_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Blocked recipients are excluded from audience resolution.
    async fn set_recipient_blocked(
        &self,
        telegram_id: RecipientId,
        blocked: bool,
    ) -> Result<(), StoreError>;

    async fn find_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError>;

    /// Most recently created campaigns first.
    async fn recent_campaigns(&self, limit: i64) -> Result<Vec<Campaign>, StoreError>;

    /// Ids of campaigns in `pending` or `processing`, oldest first.
    async fn dispatchable_campaign_ids(&self) -> Result<Vec<CampaignId>, StoreError>;

    /// Applies `transition` if the campaign is still in `transition.from()`.
    /// Returns whether the row changed.
    async fn apply_transition(
        &self,
        id: CampaignId,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Moves every `scheduled` campaign due at `now` to `pending` in one
    /// conditional update and returns the promoted ids.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<CampaignId>, StoreError>;

    /// Writes the progress counters of a processing campaign.
    async fn record_progress(&self, id: CampaignId, progress: &Progress) -> Result<(), StoreError>;

    /// Applies a settling transition together with the final counters.
    async fn finish(
        &self,
        id: CampaignId,
        transition: Transition,
        progress: &Progress,
        error_class: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Telegram ids of the non-blocked users matching `filter`, ascending.
    async fn resolve_audience(&self, filter: &AudienceFilter)
        -> Result<Vec<RecipientId>, StoreError>;

    /// Outcome ledger of one campaign, ordered by recipient id.
    async fn outcomes(&self, id: CampaignId) -> Result<Vec<RecipientOutcome>, StoreError>;

    /// Inserts or replaces the outcome of one recipient.
    async fn record_outcome(&self, outcome: &RecipientOutcome) -> Result<(), StoreError>;

    /// Deliveries recorded since `since`, for one campaign or across all.
    async fn delivered_since(
        &self,
        campaign: Option<CampaignId>,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError>;
}
