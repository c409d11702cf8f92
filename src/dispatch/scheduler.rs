use chrono::{DateTime, Utc};
use tracing::info;

use crate::context::DispatchContext;
use crate::database::models::CampaignId;
use crate::database::store::StoreError;
use crate::dispatch::intake::{TriggerSource, WorkItem};

/// Releases every scheduled campaign due at `now` and offers it for
/// dispatch. Promotion is one conditional update, so concurrent ticks never
/// promote the same campaign twice.
pub async fn promote_due(
    ctx: &DispatchContext,
    now: DateTime<Utc>,
) -> Result<Vec<CampaignId>, StoreError> {
    let promoted = ctx.store.promote_due(now).await?;

    for id in &promoted {
        info!("Scheduled campaign {} is due, promoted to pending", id);
        ctx.intake.offer(WorkItem::new(*id, TriggerSource::Schedule));
    }

    Ok(promoted)
}
