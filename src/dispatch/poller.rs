use chrono::Utc;
use tracing::debug;

use crate::context::DispatchContext;
use crate::database::store::StoreError;
use crate::dispatch::intake::{TriggerSource, WorkItem};
use crate::dispatch::scheduler;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub promoted: usize,
    pub offered: usize,
}

/// One fallback sweep: promotes due campaigns, then re-offers every
/// `pending` or `processing` campaign regardless of whether a notification
/// was seen for it.
pub async fn poll_once(ctx: &DispatchContext) -> Result<PollReport, StoreError> {
    let promoted = scheduler::promote_due(ctx, Utc::now()).await?;

    let offered = ctx
        .store
        .dispatchable_campaign_ids()
        .await?
        .into_iter()
        .filter(|id| !promoted.contains(id))
        .filter(|id| ctx.intake.offer(WorkItem::new(*id, TriggerSource::Poll)))
        .count();

    if promoted.len() + offered > 0 {
        debug!("Poll promoted {} and offered {} campaigns", promoted.len(), offered);
    }

    Ok(PollReport {
        promoted: promoted.len(),
        offered,
    })
}
