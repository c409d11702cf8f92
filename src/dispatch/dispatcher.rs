//! Turns work items into dispatch runs.
//!
//! For each item the dispatcher takes the campaign's lock, re-reads the
//! campaign under it, claims it with the `pending -> processing`
//! compare-and-set (or resumes an interrupted `processing` run), freezes the
//! recipient list and hands it to the [`BatchSender`]. Anything else it finds
//! is left alone.

use chrono::Utc;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::context::DispatchContext;
use crate::database::models::{tally, Campaign, CampaignId, Progress, RecipientId, RecipientOutcome, Target};
use crate::database::store::StoreError;
use crate::dispatch::intake::{TriggerSource, WorkItem};
use crate::dispatch::lock::{Acquisition, LockToken};
use crate::dispatch::sender::{BatchSender, StopReason};
use crate::dispatch::state::{settle, CampaignStatus, Transition};
use crate::utils::logging::{
    log_dispatch_done, log_dispatch_failed, log_dispatch_interrupted, log_dispatch_start,
    log_lock_contended,
};
use crate::utils::validation::validate_payload;

/// Campaign-level failure of a run. Each variant has a stable
/// [`class`](DispatchError::class) stored as the campaign's `error_class`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("cannot resolve recipients: {0}")]
    Resolution(String),
}

impl DispatchError {
    /// Short machine-readable name of the failure.
    pub fn class(&self) -> &'static str {
        match self {
            DispatchError::Store(e) => e.class(),
            DispatchError::InvalidPayload(_) => "invalid_payload",
            DispatchError::Resolution(_) => "resolution_failed",
        }
    }

    /// The store itself is unreachable; the run is left for a later resume
    /// instead of being settled.
    fn is_store_outage(&self) -> bool {
        matches!(self, DispatchError::Store(StoreError::Database(_)))
    }
}

/// Result of one dispatch run that reached the sender or failed trying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub campaign_id: CampaignId,
    /// The campaign was already `processing` when the run started.
    pub resumed: bool,
    /// Status the campaign was left in.
    pub status: CampaignStatus,
    pub progress: Progress,
    /// Why the run ended early; the campaign is then still `processing`.
    pub stop: Option<StopReason>,
    /// Set when the run settled the campaign as `failed`.
    pub error_class: Option<String>,
}

/// What happened to one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consideration {
    Dispatched(RunReport),
    /// Another holder owns the campaign's lock.
    Contended,
    NotFound,
    /// The campaign was in a status this consideration cannot act on.
    Stale(CampaignStatus),
}

/// Consumer of the intake queue.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<DispatchContext>) -> Self {
        Self { ctx }
    }

    /// Consumes work items until shutdown, running up to
    /// `max_concurrent_dispatches` campaigns at once.
    pub async fn run(self, mut work: mpsc::Receiver<WorkItem>) {
        let permits = Arc::new(Semaphore::new(self.ctx.settings.max_concurrent_dispatches.max(1)));
        let mut running = JoinSet::new();
        let shutdown = self.ctx.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!("Dispatch task failed: {}", e);
                    }
                }
                item = work.recv() => {
                    let Some(item) = item else { break };
                    let permit = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let dispatcher = self.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        dispatcher.handle(item).await;
                    });
                }
            }
        }

        debug!("Dispatcher stopping, waiting for {} running campaigns", running.len());
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!("Dispatch task failed: {}", e);
            }
        }
    }

    async fn handle(&self, item: WorkItem) {
        match self.consider(item).await {
            Ok(Consideration::Dispatched(report)) => debug!(
                "Campaign {} left {} after {} trigger",
                report.campaign_id, report.status, item.source
            ),
            Ok(other) => debug!(
                "Campaign {} not dispatched ({:?}) after {} trigger",
                item.campaign_id, other, item.source
            ),
            Err(e) => log_dispatch_failed(item.campaign_id, e.class(), &e.to_string()),
        }
    }

    /// Acts on one "consider campaign X" request.
    pub async fn consider(&self, item: WorkItem) -> Result<Consideration, DispatchError> {
        let campaign_id = item.campaign_id;
        let mut lock = match self.ctx.locks.try_acquire(campaign_id).await? {
            Acquisition::Acquired(lock) => lock,
            Acquisition::HeldElsewhere => {
                log_lock_contended(campaign_id, &item.source.to_string());
                self.retry_later(item);
                return Ok(Consideration::Contended);
            }
        };

        let result = match AssertUnwindSafe(self.consider_locked(campaign_id, &mut lock))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                // Settled while the lock is still held.
                log_dispatch_failed(campaign_id, "panic", "dispatch run panicked");
                self.fail(campaign_id, false, "panic", 0)
                    .await
                    .map(Consideration::Dispatched)
                    .map_err(DispatchError::from)
            }
        };

        let locked_id = lock.campaign_id();
        if let Err(e) = lock.release().await {
            warn!("Failed to release lock for campaign {}: {}", locked_id, e);
        }
        result
    }

    async fn consider_locked(
        &self,
        campaign_id: CampaignId,
        lock: &mut LockToken,
    ) -> Result<Consideration, DispatchError> {
        let store = self.ctx.store.as_ref();
        let Some(campaign) = store.find_campaign(campaign_id).await? else {
            return Ok(Consideration::NotFound);
        };

        if !campaign.status.is_dispatchable() {
            return Ok(Consideration::Stale(campaign.status));
        }
        let resumed = campaign.status == CampaignStatus::Processing;
        if !resumed && !store.apply_transition(campaign_id, Transition::begin(), Utc::now()).await? {
            return Ok(Consideration::Stale(campaign.status));
        }

        match self.dispatch(&campaign, resumed, lock).await {
            Ok(report) => Ok(Consideration::Dispatched(report)),
            Err(e) if e.is_store_outage() => Err(e),
            Err(e) => {
                log_dispatch_failed(campaign_id, e.class(), &e.to_string());
                let report = self
                    .fail(campaign_id, resumed, e.class(), campaign.progress.total)
                    .await?;
                Ok(Consideration::Dispatched(report))
            }
        }
    }

    async fn dispatch(
        &self,
        campaign: &Campaign,
        resumed: bool,
        lock: &mut LockToken,
    ) -> Result<RunReport, DispatchError> {
        let store = self.ctx.store.as_ref();
        validate_payload(&campaign.payload)
            .map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;

        let previous = store.outcomes(campaign.id).await?;
        let recipients = self.freeze_recipients(campaign, &previous).await?;
        log_dispatch_start(campaign.id, campaign.kind.as_str(), recipients.len(), resumed);

        let opening = tally(recipients.len(), previous.iter().map(|o| &o.outcome));
        store.record_progress(campaign.id, &opening).await?;

        let settings = &self.ctx.settings;
        let sender = BatchSender::new(
            store,
            self.ctx.delivery.as_ref(),
            &settings.send,
            &settings.quota,
            &self.ctx.shutdown,
        );
        let sent = sender.deliver(campaign, &recipients, &previous, lock).await?;
        debug!("Campaign {} attempted {} recipients this run", campaign.id, sent.attempted);

        if let Some(stop) = sent.stop {
            log_dispatch_interrupted(campaign.id, &stop.to_string(), &sent.progress);
            return Ok(RunReport {
                campaign_id: campaign.id,
                resumed,
                status: CampaignStatus::Processing,
                progress: sent.progress,
                stop: Some(stop),
                error_class: None,
            });
        }

        let status = settle(&sent.progress);
        let transition = Transition::settle(status).map_err(StoreError::from)?;
        if !store
            .finish(campaign.id, transition, &sent.progress, None, Utc::now())
            .await?
        {
            warn!("Campaign {} left processing before it could settle", campaign.id);
        }
        log_dispatch_done(campaign.id, status.as_str(), &sent.progress);

        Ok(RunReport {
            campaign_id: campaign.id,
            resumed,
            status,
            progress: sent.progress,
            stop: None,
            error_class: None,
        })
    }

    /// The recipient list for this run: the resolved target plus anyone who
    /// already has an outcome from an earlier run, ascending by id.
    async fn freeze_recipients(
        &self,
        campaign: &Campaign,
        previous: &[RecipientOutcome],
    ) -> Result<Vec<RecipientId>, DispatchError> {
        let mut recipients: BTreeSet<RecipientId> = match (&campaign.target, campaign.kind.is_broadcast()) {
            (Target::User(id), false) => BTreeSet::from([*id]),
            (Target::Audience(filter), true) => self
                .ctx
                .store
                .resolve_audience(filter)
                .await?
                .into_iter()
                .collect(),
            _ => {
                return Err(DispatchError::Resolution(format!(
                    "{} campaign has a mismatched target",
                    campaign.kind
                )))
            }
        };
        recipients.extend(previous.iter().map(|o| o.recipient_id));
        Ok(recipients.into_iter().collect())
    }

    /// Settles a run that hit a campaign-level error as `failed`, keeping
    /// whatever the outcome ledger already holds.
    async fn fail(
        &self,
        campaign_id: CampaignId,
        resumed: bool,
        error_class: &str,
        known_total: i64,
    ) -> Result<RunReport, StoreError> {
        let store = self.ctx.store.as_ref();
        let outcomes = store.outcomes(campaign_id).await?;
        let total = outcomes.len().max(known_total.max(0) as usize);
        let progress = tally(total, outcomes.iter().map(|o| &o.outcome));

        let transition = Transition::settle(CampaignStatus::Failed)?;
        let applied = store
            .finish(campaign_id, transition, &progress, Some(error_class), Utc::now())
            .await?;

        let status = if applied {
            CampaignStatus::Failed
        } else {
            store
                .find_campaign(campaign_id)
                .await?
                .map_or(CampaignStatus::Failed, |c| c.status)
        };

        Ok(RunReport {
            campaign_id,
            resumed,
            status,
            progress,
            stop: None,
            error_class: Some(error_class.to_string()),
        })
    }

    /// Re-offers a contended item once, when configured to.
    fn retry_later(&self, item: WorkItem) {
        let Some(delay) = self.ctx.settings.lock_retry_after else {
            return;
        };
        if item.source == TriggerSource::Retry {
            return;
        }

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay.max(Duration::from_millis(1))) => {
                    ctx.intake.offer(WorkItem::new(item.campaign_id, TriggerSource::Retry));
                }
            }
        });
    }
}
