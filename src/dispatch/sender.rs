//! Batched delivery of one campaign to its frozen recipient list.

use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::database::models::{
    tally, Campaign, CampaignId, Outcome, Payload, Progress, RecipientId, RecipientOutcome,
};
use crate::database::store::{CampaignStore, StoreError};
use crate::dispatch::lock::LockToken;
use crate::dispatch::quota::SendQuota;
use crate::services::delivery::DeliveryClient;
use crate::utils::backoff::Backoff;
use crate::utils::logging::log_delivery_error;
use crate::utils::validation::validate_recipient_id;

/// Pacing and retry knobs for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSettings {
    /// Recipients per batch; progress is persisted after each one.
    pub batch_size: usize,
    /// Pause between two sends inside a batch.
    pub message_delay: Duration,
    /// Pause between two batches.
    pub batch_pause: Duration,
    /// Attempts per recipient, first try included.
    pub max_attempts: u32,
    /// First retry delay, doubled per attempt.
    pub retry_base: Duration,
    /// Cap on backoff delays. A server's retry-after hint is honoured as is.
    pub retry_max: Duration,
}

impl Default for SendSettings {
    fn default() -> Self {
        Self {
            batch_size: 25,
            message_delay: Duration::from_millis(50),
            batch_pause: Duration::from_millis(50 * 25),
            max_attempts: 3,
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
        }
    }
}

/// Why a run ended before every recipient reached an outcome. The campaign
/// stays `processing` and is resumed by a later consideration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    /// The lock could not be renewed; another holder may own the campaign.
    LockLost,
    QuotaExhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::Shutdown => "shutdown",
            StopReason::LockLost => "lock_lost",
            StopReason::QuotaExhausted => "quota_exhausted",
        })
    }
}

/// What a [`BatchSender::deliver`] call achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Counters over the whole frozen recipient list.
    pub progress: Progress,
    /// Recipients this run tried to deliver to.
    pub attempted: usize,
    /// Set when the run ended early.
    pub stop: Option<StopReason>,
}

/// Where one recipient ended up after [`BatchSender::deliver_one`].
struct Settled {
    outcome: Outcome,
    /// Cumulative across runs.
    attempts: i64,
    /// Set when the run has to stop before the recipient settled.
    stop: Option<StopReason>,
}

impl Settled {
    fn new(outcome: Outcome, attempts: i64) -> Self {
        Self {
            outcome,
            attempts,
            stop: None,
        }
    }
}

/// Delivers one campaign; borrows everything from the dispatch context.
pub struct BatchSender<'a> {
    store: &'a dyn CampaignStore,
    delivery: &'a dyn DeliveryClient,
    settings: &'a SendSettings,
    quota: &'a SendQuota,
    shutdown: &'a CancellationToken,
}

impl<'a> BatchSender<'a> {
    pub fn new(
        store: &'a dyn CampaignStore,
        delivery: &'a dyn DeliveryClient,
        settings: &'a SendSettings,
        quota: &'a SendQuota,
        shutdown: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            delivery,
            settings,
            quota,
            shutdown,
        }
    }

    /// Sends to every recipient without a terminal outcome in `previous`,
    /// recording each outcome before moving on and the counters after each
    /// batch.
    pub async fn deliver(
        &self,
        campaign: &Campaign,
        recipients: &[RecipientId],
        previous: &[RecipientOutcome],
        lock: &mut LockToken,
    ) -> Result<SendReport, StoreError> {
        let mut ledger: HashMap<RecipientId, (Outcome, i64)> = previous
            .iter()
            .map(|o| (o.recipient_id, (o.outcome, o.attempt_count)))
            .collect();

        let remaining: Vec<RecipientId> = recipients
            .iter()
            .copied()
            .filter(|id| !ledger.get(id).is_some_and(|(outcome, _)| outcome.is_terminal()))
            .collect();

        let mut attempted = 0;
        let mut stop = None;

        'batches: for (index, batch) in remaining.chunks(self.settings.batch_size.max(1)).enumerate() {
            if index > 0 && self.pause(self.settings.batch_pause).await {
                stop = Some(StopReason::Shutdown);
                break;
            }

            let mut batch = batch;
            if let Some(allowed) = self.quota.allowance(self.store, campaign.id, Utc::now()).await? {
                if allowed == 0 {
                    stop = Some(StopReason::QuotaExhausted);
                    break;
                }
                if allowed < batch.len() {
                    batch = &batch[..allowed];
                    stop = Some(StopReason::QuotaExhausted);
                }
            }

            for (position, &recipient) in batch.iter().enumerate() {
                if self.shutdown.is_cancelled()
                    || (position > 0 && self.pause(self.settings.message_delay).await)
                {
                    stop = Some(StopReason::Shutdown);
                    break 'batches;
                }
                if !lock.keep_alive().await? {
                    stop = Some(StopReason::LockLost);
                    break 'batches;
                }

                let prior_attempts = ledger.get(&recipient).map_or(0, |(_, attempts)| *attempts);
                let settled = self
                    .deliver_one(campaign.id, recipient, &campaign.payload, prior_attempts, lock)
                    .await?;
                ledger.insert(recipient, (settled.outcome, settled.attempts));
                attempted += 1;

                if settled.stop.is_some() {
                    stop = settled.stop;
                    break;
                }
            }

            let progress = self.progress(recipients, &ledger);
            self.store.record_progress(campaign.id, &progress).await?;

            if stop.is_some() {
                break;
            }
        }

        let progress = self.progress(recipients, &ledger);
        if stop.is_some() {
            self.store.record_progress(campaign.id, &progress).await?;
        }

        Ok(SendReport {
            progress,
            attempted,
            stop,
        })
    }

    fn progress(&self, recipients: &[RecipientId], ledger: &HashMap<RecipientId, (Outcome, i64)>) -> Progress {
        tally(
            recipients.len(),
            recipients.iter().filter_map(|id| ledger.get(id).map(|(outcome, _)| outcome)),
        )
    }

    /// Delivers to one recipient, retrying transient failures with backoff.
    async fn deliver_one(
        &self,
        campaign_id: CampaignId,
        recipient: RecipientId,
        payload: &Payload,
        prior_attempts: i64,
        lock: &mut LockToken,
    ) -> Result<Settled, StoreError> {
        if let Err(e) = validate_recipient_id(recipient) {
            log_delivery_error(campaign_id, recipient, 0, "invalid_recipient", &e.to_string());
            self.record(campaign_id, recipient, Outcome::SkippedPermanent, prior_attempts, Some("invalid_recipient"))
                .await?;
            return Ok(Settled::new(Outcome::SkippedPermanent, prior_attempts));
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let attempts = prior_attempts + i64::from(attempt);

            let error = match self.delivery.send(recipient, payload).await {
                Ok(()) => {
                    self.record(campaign_id, recipient, Outcome::Delivered, attempts, None)
                        .await?;
                    return Ok(Settled::new(Outcome::Delivered, attempts));
                }
                Err(error) => error,
            };

            log_delivery_error(campaign_id, recipient, attempt, error.class(), &error.to_string());

            let outcome = if error.is_permanent() {
                Outcome::SkippedPermanent
            } else if attempt >= self.settings.max_attempts {
                Outcome::FailedFinal
            } else {
                Outcome::Retrying
            };
            self.record(campaign_id, recipient, outcome, attempts, Some(error.class()))
                .await?;

            if outcome != Outcome::Retrying {
                return Ok(Settled::new(outcome, attempts));
            }

            let delay = match error.retry_after() {
                Some(hint) => hint,
                None => Backoff::delay_for_attempt(
                    self.settings.retry_base,
                    self.settings.retry_max,
                    attempt,
                ),
            };
            // Left `retrying` on either stop; the resumed run picks it up again.
            let stop = if self.pause(delay).await {
                Some(StopReason::Shutdown)
            } else if !lock.keep_alive().await? {
                Some(StopReason::LockLost)
            } else {
                None
            };
            if stop.is_some() {
                return Ok(Settled {
                    outcome,
                    attempts,
                    stop,
                });
            }
        }
    }

    async fn record(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        outcome: Outcome,
        attempt_count: i64,
        error_class: Option<&str>,
    ) -> Result<(), StoreError> {
        self.store
            .record_outcome(&RecipientOutcome {
                campaign_id,
                recipient_id,
                outcome,
                attempt_count,
                last_error_class: error_class.map(str::to_string),
                updated_at: Utc::now(),
            })
            .await
    }

    /// Sleeps for `duration`; returns true if shutdown interrupted the wait.
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.shutdown.is_cancelled();
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
