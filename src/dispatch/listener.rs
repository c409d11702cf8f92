use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::database::models::CampaignId;
use crate::dispatch::feed::ChangeFeed;
use crate::dispatch::intake::{Intake, TriggerSource, WorkItem};
use crate::utils::backoff::Backoff;
use crate::utils::logging::log_listener_event;

/// Keeps a subscription to the notification channel alive and turns each
/// payload into a work item. Anything lost while disconnected is picked up
/// by the poller.
pub struct Listener {
    feed: Box<dyn ChangeFeed>,
    channel: String,
    intake: Intake,
    backoff: Backoff,
    shutdown: CancellationToken,
}

impl Listener {
    pub fn new(
        feed: Box<dyn ChangeFeed>,
        channel: impl Into<String>,
        intake: Intake,
        backoff: Backoff,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            feed,
            channel: channel.into(),
            intake,
            backoff,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        log_listener_event("starting", Some(&self.channel));

        while self.subscribe().await {
            self.receive().await;
            if self.shutdown.is_cancelled() {
                break;
            }
        }

        log_listener_event("stopped", Some(&self.channel));
    }

    /// Retries until subscribed; false on shutdown.
    async fn subscribe(&mut self) -> bool {
        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                result = self.feed.subscribe(&self.channel) => result,
            };

            match result {
                Ok(()) => {
                    self.backoff.reset();
                    log_listener_event("subscribed", Some(&self.channel));
                    return true;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        "LISTENER: subscribing to {} failed: {}, retrying in {}ms",
                        self.channel,
                        e,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Forwards payloads until the subscription drops or shutdown.
    async fn receive(&mut self) {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                received = self.feed.recv() => received,
            };

            match received {
                Ok(payload) => {
                    self.forward(&payload);
                }
                Err(e) if e.is_disconnect() => {
                    warn!("LISTENER: connection to {} lost: {}", self.channel, e);
                    return;
                }
                Err(e) => {
                    warn!("LISTENER: {}, poller will catch up", e);
                }
            }
        }
    }

    fn forward(&self, payload: &str) -> bool {
        match payload.trim().parse::<CampaignId>() {
            Ok(id) => self.intake.offer(WorkItem::new(id, TriggerSource::Notification)),
            Err(_) => {
                warn!("LISTENER: ignoring malformed payload '{}'", payload);
                false
            }
        }
    }
}
