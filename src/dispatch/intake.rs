use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::database::models::CampaignId;

/// Which component asked for a campaign to be considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Notification,
    Poll,
    Schedule,
    Retry,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerSource::Notification => "notification",
            TriggerSource::Poll => "poll",
            TriggerSource::Schedule => "schedule",
            TriggerSource::Retry => "retry",
        })
    }
}

/// "Consider campaign X".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub campaign_id: CampaignId,
    pub source: TriggerSource,
}

impl WorkItem {
    pub fn new(campaign_id: CampaignId, source: TriggerSource) -> Self {
        Self { campaign_id, source }
    }
}

/// Producer half of the dispatcher's work queue. Offering never waits: an
/// item that does not fit is dropped, and the next poll rediscovers it.
#[derive(Clone, Debug)]
pub struct Intake {
    sender: mpsc::Sender<WorkItem>,
}

impl Intake {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WorkItem>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn offer(&self, item: WorkItem) -> bool {
        match self.sender.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(item)) => {
                warn!(
                    "Dispatch intake full, dropping {} trigger for campaign {}",
                    item.source, item.campaign_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                debug!("Dispatch intake closed, ignoring campaign {}", item.campaign_id);
                false
            }
        }
    }
}
