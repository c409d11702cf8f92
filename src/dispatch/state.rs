//! Campaign status model and the guarded transitions between statuses.
//!
//! Statuses are totally ordered. A [`Transition`] can only be built for an
//! edge that moves forward along that order, so every write to a campaign's
//! status goes through a value that has already been checked.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::database::models::Progress;

/// Lifecycle status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Created but not yet released by an administrator.
    Draft,
    /// Waiting for `scheduled_at` to pass.
    Scheduled,
    /// Eligible for dispatch.
    Pending,
    /// A dispatch run owns the campaign.
    Processing,
    /// Every recipient was delivered or permanently skipped.
    Completed,
    /// Nothing was delivered, or the run hit a campaign-level error.
    Failed,
    /// Some recipients exhausted their retries.
    PartiallyCompleted,
}

impl CampaignStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [CampaignStatus; 7] = [
        CampaignStatus::Draft,
        CampaignStatus::Scheduled,
        CampaignStatus::Pending,
        CampaignStatus::Processing,
        CampaignStatus::Completed,
        CampaignStatus::Failed,
        CampaignStatus::PartiallyCompleted,
    ];

    /// Column value stored in the `campaigns.status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Pending => "pending",
            CampaignStatus::Processing => "processing",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
            CampaignStatus::PartiallyCompleted => "partially_completed",
        }
    }

    /// Position in the lifecycle. Terminal statuses share the last rank.
    pub fn rank(self) -> u8 {
        match self {
            CampaignStatus::Draft => 0,
            CampaignStatus::Scheduled => 1,
            CampaignStatus::Pending => 2,
            CampaignStatus::Processing => 3,
            CampaignStatus::Completed
            | CampaignStatus::Failed
            | CampaignStatus::PartiallyCompleted => 4,
        }
    }

    /// Whether the campaign has reached a final status.
    pub fn is_terminal(self) -> bool {
        self.rank() == 4
    }

    /// Whether a dispatch attempt may act on a campaign in this status.
    ///
    /// `Processing` is included: a campaign found processing while its lock
    /// is free belongs to an interrupted run and is resumed.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, CampaignStatus::Pending | CampaignStatus::Processing)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Pending)
                | (Scheduled, Pending)
                | (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, PartiallyCompleted)
        )
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stored status string is not one of [`CampaignStatus::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown campaign status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for CampaignStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CampaignStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Attempted to build a transition that would move a campaign backwards or
/// skip a guarded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal campaign transition {from} -> {to}")]
pub struct IllegalTransition {
    /// Current status.
    pub from: CampaignStatus,
    /// Requested status.
    pub to: CampaignStatus,
}

/// A checked edge of the campaign state machine, applied by the store as a
/// compare-and-set on the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    from: CampaignStatus,
    to: CampaignStatus,
}

impl Transition {
    /// Builds a transition, rejecting edges the state machine forbids.
    pub fn new(from: CampaignStatus, to: CampaignStatus) -> Result<Self, IllegalTransition> {
        if from.can_transition_to(to) {
            Ok(Self { from, to })
        } else {
            Err(IllegalTransition { from, to })
        }
    }

    /// `draft -> pending`: an administrator releases a campaign for sending.
    pub fn publish() -> Self {
        Self { from: CampaignStatus::Draft, to: CampaignStatus::Pending }
    }

    /// `draft -> scheduled`.
    pub fn schedule() -> Self {
        Self { from: CampaignStatus::Draft, to: CampaignStatus::Scheduled }
    }

    /// `scheduled -> pending`, performed by the time-based scheduler.
    pub fn promote() -> Self {
        Self { from: CampaignStatus::Scheduled, to: CampaignStatus::Pending }
    }

    /// `pending -> processing`, only ever applied while holding the lock.
    pub fn begin() -> Self {
        Self { from: CampaignStatus::Pending, to: CampaignStatus::Processing }
    }

    /// `processing -> <terminal>` for the given final status.
    pub fn settle(to: CampaignStatus) -> Result<Self, IllegalTransition> {
        Self::new(CampaignStatus::Processing, to)
    }

    /// Expected current status.
    pub fn from(&self) -> CampaignStatus {
        self.from
    }

    /// Status written when the compare-and-set succeeds.
    pub fn to(&self) -> CampaignStatus {
        self.to
    }
}

/// Final status for a finished run, derived from its recipient counters.
///
/// Skipped recipients never count as failures: a run with no `failed_final`
/// recipient completes. It fails only when every recipient ended
/// `failed_final`.
pub fn settle(progress: &Progress) -> CampaignStatus {
    if progress.failed == 0 {
        CampaignStatus::Completed
    } else if progress.sent == 0 && progress.failed == progress.total {
        CampaignStatus::Failed
    } else {
        CampaignStatus::PartiallyCompleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_column_value() {
        for status in CampaignStatus::ALL {
            assert_eq!(status.as_str().parse::<CampaignStatus>(), Ok(status));
        }
        assert!("archived".parse::<CampaignStatus>().is_err());
    }

    #[test]
    fn transitions_never_move_backwards() {
        for from in CampaignStatus::ALL {
            for to in CampaignStatus::ALL {
                if let Ok(transition) = Transition::new(from, to) {
                    assert!(transition.to().rank() > transition.from().rank());
                }
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_successor() {
        for from in CampaignStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in CampaignStatus::ALL {
                assert!(Transition::new(from, to).is_err(), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn processing_requires_pending() {
        assert!(Transition::new(CampaignStatus::Scheduled, CampaignStatus::Processing).is_err());
        assert!(Transition::new(CampaignStatus::Draft, CampaignStatus::Processing).is_err());
        assert_eq!(
            Transition::new(CampaignStatus::Pending, CampaignStatus::Processing),
            Ok(Transition::begin())
        );
    }

    #[test]
    fn settle_only_accepts_terminal_targets() {
        assert!(Transition::settle(CampaignStatus::Completed).is_ok());
        assert!(Transition::settle(CampaignStatus::PartiallyCompleted).is_ok());
        let err = Transition::settle(CampaignStatus::Pending).unwrap_err();
        assert_eq!(err.to_string(), "illegal campaign transition processing -> pending");
    }

    #[test]
    fn settlement_rules() {
        let progress = |total, sent, failed, skipped| Progress { total, sent, failed, skipped };

        assert_eq!(settle(&progress(3, 2, 0, 1)), CampaignStatus::Completed);
        assert_eq!(settle(&progress(4, 3, 1, 0)), CampaignStatus::PartiallyCompleted);
        assert_eq!(settle(&progress(2, 0, 2, 0)), CampaignStatus::Failed);
        // Skips alone never fail a run, even when nothing was delivered.
        assert_eq!(settle(&progress(1, 0, 0, 1)), CampaignStatus::Completed);
        assert_eq!(settle(&progress(3, 0, 1, 2)), CampaignStatus::PartiallyCompleted);
        assert_eq!(settle(&progress(0, 0, 0, 0)), CampaignStatus::Completed);
    }
}
