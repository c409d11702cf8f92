use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use super::campaign::{CampaignId, Progress, RecipientId};
use crate::database::store::StoreError;

/// Delivery state of one recipient within one campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Delivered,
    /// The platform refused the recipient for good (blocked, deactivated,
    /// unknown chat). Counted as skipped, never as failed.
    SkippedPermanent,
    /// A transient failure with attempts left, or a run that stopped mid-retry.
    Retrying,
    /// Transient failures until attempts ran out. Retried by a resumed run.
    FailedFinal,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Delivered => "delivered",
            Outcome::SkippedPermanent => "skipped_permanent",
            Outcome::Retrying => "retrying",
            Outcome::FailedFinal => "failed_final",
        }
    }

    /// Terminal outcomes are never attempted again, not even by a resumed run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Outcome::Delivered | Outcome::SkippedPermanent)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(Outcome::Delivered),
            "skipped_permanent" => Ok(Outcome::SkippedPermanent),
            "retrying" => Ok(Outcome::Retrying),
            "failed_final" => Ok(Outcome::FailedFinal),
            other => Err(format!("unknown recipient outcome '{other}'")),
        }
    }
}

/// One row of the outcome ledger, keyed by campaign and recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientOutcome {
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub outcome: Outcome,
    pub attempt_count: i64,
    pub last_error_class: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub const OUTCOME_COLUMNS: &str =
    "campaign_id, recipient_id, outcome, attempt_count, last_error_class, updated_at";

#[derive(Debug, Clone, FromRow)]
pub struct OutcomeRow {
    pub campaign_id: i64,
    pub recipient_id: i64,
    pub outcome: String,
    pub attempt_count: i64,
    pub last_error_class: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<OutcomeRow> for RecipientOutcome {
    type Error = StoreError;

    fn try_from(row: OutcomeRow) -> Result<Self, Self::Error> {
        let outcome = row.outcome.parse().map_err(|reason| StoreError::Corrupt {
            campaign_id: row.campaign_id,
            field: "recipient_outcomes.outcome",
            reason,
        })?;

        Ok(RecipientOutcome {
            campaign_id: row.campaign_id,
            recipient_id: row.recipient_id,
            outcome,
            attempt_count: row.attempt_count,
            last_error_class: row.last_error_class,
            updated_at: row.updated_at,
        })
    }
}

/// Counts outcomes into campaign counters. `retrying` recipients are still in
/// flight and count towards none of the settled buckets.
pub fn tally<'a>(total: usize, outcomes: impl IntoIterator<Item = &'a Outcome>) -> Progress {
    outcomes
        .into_iter()
        .fold(Progress::with_total(total), |mut progress, outcome| {
            match outcome {
                Outcome::Delivered => progress.sent += 1,
                Outcome::SkippedPermanent => progress.skipped += 1,
                Outcome::FailedFinal => progress.failed += 1,
                Outcome::Retrying => {}
            }
            progress
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_delivered_and_skipped_are_terminal() {
        assert!(Outcome::Delivered.is_terminal());
        assert!(Outcome::SkippedPermanent.is_terminal());
        assert!(!Outcome::Retrying.is_terminal());
        assert!(!Outcome::FailedFinal.is_terminal());
    }

    #[test]
    fn tally_counts_each_bucket() {
        let outcomes = [
            Outcome::Delivered,
            Outcome::Delivered,
            Outcome::SkippedPermanent,
            Outcome::FailedFinal,
            Outcome::Retrying,
        ];
        let progress = tally(6, &outcomes);
        assert_eq!(progress, Progress { total: 6, sent: 2, failed: 1, skipped: 1 });
        assert!(progress.is_consistent());
    }
}
