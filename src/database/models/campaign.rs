use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::database::store::StoreError;
use crate::dispatch::state::CampaignStatus;

/// Primary key of a campaign row.
pub type CampaignId = i64;
/// Telegram chat id of a recipient.
pub type RecipientId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignKind {
    SingleMessage,
    Broadcast,
    ScheduledBroadcast,
}

impl CampaignKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CampaignKind::SingleMessage => "single_message",
            CampaignKind::Broadcast => "broadcast",
            CampaignKind::ScheduledBroadcast => "scheduled_broadcast",
        }
    }

    pub fn is_broadcast(self) -> bool {
        !matches!(self, CampaignKind::SingleMessage)
    }
}

impl fmt::Display for CampaignKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_message" => Ok(CampaignKind::SingleMessage),
            "broadcast" => Ok(CampaignKind::Broadcast),
            "scheduled_broadcast" => Ok(CampaignKind::ScheduledBroadcast),
            other => Err(format!("unknown campaign kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    Html,
    MarkdownV2,
}

/// Message content. Text alone, or a photo (Telegram file id or local path)
/// with the text used as its caption.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<ParseMode>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn photo(file_id: impl Into<String>, caption: Option<String>) -> Self {
        Self {
            text: caption,
            photo: Some(file_id.into()),
            ..Self::default()
        }
    }

    pub fn has_media(&self) -> bool {
        self.photo.is_some() || self.photo_path.is_some()
    }
}

/// Population filter evaluated against non-blocked users when a broadcast
/// enters processing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_before: Option<DateTime<Utc>>,
}

impl AudienceFilter {
    pub fn everyone() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    User(RecipientId),
    Audience(AudienceFilter),
}

/// Recipient counters persisted on the campaign row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: i64,
    pub sent: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl Progress {
    pub fn with_total(total: usize) -> Self {
        Self {
            total: total as i64,
            ..Self::default()
        }
    }

    /// Recipients that reached a final outcome.
    pub fn settled(&self) -> i64 {
        self.sent + self.failed + self.skipped
    }

    pub fn is_consistent(&self) -> bool {
        self.sent >= 0 && self.failed >= 0 && self.skipped >= 0 && self.settled() <= self.total
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub kind: CampaignKind,
    pub payload: Payload,
    pub target: Target,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Progress,
    pub error_class: Option<String>,
}

/// Column list shared by every campaign query, in [`CampaignRow`] order.
pub const CAMPAIGN_COLUMNS: &str = "id, kind, payload, target, status, scheduled_at, created_at, \
     started_at, completed_at, recipients_total, recipients_sent, recipients_failed, \
     recipients_skipped, error_class";

/// Raw `campaigns` row as stored by either backend.
#[derive(Debug, Clone, FromRow)]
pub struct CampaignRow {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub target: String,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub recipients_total: i64,
    pub recipients_sent: i64,
    pub recipients_failed: i64,
    pub recipients_skipped: i64,
    pub error_class: Option<String>,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = StoreError;

    fn try_from(row: CampaignRow) -> Result<Self, Self::Error> {
        let campaign_id = row.id;
        let corrupt = |field: &'static str, reason: String| StoreError::Corrupt {
            campaign_id,
            field,
            reason,
        };

        let kind = row.kind.parse::<CampaignKind>().map_err(|e| corrupt("kind", e))?;
        let status = row
            .status
            .parse::<CampaignStatus>()
            .map_err(|e| corrupt("status", e.to_string()))?;
        let payload = serde_json::from_str(&row.payload)
            .map_err(|e| corrupt("payload", e.to_string()))?;
        let target = serde_json::from_str(&row.target)
            .map_err(|e| corrupt("target", e.to_string()))?;

        Ok(Campaign {
            id: row.id,
            kind,
            payload,
            target,
            status,
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            progress: Progress {
                total: row.recipients_total,
                sent: row.recipients_sent,
                failed: row.recipients_failed,
                skipped: row.recipients_skipped,
            },
            error_class: row.error_class,
        })
    }
}

/// A campaign as submitted by the administrative producer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCampaign {
    pub kind: CampaignKind,
    pub payload: Payload,
    pub target: Target,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewCampaign {
    /// A pending message to one recipient.
    pub fn single_message(recipient: RecipientId, payload: Payload) -> Self {
        Self {
            kind: CampaignKind::SingleMessage,
            payload,
            target: Target::User(recipient),
            status: CampaignStatus::Pending,
            scheduled_at: None,
        }
    }

    /// A pending broadcast to everyone matching `filter`.
    pub fn broadcast(filter: AudienceFilter, payload: Payload) -> Self {
        Self {
            kind: CampaignKind::Broadcast,
            payload,
            target: Target::Audience(filter),
            status: CampaignStatus::Pending,
            scheduled_at: None,
        }
    }

    /// A broadcast that the scheduler releases at `at`.
    pub fn scheduled_broadcast(filter: AudienceFilter, payload: Payload, at: DateTime<Utc>) -> Self {
        Self {
            kind: CampaignKind::ScheduledBroadcast,
            payload,
            target: Target::Audience(filter),
            status: CampaignStatus::Scheduled,
            scheduled_at: Some(at),
        }
    }

    /// Keeps the campaign out of dispatch until an administrator publishes it.
    pub fn as_draft(mut self) -> Self {
        self.status = CampaignStatus::Draft;
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        let invalid = |reason: &str| Err(StoreError::Invalid(reason.to_string()));

        if !matches!(
            self.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled | CampaignStatus::Pending
        ) {
            return invalid("new campaigns start as draft, scheduled or pending");
        }
        if self.kind == CampaignKind::ScheduledBroadcast && self.scheduled_at.is_none() {
            return invalid("scheduled_broadcast requires scheduled_at");
        }
        if self.status == CampaignStatus::Scheduled && self.scheduled_at.is_none() {
            return invalid("scheduled status requires scheduled_at");
        }
        match (&self.target, self.kind.is_broadcast()) {
            (Target::User(_), true) => invalid("broadcast campaigns target an audience"),
            (Target::Audience(_), false) => invalid("single_message campaigns target one user"),
            _ => Ok(()),
        }
    }
}
