//! Windowed send quota.
//!
//! The quota is a policy object: its scope decides whether deliveries are
//! counted across every campaign or per campaign. Usage is read back from the
//! outcome ledger, so it survives restarts and is shared by every dispatcher
//! on the same store.

use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;

use crate::database::models::CampaignId;
use crate::database::store::{CampaignStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    /// One ceiling shared by all campaigns.
    Global,
    /// Each campaign gets its own ceiling.
    Campaign,
}

impl FromStr for QuotaScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(QuotaScope::Global),
            "campaign" => Ok(QuotaScope::Campaign),
            other => Err(format!("unknown quota scope '{other}', expected global or campaign")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendQuota {
    pub scope: QuotaScope,
    /// Deliveries allowed per window; zero disables the quota.
    pub limit: u32,
    pub window: Duration,
}

impl SendQuota {
    pub fn unlimited() -> Self {
        Self {
            scope: QuotaScope::Global,
            limit: 0,
            window: Duration::from_secs(86_400),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit == 0
    }

    /// Sends still allowed in the window ending at `now`, or `None` when
    /// unlimited.
    pub async fn allowance(
        &self,
        store: &dyn CampaignStore,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<usize>, StoreError> {
        if self.is_unlimited() {
            return Ok(None);
        }

        let window = chrono::Duration::from_std(self.window)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let scope = match self.scope {
            QuotaScope::Global => None,
            QuotaScope::Campaign => Some(campaign_id),
        };
        let used = store.delivered_since(scope, now - window).await?;
        let remaining = i64::from(self.limit).saturating_sub(used).max(0);
        Ok(Some(remaining as usize))
    }
}

impl Default for SendQuota {
    fn default() -> Self {
        Self::unlimited()
    }
}
