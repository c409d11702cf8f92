use tracing::{debug, error, info, warn};

use crate::database::models::{CampaignId, Progress, RecipientId};

/// Logs the start of a dispatch run with consistent format
pub fn log_dispatch_start(campaign_id: CampaignId, kind: &str, recipients: usize, resumed: bool) {
    if resumed {
        info!(
            "DISPATCH_START: campaign {} ({}) resuming with {} recipients",
            campaign_id, kind, recipients
        );
    } else {
        info!(
            "DISPATCH_START: campaign {} ({}) with {} recipients",
            campaign_id, kind, recipients
        );
    }
}

/// Logs a settled dispatch run with consistent format
pub fn log_dispatch_done(campaign_id: CampaignId, status: &str, progress: &Progress) {
    info!(
        "DISPATCH_DONE: campaign {} -> {} (total={}, sent={}, failed={}, skipped={})",
        campaign_id, status, progress.total, progress.sent, progress.failed, progress.skipped
    );
}

/// Logs a campaign-level failure with consistent format
pub fn log_dispatch_failed(campaign_id: CampaignId, error_class: &str, error: &str) {
    error!(
        "DISPATCH_FAILED: campaign {} [{}] {}",
        campaign_id, error_class, error
    );
}

/// Logs a run that stopped before settling; the campaign stays processing
pub fn log_dispatch_interrupted(campaign_id: CampaignId, reason: &str, progress: &Progress) {
    warn!(
        "DISPATCH_INTERRUPTED: campaign {} stopped ({}) after {}/{} recipients",
        campaign_id,
        reason,
        progress.settled(),
        progress.total
    );
}

/// Logs a consideration dropped because another holder owns the campaign
pub fn log_lock_contended(campaign_id: CampaignId, source: &str) {
    debug!(
        "LOCK_CONTENDED: campaign {} already held, dropping {} trigger",
        campaign_id, source
    );
}

/// Logs a per-recipient delivery error with consistent format
pub fn log_delivery_error(
    campaign_id: CampaignId,
    recipient_id: RecipientId,
    attempt: u32,
    error_class: &str,
    error: &str,
) {
    warn!(
        "DELIVERY_ERROR: campaign {} recipient {} attempt {} [{}] {}",
        campaign_id, recipient_id, attempt, error_class, error
    );
}

/// Logs listener connectivity events with consistent format
pub fn log_listener_event(event: &str, details: Option<&str>) {
    match details {
        Some(d) => info!("LISTENER: {} - {}", event, d),
        None => info!("LISTENER: {}", event),
    }
}

/// Logs database operations with consistent format
pub fn log_database_operation(operation: &str, table: &str, details: Option<&str>) {
    match details {
        Some(d) => debug!("DB_OP: {} on {} - {}", operation, table, d),
        None => debug!("DB_OP: {} on {}", operation, table),
    }
}

/// Logs database errors with consistent format
pub fn log_database_error(operation: &str, table: &str, error: &str, details: Option<&str>) {
    match details {
        Some(d) => error!("DB_ERROR: {} on {} failed: {} - {}", operation, table, error, d),
        None => error!("DB_ERROR: {} on {} failed: {}", operation, table, error),
    }
}

/// Logs timeout events with consistent format
pub fn log_timeout(operation: &str, duration_secs: u64, details: Option<&str>) {
    match details {
        Some(d) => warn!("TIMEOUT: {} after {}s - {}", operation, duration_secs, d),
        None => warn!("TIMEOUT: {} after {}s", operation, duration_secs),
    }
}

/// Logs system events with consistent format
pub fn log_system_event(event: &str, details: Option<&str>) {
    match details {
        Some(d) => info!("SYSTEM: {} - {}", event, d),
        None => info!("SYSTEM: {}", event),
    }
}
