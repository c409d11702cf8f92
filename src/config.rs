use anyhow::{anyhow, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatch::quota::{QuotaScope, SendQuota};
use crate::dispatch::sender::SendSettings;
use crate::utils::validation::validate_channel_name;

const DEFAULT_DATABASE_URL: &str = "sqlite:./data/campaigns.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_bot_token: String,
    pub database_url: String,
    pub http_port: u16,
    pub db_pool_max: u32,
    pub dispatch: DispatchSettings,
}

/// Tunables for the listener, poller, scheduler and dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub notify_channel: String,
    pub poll_interval: Duration,
    pub scheduler_tick: Duration,
    pub send: SendSettings,
    pub quota: SendQuota,
    pub listener_backoff_max: Duration,
    pub lock_lease: Duration,
    /// Re-offer a contended campaign once after this delay. Unset drops it.
    pub lock_retry_after: Option<Duration>,
    pub max_concurrent_dispatches: usize,
    pub intake_capacity: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            notify_channel: "new_campaign".to_string(),
            poll_interval: Duration::from_secs(30),
            scheduler_tick: Duration::from_secs(10),
            send: SendSettings::default(),
            quota: SendQuota::unlimited(),
            listener_backoff_max: Duration::from_secs(30),
            lock_lease: Duration::from_secs(300),
            lock_retry_after: None,
            max_concurrent_dispatches: 4,
            intake_capacity: 1024,
        }
    }
}

impl DispatchSettings {
    pub fn validate(&self) -> Result<()> {
        validate_channel_name(&self.notify_channel)?;

        if self.poll_interval.is_zero() {
            return Err(anyhow!("POLL_INTERVAL_SECS must be greater than zero"));
        }
        if self.scheduler_tick.is_zero() {
            return Err(anyhow!("SCHEDULER_TICK_SECS must be greater than zero"));
        }
        if self.send.batch_size == 0 {
            return Err(anyhow!("BROADCAST_BATCH_SIZE must be greater than zero"));
        }
        if self.send.max_attempts == 0 {
            return Err(anyhow!("MAX_SEND_ATTEMPTS must be greater than zero"));
        }
        if self.send.retry_base > self.send.retry_max {
            return Err(anyhow!("RETRY_BASE_MS cannot exceed RETRY_MAX_MS"));
        }
        if self.max_concurrent_dispatches == 0 {
            return Err(anyhow!("MAX_CONCURRENT_DISPATCHES must be greater than zero"));
        }

        // A lease must outlive the longest retry sequence of one recipient,
        // since renewal only happens between sends.
        let worst_retry = self.send.retry_max.saturating_mul(self.send.max_attempts);
        if self.lock_lease <= worst_retry {
            return Err(anyhow!(
                "LOCK_LEASE_SECS must exceed MAX_SEND_ATTEMPTS x RETRY_MAX_MS ({}s)",
                worst_retry.as_secs()
            ));
        }

        Ok(())
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let token = env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| anyhow!("TELEGRAM_BOT_TOKEN must be set"))?;

        if token.trim().is_empty() {
            return Err(anyhow!("TELEGRAM_BOT_TOKEN must be set"));
        }

        let database_url = Self::database_url_from_env();
        let http_port = parse_var("HTTP_PORT", 3000u16)?;
        let db_pool_max = parse_var("DB_POOL_MAX", 20u32)?;
        if db_pool_max == 0 {
            return Err(anyhow!("DB_POOL_MAX must be greater than zero"));
        }

        let dispatch = dispatch_from_env()?;
        dispatch.validate()?;

        Ok(Config {
            telegram_bot_token: token,
            database_url,
            http_port,
            db_pool_max,
            dispatch,
        })
    }

    /// `DATABASE_URL` or the SQLite default, without requiring the rest of
    /// the configuration.
    pub fn database_url_from_env() -> String {
        env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
    }
}

fn dispatch_from_env() -> Result<DispatchSettings> {
    let defaults = DispatchSettings::default();

    let batch_size = parse_var("BROADCAST_BATCH_SIZE", defaults.send.batch_size)?;
    let message_delay = Duration::from_millis(parse_var("MESSAGE_DELAY_MS", 50u64)?);
    let batch_pause = match optional_var::<u64>("BATCH_PAUSE_MS")? {
        Some(ms) => Duration::from_millis(ms),
        None => message_delay.saturating_mul(batch_size as u32),
    };

    let send = SendSettings {
        batch_size,
        message_delay,
        batch_pause,
        max_attempts: parse_var("MAX_SEND_ATTEMPTS", defaults.send.max_attempts)?,
        retry_base: Duration::from_millis(parse_var("RETRY_BASE_MS", 500u64)?),
        retry_max: Duration::from_millis(parse_var("RETRY_MAX_MS", 30_000u64)?),
    };

    let quota = SendQuota {
        scope: parse_var("QUOTA_SCOPE", QuotaScope::Global)?,
        limit: parse_var("QUOTA_LIMIT", 0u32)?,
        window: Duration::from_secs(parse_var("QUOTA_WINDOW_SECS", 86_400u64)?),
    };

    Ok(DispatchSettings {
        notify_channel: env::var("NOTIFY_CHANNEL")
            .ok()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or(defaults.notify_channel),
        poll_interval: Duration::from_secs(parse_var("POLL_INTERVAL_SECS", 30u64)?),
        scheduler_tick: Duration::from_secs(parse_var("SCHEDULER_TICK_SECS", 10u64)?),
        send,
        quota,
        listener_backoff_max: Duration::from_secs(parse_var("LISTENER_BACKOFF_MAX_SECS", 30u64)?),
        lock_lease: Duration::from_secs(parse_var("LOCK_LEASE_SECS", 300u64)?),
        lock_retry_after: optional_var::<u64>("LOCK_RETRY_AFTER_MS")?.map(Duration::from_millis),
        max_concurrent_dispatches: parse_var(
            "MAX_CONCURRENT_DISPATCHES",
            defaults.max_concurrent_dispatches,
        )?,
        intake_capacity: parse_var("INTAKE_CAPACITY", defaults.intake_capacity)?,
    })
}

/// Reads `name`, falling back to `default` when unset or blank.
fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    Ok(optional_var(name)?.unwrap_or(default))
}

fn optional_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("Invalid {}", name)),
        _ => Ok(None),
    }
}
