//! Notification channel subscriptions consumed by the [`Listener`].
//!
//! [`Listener`]: crate::dispatch::listener::Listener

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::database::models::CampaignId;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("notification channel disconnected")]
    Disconnected,
    #[error("notification receiver lagged, {0} notifications lost")]
    Lagged(u64),
    #[error("unknown notification channel '{0}'")]
    UnknownChannel(String),
    #[error("notification transport error: {0}")]
    Transport(#[from] sqlx::Error),
}

impl FeedError {
    /// Whether the subscription is gone and has to be re-established.
    pub fn is_disconnect(&self) -> bool {
        !matches!(self, FeedError::Lagged(_))
    }
}

/// A subscription to a named notification channel whose payloads are
/// campaign ids.
#[async_trait]
pub trait ChangeFeed: Send {
    /// (Re)establishes the subscription, replacing any previous one.
    async fn subscribe(&mut self, channel: &str) -> Result<(), FeedError>;

    /// Waits for the next payload on the subscribed channel.
    async fn recv(&mut self) -> Result<String, FeedError>;
}

/// `LISTEN` on a dedicated Postgres connection.
pub struct PgChangeFeed {
    pool: PgPool,
    listener: Option<PgListener>,
}

impl PgChangeFeed {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, listener: None }
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&mut self, channel: &str) -> Result<(), FeedError> {
        self.listener = None;
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        self.listener = Some(listener);
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, FeedError> {
        let listener = self.listener.as_mut().ok_or(FeedError::Disconnected)?;

        // try_recv reports a dropped connection as Ok(None) instead of
        // silently reconnecting, so the gap is visible to the caller.
        let received = listener.try_recv().await;
        match received {
            Ok(Some(notification)) => Ok(notification.payload().to_string()),
            Ok(None) => {
                self.listener = None;
                Err(FeedError::Disconnected)
            }
            Err(e) => {
                self.listener = None;
                Err(FeedError::Transport(e))
            }
        }
    }
}

/// In-process stand-in for the database trigger, used with the SQLite
/// backend: the store publishes ids of campaigns that became pending.
#[derive(Clone, Debug)]
pub struct ChangeNotifier {
    channel: String,
    sender: broadcast::Sender<CampaignId>,
}

impl ChangeNotifier {
    pub fn new(channel: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            channel: channel.into(),
            sender,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publishes without waiting; with no subscriber the event is dropped.
    pub fn notify(&self, campaign_id: CampaignId) {
        let _ = self.sender.send(campaign_id);
    }

    pub fn feed(&self) -> LocalChangeFeed {
        LocalChangeFeed {
            notifier: self.clone(),
            receiver: None,
        }
    }
}

pub struct LocalChangeFeed {
    notifier: ChangeNotifier,
    receiver: Option<broadcast::Receiver<CampaignId>>,
}

#[async_trait]
impl ChangeFeed for LocalChangeFeed {
    async fn subscribe(&mut self, channel: &str) -> Result<(), FeedError> {
        if channel != self.notifier.channel {
            return Err(FeedError::UnknownChannel(channel.to_string()));
        }
        self.receiver = Some(self.notifier.sender.subscribe());
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, FeedError> {
        let receiver = self.receiver.as_mut().ok_or(FeedError::Disconnected)?;
        let received = receiver.recv().await;
        match received {
            Ok(id) => Ok(id.to_string()),
            Err(broadcast::error::RecvError::Lagged(missed)) => Err(FeedError::Lagged(missed)),
            Err(broadcast::error::RecvError::Closed) => {
                self.receiver = None;
                Err(FeedError::Disconnected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_feed_delivers_ids_published_after_subscribe() {
        let notifier = ChangeNotifier::new("new_campaign", 8);
        let mut feed = notifier.feed();

        notifier.notify(1);
        feed.subscribe("new_campaign").await.unwrap();
        notifier.notify(2);

        assert_eq!(feed.recv().await.unwrap(), "2");
    }

    #[tokio::test]
    async fn local_feed_rejects_other_channels() {
        let notifier = ChangeNotifier::new("new_campaign", 8);
        let mut feed = notifier.feed();

        let err = feed.subscribe("other").await.unwrap_err();
        assert!(matches!(err, FeedError::UnknownChannel(_)));
        assert!(matches!(feed.recv().await, Err(FeedError::Disconnected)));
    }

    #[tokio::test]
    async fn local_feed_reports_lag_without_disconnecting() {
        let notifier = ChangeNotifier::new("new_campaign", 2);
        let mut feed = notifier.feed();
        feed.subscribe("new_campaign").await.unwrap();

        for id in 0..5 {
            notifier.notify(id);
        }

        let err = feed.recv().await.unwrap_err();
        assert!(matches!(err, FeedError::Lagged(3)));
        assert!(!err.is_disconnect());
        assert_eq!(feed.recv().await.unwrap(), "3");
    }
}
