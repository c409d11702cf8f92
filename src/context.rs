use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchSettings;
use crate::database::connection::DatabaseManager;
use crate::database::store::{CampaignStore, PgCampaignStore, SqliteCampaignStore};
use crate::dispatch::feed::{ChangeFeed, ChangeNotifier, PgChangeFeed};
use crate::dispatch::intake::{Intake, WorkItem};
use crate::dispatch::lock::{AdvisoryLockManager, LeaseLockManager, LockManager};
use crate::services::delivery::DeliveryClient;

/// Everything a dispatch component needs, shared behind an `Arc`.
pub struct DispatchContext {
    pub store: Arc<dyn CampaignStore>,
    pub locks: Arc<dyn LockManager>,
    pub delivery: Arc<dyn DeliveryClient>,
    pub settings: DispatchSettings,
    pub intake: Intake,
    pub shutdown: CancellationToken,
}

/// The backend-specific pieces that do not live in the shared context.
pub struct Wiring {
    pub context: Arc<DispatchContext>,
    pub feed: Box<dyn ChangeFeed>,
    pub work: mpsc::Receiver<WorkItem>,
}

impl DispatchContext {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        locks: Arc<dyn LockManager>,
        delivery: Arc<dyn DeliveryClient>,
        settings: DispatchSettings,
    ) -> (Arc<Self>, mpsc::Receiver<WorkItem>) {
        let (intake, work) = Intake::channel(settings.intake_capacity);
        let context = Arc::new(Self {
            store,
            locks,
            delivery,
            settings,
            intake,
            shutdown: CancellationToken::new(),
        });
        (context, work)
    }

    /// Picks store, lock manager and change feed to match the database
    /// backend.
    pub fn for_database(
        db: &DatabaseManager,
        delivery: Arc<dyn DeliveryClient>,
        settings: DispatchSettings,
    ) -> Wiring {
        let (store, locks, feed): (Arc<dyn CampaignStore>, Arc<dyn LockManager>, Box<dyn ChangeFeed>) =
            match db {
                DatabaseManager::Postgres(pool) => (
                    Arc::new(PgCampaignStore::new(pool.clone())),
                    Arc::new(AdvisoryLockManager::new(pool.clone())),
                    Box::new(PgChangeFeed::new(pool.clone())),
                ),
                DatabaseManager::Sqlite(pool) => {
                    let notifier =
                        ChangeNotifier::new(settings.notify_channel.clone(), settings.intake_capacity);
                    (
                        Arc::new(SqliteCampaignStore::with_notifier(pool.clone(), notifier.clone())),
                        Arc::new(LeaseLockManager::new(pool.clone(), settings.lock_lease)),
                        Box::new(notifier.feed()),
                    )
                }
            };

        let (context, work) = Self::new(store, locks, delivery, settings);
        Wiring {
            context,
            feed,
            work,
        }
    }
}
