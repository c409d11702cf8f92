use anyhow::Result;
use chrono::{Duration, Utc};
use campaign_dispatcher::database::connection::DatabaseManager;
use campaign_dispatcher::database::models::*;
use campaign_dispatcher::database::store::{CampaignStore, PgCampaignStore, SqliteCampaignStore, StoreError};
use campaign_dispatcher::dispatch::feed::{ChangeFeed, ChangeNotifier, PgChangeFeed};
use campaign_dispatcher::dispatch::state::{CampaignStatus, Transition};
use tempfile::{tempdir, TempDir};

async fn setup_test_db() -> Result<(DatabaseManager, TempDir)> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("test.db");
    let database_url = format!("sqlite:{}", db_path.display());

    let db_manager = DatabaseManager::new(&database_url).await?;
    db_manager.run_migrations().await?;

    Ok((db_manager, temp_dir))
}

async fn setup_store() -> Result<(SqliteCampaignStore, TempDir)> {
    let (db, temp_dir) = setup_test_db().await?;
    let DatabaseManager::Sqlite(pool) = db else {
        panic!("test database is sqlite");
    };
    Ok((SqliteCampaignStore::new(pool), temp_dir))
}

fn outcome(campaign_id: CampaignId, recipient_id: RecipientId, outcome: Outcome, attempts: i64) -> RecipientOutcome {
    RecipientOutcome {
        campaign_id,
        recipient_id,
        outcome,
        attempt_count: attempts,
        last_error_class: None,
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_campaign_creation_and_retrieval() -> Result<()> {
    let (store, _temp_dir) = setup_store().await?;

    let mut payload = Payload::photo("AgADBAADq6cxG", Some("<b>Sale</b>".to_string()));
    payload.parse_mode = Some(ParseMode::Html);
    let filter = AudienceFilter {
        registered_after: Some(Utc::now() - Duration::days(30)),
        registered_before: None,
    };
    let id = store
        .insert_campaign(&NewCampaign::broadcast(filter.clone(), payload.clone()))
        .await?;

    let campaign = store.find_campaign(id).await?.unwrap();
    assert_eq!(campaign.id, id);
    assert_eq!(campaign.kind, CampaignKind::Broadcast);
    assert_eq!(campaign.status, CampaignStatus::Pending);
    assert_eq!(campaign.payload, payload);
    assert_eq!(campaign.target, Target::Audience(filter));
    assert_eq!(campaign.progress, Progress::default());
    assert!(campaign.started_at.is_none());
    assert!(campaign.error_class.is_none());

    assert!(store.find_campaign(id + 1000).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_invalid_campaigns_are_rejected() -> Result<()> {
    let (store, _temp_dir) = setup_store().await?;

    let mut campaign = NewCampaign::single_message(5, Payload::text("hi"));
    campaign.status = CampaignStatus::Completed;

    let err = store.insert_campaign(&campaign).await.unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
    assert_eq!(err.class(), "invalid_campaign");
    Ok(())
}

#[tokio::test]
async fn test_transitions_are_compare_and_set() -> Result<()> {
    let (store, _temp_dir) = setup_store().await?;
    let id = store
        .insert_campaign(&NewCampaign::single_message(5, Payload::text("hi")).as_draft())
        .await?;

    // Still a draft, so begin does not apply.
    assert!(!store.apply_transition(id, Transition::begin(), Utc::now()).await?);

    assert!(store.apply_transition(id, Transition::publish(), Utc::now()).await?);
    assert!(store.apply_transition(id, Transition::begin(), Utc::now()).await?);
    assert!(!store.apply_transition(id, Transition::begin(), Utc::now()).await?);

    let campaign = store.find_campaign(id).await?.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Processing);
    assert!(campaign.started_at.is_some());
    Ok(())
}

#[tokio::test]
async fn test_finish_writes_counters_once() -> Result<()> {
    let (store, _temp_dir) = setup_store().await?;
    let id = store
        .insert_campaign(&NewCampaign::single_message(5, Payload::text("hi")))
        .await?;
    assert!(store.apply_transition(id, Transition::begin(), Utc::now()).await?);

    let progress = Progress { total: 1, sent: 1, failed: 0, skipped: 0 };
    let done = Transition::settle(CampaignStatus::Completed)?;
    assert!(store.finish(id, done, &progress, None, Utc::now()).await?);
    assert!(!store.finish(id, done, &progress, None, Utc::now()).await?);

    let campaign = store.find_campaign(id).await?.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert_eq!(campaign.progress, progress);
    assert!(campaign.completed_at.is_some());

    // Counters of a settled campaign are frozen.
    store
        .record_progress(id, &Progress { total: 9, sent: 9, failed: 0, skipped: 0 })
        .await?;
    assert_eq!(store.find_campaign(id).await?.unwrap().progress, progress);

    let err = store
        .finish(id, Transition::begin(), &progress, None, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
    Ok(())
}

#[tokio::test]
async fn test_promote_due_only_releases_due_campaigns() -> Result<()> {
    let (store, _temp_dir) = setup_store().await?;
    let now = Utc::now();

    let due = store
        .insert_campaign(&NewCampaign::scheduled_broadcast(
            AudienceFilter::everyone(),
            Payload::text("due"),
            now - Duration::seconds(5),
        ))
        .await?;
    store
        .insert_campaign(&NewCampaign::scheduled_broadcast(
            AudienceFilter::everyone(),
            Payload::text("future"),
            now + Duration::hours(2),
        ))
        .await?;

    assert_eq!(store.promote_due(now).await?, vec![due]);
    assert!(store.promote_due(now).await?.is_empty());
    assert_eq!(store.find_campaign(due).await?.unwrap().status, CampaignStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_dispatchable_campaigns() -> Result<()> {
    let (store, _temp_dir) = setup_store().await?;

    let pending = store
        .insert_campaign(&NewCampaign::single_message(1, Payload::text("a")))
        .await?;
    let processing = store
        .insert_campaign(&NewCampaign::single_message(2, Payload::text("b")))
        .await?;
    assert!(store.apply_transition(processing, Transition::begin(), Utc::now()).await?);
    store
        .insert_campaign(&NewCampaign::single_message(3, Payload::text("c")).as_draft())
        .await?;
    store
        .insert_campaign(&NewCampaign::scheduled_broadcast(
            AudienceFilter::everyone(),
            Payload::text("d"),
            Utc::now() + Duration::days(1),
        ))
        .await?;

    assert_eq!(store.dispatchable_campaign_ids().await?, vec![pending, processing]);
    Ok(())
}

#[tokio::test]
async fn test_audience_resolution() -> Result<()> {
    let (store, _temp_dir) = setup_store().await?;
    let now = Utc::now();

    store.register_recipient(30, Some("old"), now - Duration::days(60)).await?;
    store.register_recipient(10, Some("new"), now - Duration::days(1)).await?;
    store.register_recipient(20, None, now - Duration::days(2)).await?;
    store.register_recipient(40, Some("blocked"), now - Duration::days(1)).await?;
    store.set_recipient_blocked(40, true).await?;

    assert_eq!(store.resolve_audience(&AudienceFilter::everyone()).await?, vec![10, 20, 30]);

    let recent = AudienceFilter {
        registered_after: Some(now - Duration::days(7)),
        registered_before: None,
    };
    assert_eq!(store.resolve_audience(&recent).await?, vec![10, 20]);

    let older = AudienceFilter {
        registered_after: None,
        registered_before: Some(now - Duration::days(7)),
    };
    assert_eq!(store.resolve_audience(&older).await?, vec![30]);

    // Re-registering keeps the original registration time.
    store.register_recipient(30, Some("renamed"), now).await?;
    assert_eq!(store.resolve_audience(&older).await?, vec![30]);
    Ok(())
}

#[tokio::test]
async fn test_outcome_ledger_upserts() -> Result<()> {
    let (store, _temp_dir) = setup_store().await?;
    let id = store
        .insert_campaign(&NewCampaign::broadcast(AudienceFilter::everyone(), Payload::text("x")))
        .await?;

    let mut retrying = outcome(id, 7, Outcome::Retrying, 1);
    retrying.last_error_class = Some("network".to_string());
    store.record_outcome(&retrying).await?;
    store.record_outcome(&outcome(id, 7, Outcome::Delivered, 2)).await?;
    store.record_outcome(&outcome(id, 3, Outcome::SkippedPermanent, 1)).await?;

    let ledger = store.outcomes(id).await?;
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[0].recipient_id, 3);
    assert_eq!(ledger[1].outcome, Outcome::Delivered);
    assert_eq!(ledger[1].attempt_count, 2);
    assert!(ledger[1].last_error_class.is_none());
    Ok(())
}

#[tokio::test]
async fn test_delivered_since_counts_by_scope() -> Result<()> {
    let (store, _temp_dir) = setup_store().await?;
    let first = store
        .insert_campaign(&NewCampaign::broadcast(AudienceFilter::everyone(), Payload::text("1")))
        .await?;
    let second = store
        .insert_campaign(&NewCampaign::broadcast(AudienceFilter::everyone(), Payload::text("2")))
        .await?;

    let since = Utc::now() - Duration::minutes(1);
    store.record_outcome(&outcome(first, 1, Outcome::Delivered, 1)).await?;
    store.record_outcome(&outcome(first, 2, Outcome::FailedFinal, 3)).await?;
    store.record_outcome(&outcome(second, 1, Outcome::Delivered, 1)).await?;

    let mut stale = outcome(second, 2, Outcome::Delivered, 1);
    stale.updated_at = Utc::now() - Duration::hours(2);
    store.record_outcome(&stale).await?;

    assert_eq!(store.delivered_since(None, since).await?, 2);
    assert_eq!(store.delivered_since(Some(first), since).await?, 1);
    assert_eq!(store.delivered_since(Some(second), Utc::now() - Duration::days(1)).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_recent_campaigns_newest_first() -> Result<()> {
    let (store, _temp_dir) = setup_store().await?;
    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(
            store
                .insert_campaign(&NewCampaign::single_message(n + 1, Payload::text("x")))
                .await?,
        );
    }

    let recent: Vec<CampaignId> = store.recent_campaigns(2).await?.into_iter().map(|c| c.id).collect();
    assert_eq!(recent, vec![ids[2], ids[1]]);
    Ok(())
}

#[tokio::test]
async fn test_store_publishes_campaigns_that_become_pending() -> Result<()> {
    let (db, _temp_dir) = setup_test_db().await?;
    let DatabaseManager::Sqlite(pool) = db else {
        panic!("test database is sqlite");
    };
    let notifier = ChangeNotifier::new("new_campaign", 16);
    let store = SqliteCampaignStore::with_notifier(pool, notifier.clone());
    let mut feed = notifier.feed();
    feed.subscribe("new_campaign").await?;

    let draft = store
        .insert_campaign(&NewCampaign::single_message(1, Payload::text("wip")).as_draft())
        .await?;
    let pending = store
        .insert_campaign(&NewCampaign::single_message(2, Payload::text("go")))
        .await?;
    assert_eq!(feed.recv().await?, pending.to_string());

    store.apply_transition(draft, Transition::publish(), Utc::now()).await?;
    assert_eq!(feed.recv().await?, draft.to_string());

    let scheduled = store
        .insert_campaign(&NewCampaign::scheduled_broadcast(
            AudienceFilter::everyone(),
            Payload::text("soon"),
            Utc::now() - Duration::seconds(1),
        ))
        .await?;
    store.promote_due(Utc::now()).await?;
    assert_eq!(feed.recv().await?, scheduled.to_string());
    Ok(())
}

/// Runs only when `TEST_POSTGRES_URL` points at a scratch database.
#[tokio::test]
async fn test_postgres_trigger_follows_configured_channel() -> Result<()> {
    let Ok(url) = std::env::var("TEST_POSTGRES_URL") else {
        return Ok(());
    };
    let db = DatabaseManager::new(&url).await?;
    db.run_migrations().await?;
    let DatabaseManager::Postgres(pool) = &db else {
        panic!("TEST_POSTGRES_URL must be a postgres:// URL");
    };

    db.set_notify_channel("campaign_ready_test").await?;
    let mut feed = PgChangeFeed::new(pool.clone());
    feed.subscribe("campaign_ready_test").await?;

    let store = PgCampaignStore::new(pool.clone());
    let id = store
        .insert_campaign(&NewCampaign::single_message(1, Payload::text("hi")))
        .await?;
    let payload = tokio::time::timeout(std::time::Duration::from_secs(5), feed.recv()).await??;
    assert_eq!(payload, id.to_string());

    db.set_notify_channel("new_campaign").await?;
    db.close().await;
    Ok(())
}

#[tokio::test]
async fn test_set_notify_channel_is_a_no_op_on_sqlite() -> Result<()> {
    let (db, _temp_dir) = setup_test_db().await?;
    db.set_notify_channel("campaign_ready").await?;
    Ok(())
}
