//! # Campaign Dispatcher Main Entry Point
//!
//! Initializes logging, loads configuration, sets up the database, then runs
//! the notification listener, the background poll and scheduler jobs, the
//! dispatcher and the health server until interrupted.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use teloxide::Bot;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use campaign_dispatcher::config::Config;
use campaign_dispatcher::context::DispatchContext;
use campaign_dispatcher::database::connection::DatabaseManager;
use campaign_dispatcher::dispatch::listener::Listener;
use campaign_dispatcher::dispatch::Dispatcher;
use campaign_dispatcher::services::delivery::TelegramDelivery;
use campaign_dispatcher::services::health::HealthService;
use campaign_dispatcher::services::jobs::BackgroundJobs;
use campaign_dispatcher::utils::backoff::Backoff;
use campaign_dispatcher::utils::logging::{log_system_event, log_timeout};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "campaign_dispatcher=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    info!("Starting Campaign Dispatcher v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded - HTTP Port: {}, channel: {}, batch size: {}",
        config.http_port, config.dispatch.notify_channel, config.dispatch.send.batch_size
    );

    // Initialize database
    info!("Initializing database connection...");
    let db_manager = DatabaseManager::with_pool_size(&config.database_url, config.db_pool_max).await?;
    db_manager.run_migrations().await?;
    db_manager.set_notify_channel(&config.dispatch.notify_channel).await?;
    let db = Arc::new(db_manager);
    info!("Database initialized successfully ({})", db.backend());

    let bot = Bot::new(&config.telegram_bot_token);
    let delivery = Arc::new(TelegramDelivery::new(bot));
    let wiring = DispatchContext::for_database(&db, delivery, config.dispatch.clone());
    let ctx = wiring.context;
    let shutdown = ctx.shutdown.clone();

    let listener = Listener::new(
        wiring.feed,
        ctx.settings.notify_channel.clone(),
        ctx.intake.clone(),
        Backoff::new(Duration::from_secs(1), ctx.settings.listener_backoff_max),
        shutdown.clone(),
    );
    let listener_task = tokio::spawn(listener.run());

    let dispatcher_task = tokio::spawn(Dispatcher::new(ctx.clone()).run(wiring.work));

    let mut jobs = match BackgroundJobs::new(ctx.clone()).await {
        Ok(jobs) => jobs,
        Err(e) => {
            tracing::error!("Failed to create background jobs: {}", e);
            return Err(anyhow::anyhow!("Failed to create background jobs: {}", e));
        }
    };
    if let Err(e) = jobs.start().await {
        tracing::error!("Failed to start background jobs: {}", e);
    }
    // Pick up campaigns left pending or processing by a previous process.
    match jobs.poll_now().await {
        Ok(report) => info!(
            "Startup poll promoted {} and offered {} campaigns",
            report.promoted, report.offered
        ),
        Err(e) => tracing::warn!("Startup poll failed: {}", e),
    }

    let health_service = HealthService::new(db.clone(), ctx.store.clone());
    let http_listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to port {}: {}", config.http_port, e))?;
    info!("Health server starting on port {}", config.http_port);

    let server_shutdown = shutdown.clone();
    let health_task = tokio::spawn(async move {
        let server = axum::serve(http_listener, health_service.router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await });
        if let Err(e) = server.await {
            tracing::error!("Health server error: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log_system_event("shutdown requested", Some("ctrl-c")),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    if let Err(e) = jobs.stop().await {
        tracing::warn!("Error stopping background jobs: {}", e);
    }

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = tokio::join!(listener_task, dispatcher_task, health_task);
    })
    .await;
    if drained.is_err() {
        log_timeout(
            "shutdown",
            SHUTDOWN_GRACE.as_secs(),
            Some("running dispatches left processing for resume"),
        );
    }

    db.close().await;
    info!("Application stopped");
    Ok(())
}
