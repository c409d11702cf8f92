use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::context::DispatchContext;
use crate::dispatch::poller::{self, PollReport};
use crate::dispatch::scheduler;

/// Runs the fallback poller and the scheduled-campaign tick on fixed
/// intervals.
pub struct BackgroundJobs {
    ctx: Arc<DispatchContext>,
    scheduler: JobScheduler,
}

impl BackgroundJobs {
    pub async fn new(ctx: Arc<DispatchContext>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self { ctx, scheduler })
    }

    pub async fn start(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let settings = &self.ctx.settings;

        let ctx = self.ctx.clone();
        let poll_job = Job::new_repeated_async(settings.poll_interval, move |_uuid, _l| {
            let ctx = ctx.clone();
            Box::pin(async move {
                if let Err(e) = poller::poll_once(&ctx).await {
                    tracing::error!("Campaign poll failed: {}", e);
                }
            })
        })?;

        let ctx = self.ctx.clone();
        let tick_job = Job::new_repeated_async(settings.scheduler_tick, move |_uuid, _l| {
            let ctx = ctx.clone();
            Box::pin(async move {
                if let Err(e) = scheduler::promote_due(&ctx, chrono::Utc::now()).await {
                    tracing::error!("Scheduled campaign promotion failed: {}", e);
                }
            })
        })?;

        self.scheduler.add(poll_job).await?;
        self.scheduler.add(tick_job).await?;
        self.scheduler.start().await?;

        tracing::info!(
            "Background jobs started - polling every {}s, scheduler tick every {}s",
            settings.poll_interval.as_secs(),
            settings.scheduler_tick.as_secs()
        );
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.scheduler.shutdown().await?;
        Ok(())
    }

    /// Runs one poll immediately, used at startup to pick up work left by a
    /// previous process.
    pub async fn poll_now(&self) -> Result<PollReport, Box<dyn std::error::Error + Send + Sync>> {
        Ok(poller::poll_once(&self.ctx).await?)
    }
}
