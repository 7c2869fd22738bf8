//! Periodic maintenance drivers.
//!
//! Internal cron jobs that keep the queue core healthy:
//! - every 30 s: record a metrics sample per queue (and evaluate alerts)
//! - every minute: run the scheduler tick and process due dead-letter retries
//! - hourly: evaluate and persist health + scaling, log an aggregate line
//! - daily: purge dead letters and completed jobs past retention
//!
//! These run independently of the worker pools; they enqueue work or write
//! telemetry rather than executing jobs themselves.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler as CronScheduler};
use tracing::{error, info};

use crate::manager::QueueManager;

/// Start every maintenance driver. The returned scheduler must be kept
/// alive by the caller.
pub async fn start_maintenance(manager: Arc<QueueManager>) -> Result<CronScheduler> {
    let scheduler = CronScheduler::new().await?;

    // Metrics sampling every 30 seconds.
    let sample_manager = manager.clone();
    let sample_job = CronJob::new_async("*/30 * * * * *", move |_uuid, _lock| {
        let manager = sample_manager.clone();
        Box::pin(async move {
            for queue in manager.queues() {
                if let Err(e) = manager.monitor().record_sample(&queue).await {
                    error!(queue = %queue, error = %e, "metrics sampling failed");
                }
            }
        })
    })?;
    scheduler.add(sample_job).await?;

    // Scheduler tick and due dead-letter retries every minute.
    let minute_manager = manager.clone();
    let minute_job = CronJob::new_async("0 * * * * *", move |_uuid, _lock| {
        let manager = minute_manager.clone();
        Box::pin(async move {
            match manager.scheduler().tick(Utc::now()).await {
                Ok(fired) if fired > 0 => info!(fired, "scheduler tick submitted jobs"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "scheduler tick failed"),
            }
            for queue in manager.queues() {
                if let Err(e) = manager.process_scheduled_retries(&queue).await {
                    error!(queue = %queue, error = %e, "scheduled retry processing failed");
                }
            }
        })
    })?;
    scheduler.add(minute_job).await?;

    // Hourly aggregation: health reports plus a summary line.
    let hourly_manager = manager.clone();
    let hourly_job = CronJob::new_async("0 0 * * * *", move |_uuid, _lock| {
        let manager = hourly_manager.clone();
        Box::pin(async move {
            match manager.system_health().await {
                Ok(health) => {
                    info!(
                        overall = health.overall_score,
                        queues = health.queues.len(),
                        "hourly health aggregation"
                    );
                }
                Err(e) => error!(error = %e, "hourly health aggregation failed"),
            }
        })
    })?;
    scheduler.add(hourly_job).await?;

    // Daily retention pass at 02:00.
    let purge_manager = manager.clone();
    let purge_job = CronJob::new_async("0 0 2 * * *", move |_uuid, _lock| {
        let manager = purge_manager.clone();
        Box::pin(async move {
            let retention = manager.config().retention.clone();
            let completed_cutoff =
                Utc::now() - chrono::Duration::days(retention.completed_days);
            for queue in manager.queues() {
                match manager.dlq().purge(&queue, retention.dlq_days, None).await {
                    Ok(removed) if removed > 0 => {
                        info!(queue = %queue, removed, "purged aged dead letters");
                    }
                    Ok(_) => {}
                    Err(e) => error!(queue = %queue, error = %e, "dead-letter purge failed"),
                }
                match manager
                    .log()
                    .purge_completed_before(&queue, completed_cutoff)
                    .await
                {
                    Ok(removed) if removed > 0 => {
                        info!(queue = %queue, removed, "purged aged completed jobs");
                    }
                    Ok(_) => {}
                    Err(e) => error!(queue = %queue, error = %e, "completed-job purge failed"),
                }
            }
        })
    })?;
    scheduler.add(purge_job).await?;

    scheduler.start().await?;
    info!("maintenance drivers started (sampling, scheduler tick, hourly aggregation, daily purge)");
    Ok(scheduler)
}
