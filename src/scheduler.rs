use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::pipeline::{CycleSummary, Pipeline};

/// Six-field cron (with seconds) firing once a day at `hour`:00 UTC.
pub fn daily_cron(hour: u32) -> String {
    format!("0 0 {} * * *", hour)
}

/// One scheduled cycle: clear the read cache, then the same entry point a
/// manual refresh uses, always forced.
pub async fn trigger(pipeline: &Pipeline) -> CycleSummary {
    pipeline.cache().invalidate();
    let summary = pipeline.run_cycle(true, &ProgressBar::hidden()).await;
    if summary.all_failed() {
        error!(run_date = %summary.run_date, "scheduled cycle failed for every source");
    } else {
        info!(
            run_date = %summary.run_date,
            inserted = summary.total_inserted(),
            failed = summary.failed(),
            "scheduled cycle done"
        );
    }
    summary
}

pub async fn build(pipeline: Arc<Pipeline>, hour: u32) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = daily_cron(hour);
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            trigger(&pipeline).await;
        })
    })
    .with_context(|| format!("creating daily job for cron {cron}"))?;
    sched.add(job).await.context("adding daily job")?;
    Ok(sched)
}

/// Run the daily job until Ctrl-C.
pub async fn run_daemon(pipeline: Arc<Pipeline>, hour: u32) -> Result<()> {
    let mut sched = build(pipeline, hour).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %daily_cron(hour), "scheduler running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
