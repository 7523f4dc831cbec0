use std::sync::Arc;
use std::time::Duration;

use aerotrack::config::PipelineConfig;
use aerotrack::pipeline::Pipeline;
use aerotrack::scheduler::{LoggingErrorHandler, Scheduler};
use anyhow::{Context, Result};
use tracing::{info, warn};

use super::open_store;

/// Extra time granted to a triggered upload before exiting
const UPLOAD_GRACE: Duration = Duration::from_secs(30);

pub async fn handle_poll_once(config: &PipelineConfig, dry_run: bool) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "poll-once");
    });

    let store = open_store(config, dry_run).await?;
    let scheduler = Scheduler::new(
        config.scheduler.scheduler_config(),
        Arc::new(LoggingErrorHandler),
    );
    let pipeline = Pipeline::new(config, store.clone(), scheduler.clone())?;

    let report = pipeline.run_cycle().await.context("Poll cycle failed")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to render report")?
    );

    if !scheduler.shutdown(UPLOAD_GRACE).await {
        warn!("Upload did not finish within {}s", UPLOAD_GRACE.as_secs());
        scheduler.shutdown_now().await;
    }

    let counts = store.counts().await?;
    info!(
        "Store now holds {} planes, {} flights ({} open), {} tracking points",
        counts.planes, counts.flights, counts.open_flights, counts.points
    );
    Ok(())
}
