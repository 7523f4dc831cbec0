use aerotrack::config::PipelineConfig;
use aerotrack::consolidator::writer_lane;
use aerotrack::keeper::Keeper;
use anyhow::{Context, Result};

use super::open_store;

pub async fn handle_sweep(config: &PipelineConfig, dry_run: bool, threshold: Option<i64>) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "sweep");
    });

    let threshold = threshold.unwrap_or(config.schedule.staleness_threshold_secs);
    if threshold < 0 {
        anyhow::bail!("Staleness threshold must not be negative, got {}", threshold);
    }

    let store = open_store(config, dry_run).await?;
    let keeper = Keeper::new(store, writer_lane());
    let report = keeper.sweep(threshold).await.context("Keeper sweep failed")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to render report")?
    );
    Ok(())
}
