use std::sync::Arc;

use aerotrack::config::PipelineConfig;
use aerotrack::instance_lock::{InstanceLock, RUN_LOCK};
use aerotrack::pipeline::Pipeline;
use aerotrack::scheduler::{LoggingErrorHandler, Scheduler};
use anyhow::{Context, Result};
use tracing::{Instrument, error, info};

use super::open_store;

pub async fn handle_run(config: PipelineConfig, dry_run: bool, metrics_port: Option<u16>) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "run");
    });

    aerotrack::metrics::initialize_pipeline_metrics();
    if let Some(port) = metrics_port {
        tokio::spawn(
            async move {
                if let Err(e) = aerotrack::metrics::start_metrics_server(port).await {
                    error!("Metrics server stopped: {:#}", e);
                }
            }
            .instrument(tracing::info_span!("metrics_server")),
        );
    }

    // Dry runs write nowhere, so they may run beside a real instance
    let _instance_lock = if dry_run {
        None
    } else {
        Some(
            InstanceLock::new(RUN_LOCK)
                .context("Failed to acquire instance lock - is another aerotrack run active?")?,
        )
    };

    let store = open_store(&config, dry_run).await?;
    let scheduler = Scheduler::new(
        config.scheduler.scheduler_config(),
        Arc::new(LoggingErrorHandler),
    );
    let pipeline = Pipeline::new(&config, store, scheduler)?;
    pipeline.start()?;
    info!("Pipeline running, press Ctrl+C to stop");

    wait_for_shutdown_signal().await;
    info!("Received shutdown signal, stopping pipeline...");

    let clean = pipeline.shutdown().await;
    let totals = pipeline.consolidator().totals();
    info!(
        "Stopped after {} batches ({} failed): {} frames, {} planes, {} flights, {} points",
        totals.batches, totals.failed_batches, totals.frames, totals.planes, totals.flights, totals.points
    );
    if !clean {
        anyhow::bail!("Shutdown timed out; some tasks were abandoned");
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Failed to listen for Ctrl+C: {}", e);
                        }
                    }
                }
                return;
            }
            Err(e) => error!("Failed to register SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
}
