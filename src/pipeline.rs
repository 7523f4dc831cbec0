use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::area::Area;
use crate::area_poller::AreaPoller;
use crate::config::{PipelineConfig, ScheduleConfig};
use crate::consolidator::{BatchSummary, Consolidator, WriterLane, writer_lane};
use crate::error::{PipelineError, SchedulingError};
use crate::keeper::{Keeper, KeeperReport};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::uploader::Uploader;

/// Outcome of one poll + consolidate cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub frames: usize,
    /// Whether the frames triggered an upload
    pub upload_scheduled: bool,
    pub batch: BatchSummary,
}

/// The assembled ingestion pipeline.
///
/// Owns one poller, consolidator and keeper sharing a single writer lane,
/// plus the optional uploader. Cloning is cheap; clones share everything.
#[derive(Clone)]
pub struct Pipeline {
    scheduler: Scheduler,
    schedule: ScheduleConfig,
    areas: Arc<Vec<Area>>,
    poller: Arc<AreaPoller>,
    consolidator: Arc<Consolidator>,
    keeper: Arc<Keeper>,
    uploader: Option<Uploader>,
    store: Arc<dyn Store>,
}

impl Pipeline {
    pub fn new(config: &PipelineConfig, store: Arc<dyn Store>, scheduler: Scheduler) -> Result<Self> {
        let areas = config.areas.resolve().context("Invalid area configuration")?;
        if areas.is_empty() {
            anyhow::bail!("No areas configured");
        }
        let lane: WriterLane = writer_lane();
        let poller = AreaPoller::new(config.feed.clone(), scheduler.clone())?;
        let uploader = Uploader::from_config(config.uploader.clone(), scheduler.clone())?;

        info!(
            "Pipeline covers {} areas, uploader {}",
            areas.len(),
            if uploader.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            schedule: config.schedule.clone(),
            areas: Arc::new(areas),
            poller: Arc::new(poller),
            consolidator: Arc::new(Consolidator::new(store.clone(), lane.clone())),
            keeper: Arc::new(Keeper::new(store.clone(), lane)),
            uploader,
            store,
            scheduler,
        })
    }

    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    pub fn consolidator(&self) -> &Consolidator {
        &self.consolidator
    }

    pub fn uploader(&self) -> Option<&Uploader> {
        self.uploader.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Poll every area once, hand the frames to the uploader and consolidate
    /// them into the store
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        let frames = self.poller.poll(&self.areas).await;
        let frame_count = frames.len();

        let upload_scheduled = match &self.uploader {
            Some(uploader) if !frames.is_empty() => match uploader.add_frames(frames.clone()).await {
                Ok(scheduled) => scheduled,
                Err(SchedulingError::ShutDown) => false,
                Err(e) => {
                    warn!("Could not schedule upload: {}", e);
                    false
                }
            },
            _ => false,
        };

        let batch = self.consolidator.consolidate(frames).await?;
        Ok(CycleReport {
            frames: frame_count,
            upload_scheduled,
            batch,
        })
    }

    /// One keeper pass with the given staleness threshold
    pub async fn sweep(&self, threshold_secs: i64) -> Result<KeeperReport, PipelineError> {
        self.keeper.sweep(threshold_secs).await
    }

    /// Register the periodic poll, keeper and process-metrics tasks
    pub fn start(&self) -> Result<(), SchedulingError> {
        let schedule = &self.schedule;

        let poll = self.clone();
        let keeper = self.clone();
        let threshold = schedule.staleness_threshold_secs;

        self.scheduler
            .schedule(
                "poll",
                schedule.poll_initial_delay_secs,
                schedule.poll_period_secs,
                move || {
                    let pipeline = poll.clone();
                    async move {
                        pipeline.run_cycle().await?;
                        Ok(())
                    }
                },
            )?
            .schedule(
                "keeper",
                schedule.keeper_initial_delay_secs,
                schedule.keeper_period_secs,
                move || {
                    let pipeline = keeper.clone();
                    async move {
                        pipeline.sweep(threshold).await?;
                        Ok(())
                    }
                },
            )?
            .schedule(
                "process-metrics",
                0,
                schedule.process_metrics_period_secs,
                || async {
                    crate::metrics::update_process_metrics();
                    Ok(())
                },
            )?;

        info!(
            "Scheduled poll every {}s, keeper every {}s (threshold {}s)",
            schedule.poll_period_secs, schedule.keeper_period_secs, threshold
        );
        Ok(())
    }

    /// Stop accepting work and wait for running tasks; abandons them if the
    /// configured timeout passes. Returns whether everything finished in time.
    pub async fn shutdown(&self) -> bool {
        let timeout = Duration::from_secs(self.schedule.shutdown_timeout_secs);
        info!("Shutting down, waiting up to {}s for running tasks", timeout.as_secs());

        if self.scheduler.shutdown(timeout).await {
            info!("All tasks finished");
            return true;
        }

        warn!(
            "Tasks still running after {}s: {:?}",
            timeout.as_secs(),
            self.scheduler.running_tasks()
        );
        if !self.scheduler.shutdown_now().await {
            warn!("Some tasks did not stop after being cancelled");
        }
        false
    }
}
