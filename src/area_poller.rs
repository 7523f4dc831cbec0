use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::area::Area;
use crate::config::FeedConfig;
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::frame_deserializer::FrameDeserializer;
use crate::scheduler::{Priority, Scheduler, TaskHandle, TaskOptions};

/// Query string of one feed request
pub fn feed_query(area: &Area, max_age_secs: u64) -> Vec<(&'static str, String)> {
    vec![
        ("faa", "1".to_string()),
        ("bounds", area.bounds_param()),
        ("satellite", "1".to_string()),
        ("mlat", "1".to_string()),
        ("flarm", "1".to_string()),
        ("adsb", "1".to_string()),
        ("gnd", "1".to_string()),
        ("air", "1".to_string()),
        ("vehicles", "0".to_string()),
        ("estimated", "1".to_string()),
        ("maxage", max_age_secs.to_string()),
        ("gliders", "0".to_string()),
        ("stats", "0".to_string()),
    ]
}

/// Fetches every configured area once per cycle and merges the frames
pub struct AreaPoller {
    client: Client,
    config: FeedConfig,
    scheduler: Scheduler,
    deserializer: FrameDeserializer,
}

impl AreaPoller {
    pub fn new(config: FeedConfig, scheduler: Scheduler) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build feed HTTP client")?;
        let deserializer = FrameDeserializer::with_filter(config.record_filter());

        Ok(Self {
            client,
            config,
            scheduler,
            deserializer,
        })
    }

    pub fn deserializer(&self) -> &FrameDeserializer {
        &self.deserializer
    }

    /// Run one poll cycle over `areas`.
    ///
    /// Each area is fetched by its own pooled task, with at most
    /// `feed.concurrency` fetches in flight. Failed areas are logged and
    /// skipped. If the cycle deadline passes, outstanding fetches are
    /// interrupted and the frames collected so far are returned.
    #[instrument(skip_all, fields(areas = areas.len()))]
    pub async fn poll(&self, areas: &[Area]) -> Vec<Frame> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.cycle_timeout();
        let budget = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let (tx, rx) = flume::unbounded::<Vec<Frame>>();
        let mut handles: Vec<TaskHandle> = Vec::with_capacity(areas.len());
        let mut timed_out = false;

        for area in areas {
            let permit = match tokio::time::timeout_at(deadline, Arc::clone(&budget).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            };

            let client = self.client.clone();
            let url = self.config.base_url.clone();
            let query = feed_query(area, self.config.max_age_secs);
            let deserializer = self.deserializer.clone();
            let tx = tx.clone();
            let area_name = area.name().to_string();

            let fetch = move |cancel: CancellationToken| async move {
                let _permit = permit;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Fetch for area {} interrupted", area_name);
                    }
                    result = fetch_area(&client, &url, &query, &deserializer) => match result {
                        Ok(frames) => {
                            debug!("Area {} returned {} frames", area_name, frames.len());
                            // The receiver is gone only if the cycle already ended
                            let _ = tx.send(frames);
                        }
                        Err(e) => {
                            warn!("Skipping area {} this cycle: {}", area_name, e);
                            metrics::counter!("poller.area_failures_total", "kind" => e.kind())
                                .increment(1);
                        }
                    }
                }
                Ok(())
            };

            let options = TaskOptions::new(format!("fetch-{}", area.name())).priority(Priority::HIGH);
            match tokio::time::timeout_at(deadline, self.scheduler.exec(options, fetch)).await {
                Ok(Ok(handle)) => handles.push(handle),
                Ok(Err(e)) => {
                    warn!("Could not submit fetch for area {}: {}", area.name(), e);
                    metrics::counter!("poller.area_failures_total", "kind" => "scheduling")
                        .increment(1);
                }
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }
        // Only the fetch tasks hold senders from here on
        drop(tx);

        let mut frames = Vec::new();
        if !timed_out {
            loop {
                match tokio::time::timeout_at(deadline, rx.recv_async()).await {
                    Ok(Ok(batch)) => frames.extend(batch),
                    Ok(Err(_)) => break,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                }
            }
        }

        if timed_out {
            let pending: Vec<&TaskHandle> = handles.iter().filter(|h| !h.is_finished()).collect();
            warn!(
                "Poll cycle exceeded {:?}, interrupting {} outstanding fetches",
                self.config.cycle_timeout(),
                pending.len()
            );
            metrics::counter!("poller.cycle_timeouts_total").increment(1);
            futures_util::future::join_all(pending.into_iter().map(|h| self.scheduler.interrupt(h)))
                .await;
            frames.extend(rx.drain().flatten());
        }

        let elapsed = started.elapsed();
        metrics::counter!("poller.cycles_total").increment(1);
        metrics::counter!("poller.frames_total").increment(frames.len() as u64);
        metrics::histogram!("poller.cycle_duration_seconds").record(elapsed.as_secs_f64());
        info!(
            "Polled {} areas in {:.2}s: {} frames",
            areas.len(),
            elapsed.as_secs_f64(),
            frames.len()
        );

        frames
    }
}

async fn fetch_area(
    client: &Client,
    url: &str,
    query: &[(&'static str, String)],
    deserializer: &FrameDeserializer,
) -> Result<Vec<Frame>, PipelineError> {
    let response = client.get(url).query(query).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(PipelineError::Network(format!("feed returned {}", status)));
    }

    let body = response.text().await?;
    let stream = deserializer.parse(&body)?;
    Ok(stream.collect())
}
