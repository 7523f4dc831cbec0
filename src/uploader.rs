use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::UploaderConfig;
use crate::error::{PipelineError, SchedulingError};
use crate::frame::Frame;
use crate::scheduler::{Priority, Scheduler, TaskOptions};

pub const UPLOAD_PATH: &str = "/data/api/upload/frames";
/// Weight of the previous estimate in the throughput EWMA
pub const SMOOTHING: f64 = 0.125;

/// `(1 - α) * instantaneous + α * previous`
pub fn ewma(instantaneous: f64, previous: f64) -> f64 {
    (1.0 - SMOOTHING) * instantaneous + SMOOTHING * previous
}

/// Smoothed upload rates, per millisecond
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Throughput {
    pub frames_per_ms: f64,
    pub bytes_per_ms: f64,
}

impl Throughput {
    pub fn update(&mut self, frames: usize, bytes: usize, elapsed: Duration) {
        // Sub-millisecond uploads count as one millisecond
        let ms = (elapsed.as_secs_f64() * 1000.0).max(1.0);
        self.frames_per_ms = ewma(frames as f64 / ms, self.frames_per_ms);
        self.bytes_per_ms = ewma(bytes as f64 / ms, self.bytes_per_ms);
    }

    pub fn frames_per_sec(&self) -> f64 {
        self.frames_per_ms * 1000.0
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes_per_ms * 1000.0
    }
}

/// A failed upload attempt, kept for inspection
#[derive(Debug, Clone, Serialize)]
pub struct UploadFailure {
    pub at: DateTime<Utc>,
    pub frames: usize,
    pub requeued: bool,
    pub message: String,
}

struct Inner {
    client: Client,
    endpoint: String,
    config: UploaderConfig,
    scheduler: Scheduler,
    queue: Mutex<Vec<Frame>>,
    errors: Mutex<VecDeque<UploadFailure>>,
    throughput: Mutex<Throughput>,
    in_flight: AtomicBool,
    uploaded: AtomicU64,
}

/// Batches frames and pushes them to a remote aggregation endpoint.
///
/// Delivery is at-most-once unless `requeue_on_failure` is set, in which case
/// the frames of a failed attempt go back to the front of the queue and may
/// be delivered twice if the server processed the failed request.
#[derive(Clone)]
pub struct Uploader {
    inner: Arc<Inner>,
}

impl Uploader {
    /// Returns `None` when no upload host is configured
    pub fn from_config(config: UploaderConfig, scheduler: Scheduler) -> Result<Option<Self>> {
        let Some(base_url) = config.base_url() else {
            return Ok(None);
        };
        Self::new(&base_url, config, scheduler).map(Some)
    }

    pub fn new(base_url: &str, config: UploaderConfig, scheduler: Scheduler) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build upload HTTP client")?;
        let endpoint = format!("{}{}", base_url.trim_end_matches('/'), UPLOAD_PATH);
        info!("Uploading frames to {}", endpoint);

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                endpoint,
                config,
                scheduler,
                queue: Mutex::new(Vec::new()),
                errors: Mutex::new(VecDeque::new()),
                throughput: Mutex::new(Throughput::default()),
                in_flight: AtomicBool::new(false),
                uploaded: AtomicU64::new(0),
            }),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Queue frames; schedules an upload once the queue holds at least
    /// `min_upload_count` frames and no upload is running. Returns whether
    /// an upload was scheduled.
    pub async fn add_frames(&self, frames: Vec<Frame>) -> Result<bool, SchedulingError> {
        let queued = {
            let mut queue = self.inner.queue.lock().await;
            queue.extend(frames);
            queue.len()
        };
        metrics::gauge!("uploader.queue_size").set(queued as f64);

        if queued < self.inner.config.min_upload_count.max(1) {
            return Ok(false);
        }
        if self.inner.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Upload already in flight, {} frames waiting", queued);
            return Ok(false);
        }

        let uploader = self.clone();
        let options = TaskOptions::new("upload").priority(Priority::MID).with_timeout(false);
        let scheduled = self
            .inner
            .scheduler
            .exec(options, move |_cancel| async move {
                uploader
                    .upload_while_full()
                    .await
                    .map(|_| ())
                    .map_err(anyhow::Error::from)
            })
            .await;

        match scheduled {
            Ok(_) => Ok(true),
            Err(e) => {
                self.inner.in_flight.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Body of the scheduled upload task. Owns `in_flight` on entry and keeps
    /// uploading while frames queued during the previous POST fill the
    /// queue back up to `min_upload_count`. Stops at the first failure so a
    /// requeued batch is not retried in a tight loop.
    async fn upload_while_full(&self) -> Result<usize, PipelineError> {
        let min = self.inner.config.min_upload_count.max(1);
        let mut total = 0;
        loop {
            let result = self.upload().await;
            self.inner.in_flight.store(false, Ordering::Release);
            total += result?;

            // A concurrent add_frames may have claimed the next upload already
            if self.queue_len().await < min || self.inner.in_flight.swap(true, Ordering::AcqRel) {
                return Ok(total);
            }
            debug!("Frames arrived during the last upload, uploading again");
        }
    }

    /// Drain the queue and POST it as one JSON array. Returns the number of
    /// frames delivered.
    #[instrument(skip(self))]
    pub async fn upload(&self) -> Result<usize, PipelineError> {
        let frames = std::mem::take(&mut *self.inner.queue.lock().await);
        metrics::gauge!("uploader.queue_size").set(0.0);
        if frames.is_empty() {
            return Ok(0);
        }

        let count = frames.len();
        let body = serde_json::to_vec(&frames)
            .map_err(|e| PipelineError::MalformedRecord(format!("could not serialize frames: {}", e)))?;
        let bytes = body.len();
        debug!("Uploading {} frames ({} bytes)", count, bytes);

        let started = Instant::now();
        match self.post(body).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                let mut throughput = self.inner.throughput.lock().await;
                throughput.update(count, bytes, elapsed);
                self.inner.uploaded.fetch_add(count as u64, Ordering::Relaxed);

                metrics::counter!("uploader.frames_uploaded_total").increment(count as u64);
                metrics::counter!("uploader.bytes_uploaded_total").increment(bytes as u64);
                metrics::gauge!("uploader.frames_per_sec").set(throughput.frames_per_sec());
                metrics::gauge!("uploader.bytes_per_sec").set(throughput.bytes_per_sec());
                info!(
                    "Uploaded {} frames in {}ms ({:.1} frames/s)",
                    count,
                    elapsed.as_millis(),
                    throughput.frames_per_sec()
                );
                Ok(count)
            }
            Err(e) => {
                let requeued = self.inner.config.requeue_on_failure;
                if requeued {
                    let mut queue = self.inner.queue.lock().await;
                    let newer = std::mem::replace(&mut *queue, frames);
                    queue.extend(newer);
                }
                warn!(
                    "Upload of {} frames failed ({}): {}",
                    count,
                    if requeued { "requeued" } else { "dropped" },
                    e
                );
                metrics::counter!("uploader.failures_total").increment(1);
                self.record_failure(UploadFailure {
                    at: Utc::now(),
                    frames: count,
                    requeued,
                    message: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), PipelineError> {
        let response = self
            .inner
            .client
            .post(&self.inner.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Network(format!("upload endpoint returned {}", status)));
        }
        Ok(())
    }

    async fn record_failure(&self, failure: UploadFailure) {
        let capacity = self.inner.config.error_queue_capacity;
        if capacity == 0 {
            return;
        }
        let mut errors = self.inner.errors.lock().await;
        while errors.len() >= capacity {
            errors.pop_front();
        }
        errors.push_back(failure);
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    pub async fn throughput(&self) -> Throughput {
        *self.inner.throughput.lock().await
    }

    /// Recent failures, oldest first
    pub async fn errors(&self) -> Vec<UploadFailure> {
        self.inner.errors.lock().await.iter().cloned().collect()
    }

    pub fn uploaded_total(&self) -> u64 {
        self.inner.uploaded.load(Ordering::Relaxed)
    }

    pub fn is_uploading(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_after_first_upload() {
        let mut throughput = Throughput::default();
        throughput.update(100, 10_000, Duration::from_millis(2000));

        let expected = 0.875 * (100.0 / 2000.0);
        assert!((throughput.frames_per_ms - expected).abs() < 1e-12);
        assert!((throughput.frames_per_ms - 0.04375).abs() < 1e-12);
        assert!((throughput.bytes_per_ms - 0.875 * 5.0).abs() < 1e-12);
        assert!((throughput.frames_per_sec() - 43.75).abs() < 1e-9);
    }

    #[test]
    fn test_ewma_weights_previous_estimate() {
        assert_eq!(ewma(0.0, 8.0), 1.0);
        assert_eq!(ewma(8.0, 0.0), 7.0);
    }

    #[tokio::test]
    async fn test_failed_upload_is_dropped_and_recorded() {
        let config = UploaderConfig {
            min_upload_count: 10,
            error_queue_capacity: 2,
            request_timeout_secs: 1,
            ..Default::default()
        };
        // Nothing listens on port 9 of localhost
        let uploader =
            Uploader::new("http://127.0.0.1:9", config, Scheduler::with_defaults()).unwrap();

        for attempt in 0..3 {
            let scheduled = uploader
                .add_frames(vec![Frame::new(format!("ABC{:03}", attempt), 50.0, 7.0, 100)])
                .await
                .unwrap();
            assert!(!scheduled);
            assert!(uploader.upload().await.is_err());
            assert_eq!(uploader.queue_len().await, 0);
        }

        let errors = uploader.errors().await;
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| !e.requeued && e.frames == 1));
        assert_eq!(uploader.throughput().await, Throughput::default());
    }

    #[tokio::test]
    async fn test_failed_upload_is_requeued_when_configured() {
        let config = UploaderConfig {
            min_upload_count: 10,
            requeue_on_failure: true,
            request_timeout_secs: 1,
            ..Default::default()
        };
        let uploader =
            Uploader::new("http://127.0.0.1:9", config, Scheduler::with_defaults()).unwrap();

        uploader
            .add_frames(vec![Frame::new("3C6444", 50.0, 7.0, 100)])
            .await
            .unwrap();
        assert!(uploader.upload().await.is_err());
        assert_eq!(uploader.queue_len().await, 1);
        assert!(uploader.errors().await[0].requeued);
    }

    #[test]
    fn test_endpoint_path() {
        let uploader = Uploader::new(
            "http://collector.local:8080/",
            UploaderConfig::default(),
            Scheduler::with_defaults(),
        )
        .unwrap();
        assert_eq!(
            uploader.endpoint(),
            "http://collector.local:8080/data/api/upload/frames"
        );
    }
}
