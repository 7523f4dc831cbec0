//! Reconciles polled frames with persisted planes and flights.
//!
//! Plane and flight ids are predicted client-side from the highest persisted
//! ids. That is only safe while a single batch at a time goes from "read
//! index" to "commit", so every batch holds the [`WriterLane`] for its whole
//! duration. The keeper takes the same lane, which keeps a flight from being
//! closed between the index load and the commit of points for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, instrument, warn};

use crate::error::PipelineError;
use crate::flights::Flight;
use crate::frame::Frame;
use crate::planes::Plane;
use crate::store::{IdWatermarks, Identity, IdentityIndex, Store, WriteBatch};
use crate::tracking::TrackingPoint;

/// Exclusive lane shared by everything that writes planes or flights
pub type WriterLane = Arc<Mutex<()>>;

pub fn writer_lane() -> WriterLane {
    Arc::new(Mutex::new(()))
}

/// Capacity of the data-ready channel; slow subscribers miss older summaries
const NOTIFY_CAPACITY: usize = 64;

/// Outcome of one committed batch, published to subscribers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub frames: usize,
    pub planes_created: usize,
    pub flights_created: usize,
    pub points_written: usize,
    /// Frames without an ICAO address
    pub frames_skipped: usize,
    /// Points older than the previous point of the same flight in the batch
    pub out_of_order_points: usize,
    pub duration_ms: u64,
}

/// Cumulative counters since the consolidator was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidatorTotals {
    pub batches: u64,
    pub failed_batches: u64,
    pub frames: u64,
    pub planes: u64,
    pub flights: u64,
    pub points: u64,
}

#[derive(Default)]
struct Totals {
    batches: AtomicU64,
    failed_batches: AtomicU64,
    frames: AtomicU64,
    planes: AtomicU64,
    flights: AtomicU64,
    points: AtomicU64,
}

/// Rows a batch will write, with the counters derived while planning it
#[derive(Debug, Default)]
pub(crate) struct BatchPlan {
    pub(crate) batch: WriteBatch,
    pub(crate) skipped: usize,
    pub(crate) out_of_order: usize,
}

/// Assign every frame to a flight, allocating plane and flight ids above
/// `watermarks` for addresses without an open flight. `index` is updated in
/// place so later frames of the same address reuse the new ids.
pub(crate) fn plan_batch(
    index: &mut IdentityIndex,
    watermarks: IdWatermarks,
    frames: Vec<Frame>,
) -> BatchPlan {
    let mut plan = BatchPlan::default();
    let mut next_plane = watermarks.plane_id;
    let mut next_flight = watermarks.flight_id;
    let mut latest: HashMap<i32, i64> = HashMap::new();

    for frame in frames {
        if frame.icao.trim().is_empty() {
            plan.skipped += 1;
            continue;
        }

        let flight_id = match index.get(&frame.icao) {
            Some(Identity {
                open_flight_id: Some(flight_id),
                ..
            }) => flight_id,
            Some(Identity {
                plane_id,
                open_flight_id: None,
            }) => {
                // Known plane whose previous flight was closed
                next_flight += 1;
                plan.batch
                    .flights
                    .push(Flight::from_frame(next_flight, plane_id, &frame));
                index.insert(
                    frame.icao.clone(),
                    Identity {
                        plane_id,
                        open_flight_id: Some(next_flight),
                    },
                );
                next_flight
            }
            None => {
                next_plane += 1;
                next_flight += 1;
                plan.batch.planes.push(Plane::from_frame(next_plane, &frame));
                plan.batch
                    .flights
                    .push(Flight::from_frame(next_flight, next_plane, &frame));
                index.insert(
                    frame.icao.clone(),
                    Identity {
                        plane_id: next_plane,
                        open_flight_id: Some(next_flight),
                    },
                );
                next_flight
            }
        };

        let last = latest.entry(flight_id).or_insert(frame.timestamp);
        if frame.timestamp < *last {
            plan.out_of_order += 1;
        } else {
            *last = frame.timestamp;
        }
        plan.batch
            .points
            .push(TrackingPoint::from_frame(flight_id, &frame));
    }

    plan
}

pub struct Consolidator {
    store: Arc<dyn Store>,
    lane: WriterLane,
    notify: broadcast::Sender<BatchSummary>,
    totals: Totals,
}

impl Consolidator {
    pub fn new(store: Arc<dyn Store>, lane: WriterLane) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            store,
            lane,
            notify,
            totals: Totals::default(),
        }
    }

    /// Receive a [`BatchSummary`] after every committed batch
    pub fn subscribe(&self) -> broadcast::Receiver<BatchSummary> {
        self.notify.subscribe()
    }

    pub fn totals(&self) -> ConsolidatorTotals {
        ConsolidatorTotals {
            batches: self.totals.batches.load(Ordering::Relaxed),
            failed_batches: self.totals.failed_batches.load(Ordering::Relaxed),
            frames: self.totals.frames.load(Ordering::Relaxed),
            planes: self.totals.planes.load(Ordering::Relaxed),
            flights: self.totals.flights.load(Ordering::Relaxed),
            points: self.totals.points.load(Ordering::Relaxed),
        }
    }

    /// Reconcile and persist one batch of frames.
    ///
    /// The batch is committed as a whole; on failure nothing is written and
    /// the error is returned as [`PipelineError::Persistence`].
    #[instrument(skip_all, fields(frames = frames.len()))]
    pub async fn consolidate(&self, frames: Vec<Frame>) -> Result<BatchSummary, PipelineError> {
        let started = Instant::now();
        let frame_count = frames.len();

        let _lane = self.lane.lock().await;

        let mut index = self
            .store
            .load_identity_index()
            .await
            .map_err(|e| self.failed(e.context("Failed to load identity index")))?;
        let watermarks = self
            .store
            .id_watermarks()
            .await
            .map_err(|e| self.failed(e.context("Failed to read id watermarks")))?;
        debug!(
            "Loaded identity index with {} planes, watermarks {:?}",
            index.len(),
            watermarks
        );

        let plan = plan_batch(&mut index, watermarks, frames);
        let mut summary = BatchSummary {
            frames: frame_count,
            planes_created: plan.batch.planes.len(),
            flights_created: plan.batch.flights.len(),
            points_written: plan.batch.points.len(),
            frames_skipped: plan.skipped,
            out_of_order_points: plan.out_of_order,
            duration_ms: 0,
        };

        if !plan.batch.is_empty() {
            self.store
                .commit(plan.batch)
                .await
                .map_err(|e| self.failed(e.context("Failed to commit batch")))?;
        }
        summary.duration_ms = started.elapsed().as_millis() as u64;

        self.totals.batches.fetch_add(1, Ordering::Relaxed);
        self.totals.frames.fetch_add(frame_count as u64, Ordering::Relaxed);
        self.totals
            .planes
            .fetch_add(summary.planes_created as u64, Ordering::Relaxed);
        self.totals
            .flights
            .fetch_add(summary.flights_created as u64, Ordering::Relaxed);
        self.totals
            .points
            .fetch_add(summary.points_written as u64, Ordering::Relaxed);

        metrics::counter!("consolidator.batches_total").increment(1);
        metrics::counter!("consolidator.planes_created_total").increment(summary.planes_created as u64);
        metrics::counter!("consolidator.flights_created_total").increment(summary.flights_created as u64);
        metrics::counter!("consolidator.points_written_total").increment(summary.points_written as u64);
        metrics::counter!("consolidator.out_of_order_points").increment(summary.out_of_order_points as u64);
        metrics::histogram!("consolidator.batch_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if summary.out_of_order_points > 0 {
            warn!(
                "{} tracking points arrived older than the previous point of their flight",
                summary.out_of_order_points
            );
        }
        info!(
            "Consolidated {} frames: {} new planes, {} new flights, {} points",
            summary.frames, summary.planes_created, summary.flights_created, summary.points_written
        );

        // Nobody listening is fine
        let _ = self.notify.send(summary.clone());
        Ok(summary)
    }

    fn failed(&self, error: anyhow::Error) -> PipelineError {
        self.totals.failed_batches.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("consolidator.failed_batches_total").increment(1);
        PipelineError::Persistence(error)
    }
}
