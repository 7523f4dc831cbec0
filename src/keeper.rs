use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::consolidator::WriterLane;
use crate::error::PipelineError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeeperReport {
    /// Open flights looked at
    pub examined: usize,
    pub closed: usize,
    /// Flights that could not be closed; retried on the next sweep
    pub failed: usize,
}

/// Retires flights whose latest tracking point is older than a threshold
pub struct Keeper {
    store: Arc<dyn Store>,
    lane: WriterLane,
}

impl Keeper {
    pub fn new(store: Arc<dyn Store>, lane: WriterLane) -> Self {
        Self { store, lane }
    }

    /// Close every open flight silent for more than `threshold_secs`
    pub async fn sweep(&self, threshold_secs: i64) -> Result<KeeperReport, PipelineError> {
        self.sweep_at(Utc::now().timestamp(), threshold_secs).await
    }

    /// Sweep as if the current time were `now` (epoch seconds).
    ///
    /// A flight is closed iff `now - last_seen > threshold_secs`, with its end
    /// set to `last_seen`. A failure to close one flight is logged and the
    /// sweep continues.
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: i64, threshold_secs: i64) -> Result<KeeperReport, PipelineError> {
        let _lane = self.lane.lock().await;

        let open = self
            .store
            .open_flights_with_last_seen()
            .await
            .map_err(|e| PipelineError::Persistence(e.context("Failed to load open flights")))?;

        let mut report = KeeperReport {
            examined: open.len(),
            ..Default::default()
        };
        if open.is_empty() {
            debug!("No open flights");
            return Ok(report);
        }

        for flight in open {
            if now - flight.last_seen <= threshold_secs {
                continue;
            }
            match self.store.close_flight(flight.flight_id, flight.last_seen).await {
                Ok(true) => {
                    debug!(
                        "Closed flight {} of plane {} (silent for {}s)",
                        flight.flight_id,
                        flight.plane_id,
                        now - flight.last_seen
                    );
                    report.closed += 1;
                }
                Ok(false) => {
                    debug!("Flight {} was already closed", flight.flight_id);
                }
                Err(e) => {
                    warn!("Failed to close flight {}: {:#}", flight.flight_id, e);
                    report.failed += 1;
                }
            }
        }

        metrics::counter!("keeper.sweeps_total").increment(1);
        metrics::counter!("keeper.flights_closed_total").increment(report.closed as u64);
        metrics::counter!("keeper.close_failures_total").increment(report.failed as u64);
        metrics::gauge!("keeper.open_flights").set((report.examined - report.closed) as f64);
        info!(
            "Keeper sweep: {} open flights, {} closed, {} failed",
            report.examined, report.closed, report.failed
        );

        Ok(report)
    }
}
