use anyhow::{Context, Result};
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::info;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Install the Prometheus recorder.
/// Returns a handle that can be used to render metrics for scraping.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        // Poll cycles and uploads take seconds; batches usually milliseconds
        // Buckets: 10ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s, 30s, 60s
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        )
        .context("Failed to set histogram buckets")?
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Publish uptime and resident memory once.
/// Scheduled periodically by the `run` command.
pub fn update_process_metrics() {
    let start = PROCESS_START.get_or_init(Instant::now);
    metrics::gauge!("process.uptime.seconds").set(start.elapsed().as_secs() as f64);
    metrics::gauge!("process.is_up").set(1.0);

    // Get memory usage using procfs (Linux-specific)
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    // Parse RSS memory in kB
                    if let Some(kb_str) = line.split_whitespace().nth(1)
                        && let Ok(kb) = kb_str.parse::<f64>()
                    {
                        metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
                    }
                    break;
                }
            }
        }
    }
}

/// Initialize pipeline metrics to zero/default values
/// This ensures metrics always appear in Prometheus queries even if no events have occurred
pub fn initialize_pipeline_metrics() {
    PROCESS_START.get_or_init(Instant::now);

    // Poller
    metrics::counter!("poller.cycles_total").absolute(0);
    metrics::counter!("poller.frames_total").absolute(0);
    metrics::counter!("poller.cycle_timeouts_total").absolute(0);
    metrics::counter!("poller.area_failures_total", "kind" => "network").absolute(0);

    // Deserializer
    metrics::counter!("deserializer.frames_parsed_total").absolute(0);
    metrics::counter!("deserializer.malformed_records_total").absolute(0);
    metrics::counter!("deserializer.filtered_records_total").absolute(0);

    // Consolidator
    metrics::counter!("consolidator.batches_total").absolute(0);
    metrics::counter!("consolidator.failed_batches_total").absolute(0);
    metrics::counter!("consolidator.planes_created_total").absolute(0);
    metrics::counter!("consolidator.flights_created_total").absolute(0);
    metrics::counter!("consolidator.points_written_total").absolute(0);
    metrics::counter!("consolidator.out_of_order_points").absolute(0);

    // Keeper
    metrics::counter!("keeper.sweeps_total").absolute(0);
    metrics::counter!("keeper.flights_closed_total").absolute(0);
    metrics::counter!("keeper.close_failures_total").absolute(0);
    metrics::gauge!("keeper.open_flights").set(0.0);

    // Uploader
    metrics::counter!("uploader.frames_uploaded_total").absolute(0);
    metrics::counter!("uploader.bytes_uploaded_total").absolute(0);
    metrics::counter!("uploader.failures_total").absolute(0);
    metrics::gauge!("uploader.queue_size").set(0.0);
    metrics::gauge!("uploader.frames_per_sec").set(0.0);
    metrics::gauge!("uploader.bytes_per_sec").set(0.0);

    // Scheduler
    metrics::counter!("scheduler.tasks_completed_total").absolute(0);
    metrics::gauge!("scheduler.active_tasks").set(0.0);
    for kind in ["failed", "panicked", "timed_out"] {
        metrics::counter!("scheduler.task_errors_total", "kind" => kind).absolute(0);
    }
}

/// Serve `/metrics` on the given port until the process exits
pub async fn start_metrics_server(port: u16) -> Result<()> {
    let handle = init_metrics()?;
    if METRICS_HANDLE.set(handle).is_err() {
        anyhow::bail!("Metrics handle already initialized");
    }

    let app = Router::new().route(
        "/metrics",
        get(|| async {
            METRICS_HANDLE
                .get()
                .map(|handle| handle.render())
                .unwrap_or_default()
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on http://{}/metrics", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", addr))?;

    axum::serve(listener, app)
        .await
        .context("Metrics server failed")
}
