mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use aerotrack::area::Area;
use aerotrack::error::{PipelineError, SchedulingError};
use aerotrack::memory_store::{CommitStage, MemoryStore};
use aerotrack::pipeline::Pipeline;
use aerotrack::scheduler::Scheduler;
use aerotrack::store::{Store, StoreCounts};
use axum::http::StatusCode;
use common::{FakeCollector, FakeFeed, config_for, feed_record};

fn north() -> Area {
    Area::new(55.0, 50.0, 5.0, 10.0).unwrap().with_name("north")
}

fn south() -> Area {
    Area::new(50.0, 45.0, 5.0, 10.0).unwrap().with_name("south")
}

/// Three planes spread over two areas, two frames each
async fn feed_with_three_planes() -> FakeFeed {
    let feed = FakeFeed::start().await;
    feed.respond(
        &north(),
        &[
            feed_record("3C6444", 52.1, 7.1, 1_000),
            feed_record("3C6444", 52.2, 7.3, 1_060),
            feed_record("4CA853", 51.0, 6.0, 1_000),
        ],
    );
    feed.respond(
        &south(),
        &[
            feed_record("4CA853", 49.9, 6.1, 1_030),
            feed_record("AE1234", 47.0, 8.0, 1_000),
            feed_record("AE1234", 47.1, 8.2, 1_070),
        ],
    );
    feed
}

async fn counts(store: &MemoryStore) -> (i64, i64, i64) {
    let StoreCounts {
        planes,
        flights,
        points,
        ..
    } = store.counts().await.unwrap();
    (planes, flights, points)
}

#[tokio::test]
async fn test_cycle_merges_areas_into_planes_flights_and_points() {
    let feed = feed_with_three_planes().await;
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(
        &config_for(&feed, &[north(), south()]),
        store.clone(),
        Scheduler::with_defaults(),
    )
    .unwrap();

    let report = pipeline.run_cycle().await.unwrap();
    assert_eq!(report.frames, 6);
    assert_eq!(report.batch.planes_created, 3);
    assert_eq!(report.batch.flights_created, 3);
    assert_eq!(report.batch.points_written, 6);
    assert!(!report.upload_scheduled);
    assert_eq!(feed.requests(), 2);
    assert_eq!(counts(&store).await, (3, 3, 6));

    // Every flight got both of its plane's points
    for flight in store.flights().await {
        let points = store
            .points()
            .await
            .into_iter()
            .filter(|p| p.flight_id == flight.id)
            .count();
        assert_eq!(points, 2, "flight {}", flight.id);
    }

    // Known planes and open flights are reused on the next cycle
    let report = pipeline.run_cycle().await.unwrap();
    assert_eq!(report.batch.planes_created, 0);
    assert_eq!(report.batch.flights_created, 0);
    assert_eq!(counts(&store).await, (3, 3, 12));
}

#[tokio::test]
async fn test_failing_area_is_skipped() {
    let feed = feed_with_three_planes().await;
    feed.fail(&south(), StatusCode::INTERNAL_SERVER_ERROR);
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(
        &config_for(&feed, &[north(), south()]),
        store.clone(),
        Scheduler::with_defaults(),
    )
    .unwrap();

    let report = pipeline.run_cycle().await.unwrap();
    assert_eq!(report.frames, 3);
    assert_eq!(counts(&store).await, (2, 2, 3));
}

#[tokio::test]
async fn test_slow_area_is_cut_off_at_cycle_deadline() {
    let feed = feed_with_three_planes().await;
    feed.respond_slowly(
        &south(),
        Duration::from_secs(4),
        &[feed_record("AE1234", 47.0, 8.0, 1_000)],
    );
    let mut config = config_for(&feed, &[north(), south()]);
    config.feed.request_timeout_secs = 10;
    config.feed.cycle_timeout_secs = 1;

    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(&config, store.clone(), Scheduler::with_defaults()).unwrap();

    let started = Instant::now();
    let report = pipeline.run_cycle().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.frames, 3);
    assert_eq!(counts(&store).await, (2, 2, 3));
}

#[tokio::test]
async fn test_failed_commit_is_reported_and_retried_with_same_ids() {
    let feed = feed_with_three_planes().await;
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(
        &config_for(&feed, &[north(), south()]),
        store.clone(),
        Scheduler::with_defaults(),
    )
    .unwrap();

    store.fail_next_commit(CommitStage::Flights).await;
    let err = pipeline.run_cycle().await.unwrap_err();
    assert!(matches!(err, PipelineError::Persistence(_)));
    assert_eq!(counts(&store).await, (0, 0, 0));
    assert_eq!(pipeline.consolidator().totals().failed_batches, 1);

    pipeline.run_cycle().await.unwrap();
    let mut plane_ids: Vec<i32> = store.planes().await.iter().map(|p| p.id).collect();
    plane_ids.sort();
    assert_eq!(plane_ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_sweep_closes_quiet_flights_and_new_frames_open_new_ones() {
    let feed = feed_with_three_planes().await;
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(
        &config_for(&feed, &[north(), south()]),
        store.clone(),
        Scheduler::with_defaults(),
    )
    .unwrap();

    pipeline.run_cycle().await.unwrap();

    // Feed timestamps are decades old
    let report = pipeline.sweep(1200).await.unwrap();
    assert_eq!(report.examined, 3);
    assert_eq!(report.closed, 3);
    assert_eq!(store.counts().await.unwrap().open_flights, 0);

    // Ended at the last point seen, not at sweep time
    let plane = store
        .planes()
        .await
        .into_iter()
        .find(|p| p.icao == "3C6444")
        .unwrap();
    let closed = store.flights().await;
    let flight = closed.iter().find(|f| f.plane_id == plane.id).unwrap();
    assert_eq!(flight.end_ts, Some(1_060));

    let report = pipeline.run_cycle().await.unwrap();
    assert_eq!(report.batch.planes_created, 0);
    assert_eq!(report.batch.flights_created, 3);
    assert_eq!(counts(&store).await, (3, 6, 12));
}

#[tokio::test]
async fn test_frames_are_uploaded_and_throughput_tracked() {
    let feed = feed_with_three_planes().await;
    let collector = FakeCollector::start().await;

    let mut config = config_for(&feed, &[north(), south()]);
    config.uploader.host = Some(collector.base_url());
    config.uploader.min_upload_count = 1;

    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(&config, store, Scheduler::with_defaults()).unwrap();
    let uploader = pipeline.uploader().unwrap().clone();

    let report = pipeline.run_cycle().await.unwrap();
    assert!(report.upload_scheduled);
    assert!(collector.wait_for_frames(6, Duration::from_secs(5)).await);

    let deadline = Instant::now() + Duration::from_secs(5);
    while (uploader.is_uploading() || uploader.uploaded_total() < 6) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(uploader.uploaded_total(), 6);
    assert_eq!(collector.uploads(), 1);
    assert_eq!(uploader.queue_len().await, 0);
    assert!(uploader.throughput().await.frames_per_ms > 0.0);

    let mut icaos = collector.icaos();
    icaos.sort();
    icaos.dedup();
    assert_eq!(icaos, vec!["3C6444", "4CA853", "AE1234"]);
}

#[tokio::test]
async fn test_scheduled_pipeline_runs_and_shuts_down() {
    let feed = feed_with_three_planes().await;
    let mut config = config_for(&feed, &[north(), south()]);
    config.schedule.poll_initial_delay_secs = 0;
    config.schedule.shutdown_timeout_secs = 5;

    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(&config, store.clone(), Scheduler::with_defaults()).unwrap();
    pipeline.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while store.counts().await.unwrap().points < 6 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(counts(&store).await, (3, 3, 6));

    assert!(pipeline.shutdown().await);
    assert_eq!(pipeline.start(), Err(SchedulingError::ShutDown));
}

#[test]
fn test_empty_area_list_is_rejected() {
    let mut config = aerotrack::config::PipelineConfig::default();
    config.areas.presets.clear();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    assert!(Pipeline::new(&config, store, Scheduler::with_defaults()).is_err());
}
