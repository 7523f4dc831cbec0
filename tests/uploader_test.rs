mod common;

use std::time::{Duration, Instant};

use aerotrack::config::UploaderConfig;
use aerotrack::frame::Frame;
use aerotrack::scheduler::Scheduler;
use aerotrack::uploader::Uploader;
use common::FakeCollector;

fn frames(icaos: &[&str]) -> Vec<Frame> {
    icaos.iter().map(|icao| Frame::new(*icao, 50.0, 7.0, 1_000)).collect()
}

#[tokio::test]
async fn test_frames_queued_during_upload_are_sent_when_it_finishes() {
    let collector = FakeCollector::start_slow(Duration::from_millis(300)).await;
    let config = UploaderConfig {
        min_upload_count: 2,
        request_timeout_secs: 5,
        ..Default::default()
    };
    let uploader = Uploader::new(&collector.base_url(), config, Scheduler::with_defaults()).unwrap();

    assert!(uploader.add_frames(frames(&["3C6444", "4CA853"])).await.unwrap());

    // The first upload has taken its frames and is waiting on the collector
    let deadline = Instant::now() + Duration::from_secs(2);
    while uploader.queue_len().await > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(uploader.is_uploading());
    assert!(!uploader.add_frames(frames(&["AE1234", "400A1B"])).await.unwrap());

    // No further frames are added: the running task picks these up
    assert!(collector.wait_for_frames(4, Duration::from_secs(5)).await);
    let deadline = Instant::now() + Duration::from_secs(5);
    while (uploader.is_uploading() || uploader.uploaded_total() < 4) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(uploader.uploaded_total(), 4);
    assert_eq!(collector.uploads(), 2);
    assert_eq!(uploader.queue_len().await, 0);
}

#[tokio::test]
async fn test_queue_below_minimum_waits_after_upload() {
    let collector = FakeCollector::start_slow(Duration::from_millis(200)).await;
    let config = UploaderConfig {
        min_upload_count: 2,
        request_timeout_secs: 5,
        ..Default::default()
    };
    let uploader = Uploader::new(&collector.base_url(), config, Scheduler::with_defaults()).unwrap();

    assert!(uploader.add_frames(frames(&["3C6444", "4CA853"])).await.unwrap());
    let deadline = Instant::now() + Duration::from_secs(2);
    while uploader.queue_len().await > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!uploader.add_frames(frames(&["AE1234"])).await.unwrap());

    let deadline = Instant::now() + Duration::from_secs(5);
    while (uploader.is_uploading() || uploader.uploaded_total() < 2) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(uploader.uploaded_total(), 2);
    assert_eq!(collector.uploads(), 1);
    assert_eq!(uploader.queue_len().await, 1);
}
