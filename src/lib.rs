//! aerotrack - live aircraft telemetry ingestion
//!
//! Polls a live flight feed area by area, reconciles the frames against known
//! planes and flights, stores tracking points in Postgres, closes flights that
//! go quiet and optionally re-publishes the frames to a collector.

pub mod area;
pub mod area_poller;
pub mod config;
pub mod consolidator;
pub mod error;
pub mod flights;
pub mod flights_repo;
pub mod frame;
pub mod frame_deserializer;
pub mod instance_lock;
pub mod keeper;
pub mod logging;
pub mod memory_store;
pub mod metrics;
pub mod pg_store;
pub mod pipeline;
pub mod planes;
pub mod planes_repo;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod tracking;
pub mod tracking_repo;
pub mod uploader;

pub use area::{Area, AreaPreset};
pub use consolidator::{BatchSummary, Consolidator};
pub use error::{PipelineError, SchedulingError};
pub use frame::Frame;
pub use keeper::Keeper;
pub use pipeline::Pipeline;
pub use scheduler::Scheduler;
pub use store::Store;
