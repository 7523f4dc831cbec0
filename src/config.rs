use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::area::{Area, AreaError, AreaPreset};
use crate::frame_deserializer::RecordFilter;
use crate::scheduler::SchedulerConfig;

pub const DEFAULT_FEED_URL: &str = "https://data-live.flightradar24.com/zones/fcgi/feed.js";
/// The feed answers 451 to requests without a browser-like agent
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:78.0) Gecko/20100101 Firefox/78.0";

/// Top-level configuration file structure
///
/// Every field has a default, so an empty or partial file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Postgres connection string; `DATABASE_URL` takes precedence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub feed: FeedConfig,
    pub schedule: ScheduleConfig,
    pub scheduler: SchedulerSettings,
    pub uploader: UploaderConfig,
    pub areas: AreasConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Oldest position age the feed should return
    pub max_age_secs: u64,
    pub request_timeout_secs: u64,
    /// Area fetches allowed in flight at once within one poll cycle
    pub concurrency: usize,
    /// Upper bound for a whole poll cycle; frames collected so far are kept
    pub cycle_timeout_secs: u64,
    /// Keep only records whose raw text contains one of these
    pub filters: Vec<String>,
    /// Add the built-in military callsign filters
    pub military_only: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_FEED_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_age_secs: 14_400,
            request_timeout_secs: 10,
            concurrency: 8,
            cycle_timeout_secs: 60,
            filters: Vec::new(),
            military_only: false,
        }
    }
}

impl FeedConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn record_filter(&self) -> RecordFilter {
        let mut needles = self.filters.clone();
        if self.military_only {
            needles.extend(
                crate::frame_deserializer::MILITARY_FILTERS
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        RecordFilter::new(needles)
    }
}

/// Cadence of the periodic pipeline tasks, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub poll_period_secs: i64,
    pub poll_initial_delay_secs: i64,
    pub keeper_period_secs: i64,
    pub keeper_initial_delay_secs: i64,
    /// Flights silent for longer than this are closed
    pub staleness_threshold_secs: i64,
    pub process_metrics_period_secs: i64,
    /// Grace period for a clean shutdown before tasks are aborted
    pub shutdown_timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_period_secs: 120,
            poll_initial_delay_secs: 0,
            keeper_period_secs: 400,
            keeper_initial_delay_secs: 100,
            staleness_threshold_secs: 1200,
            process_metrics_period_secs: 20,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub pool_size: usize,
    pub task_timeout_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            pool_size: crate::scheduler::DEFAULT_POOL_SIZE,
            task_timeout_secs: crate::scheduler::DEFAULT_TASK_TIMEOUT.as_secs(),
        }
    }
}

impl SchedulerSettings {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            pool_size: self.pool_size,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Upload host; the uploader is disabled while this is unset.
    /// `AEROTRACK_UPLOAD_HOST` takes precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
    /// Queue size that triggers an upload
    pub min_upload_count: usize,
    /// Put frames of a failed upload back into the queue instead of dropping them
    pub requeue_on_failure: bool,
    /// Recent upload errors kept for inspection
    pub error_queue_capacity: usize,
    pub request_timeout_secs: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 8080,
            min_upload_count: 500,
            requeue_on_failure: false,
            error_queue_capacity: 100,
            request_timeout_secs: 30,
        }
    }
}

impl UploaderConfig {
    /// Base URL of the upload endpoint, if a host is configured.
    /// A host that already carries a scheme is used as-is.
    pub fn base_url(&self) -> Option<String> {
        let host = self.host.as_deref()?.trim();
        if host.is_empty() {
            return None;
        }
        if host.starts_with("http://") || host.starts_with("https://") {
            Some(host.trim_end_matches('/').to_string())
        } else {
            Some(format!("http://{}:{}", host, self.port))
        }
    }
}

/// One explicit bounding box in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaBox {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lat_top_left: f64,
    pub lat_bottom_right: f64,
    pub lon_top_left: f64,
    pub lon_bottom_right: f64,
}

/// A box split into equally sized tiles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub top_left: (f64, f64),
    pub bottom_right: (f64, f64),
    pub rows: usize,
    pub cols: usize,
}

/// Areas polled every cycle: the union of the presets, boxes and grid
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AreasConfig {
    pub presets: Vec<AreaPreset>,
    pub boxes: Vec<AreaBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<GridConfig>,
}

impl Default for AreasConfig {
    fn default() -> Self {
        Self {
            presets: vec![AreaPreset::Germany],
            boxes: Vec::new(),
            grid: None,
        }
    }
}

impl AreasConfig {
    pub fn resolve(&self) -> Result<Vec<Area>, AreaError> {
        let mut areas = Vec::new();
        for preset in &self.presets {
            areas.extend(preset.areas()?);
        }
        for b in &self.boxes {
            let area = Area::new(
                b.lat_top_left,
                b.lat_bottom_right,
                b.lon_top_left,
                b.lon_bottom_right,
            )?;
            areas.push(match &b.name {
                Some(name) => area.with_name(name.clone()),
                None => area,
            });
        }
        if let Some(grid) = &self.grid {
            areas.extend(Area::grid(
                grid.top_left,
                grid.bottom_right,
                grid.rows,
                grid.cols,
            )?);
        }
        Ok(areas)
    }
}

impl PipelineConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: PipelineConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    /// Load the file if one is given, then apply environment overrides
    pub fn from_sources(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(host) = lookup("AEROTRACK_UPLOAD_HOST").filter(|v| !v.is_empty()) {
            self.uploader.host = Some(host);
        }
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is not set and no database_url is configured")
    }
}
