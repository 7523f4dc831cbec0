//! Parser for live-feed response bodies.
//!
//! A body is a JSON object. Besides a few envelope entries (`full_count`,
//! `version`, `stats`) every entry maps a feed-internal id to one aircraft
//! record, an array of columns in fixed order:
//!
//! | idx | column        | idx | column        |
//! |-----|---------------|-----|---------------|
//! | 0   | icao          | 10  | timestamp     |
//! | 1   | lat           | 11  | src airport   |
//! | 2   | lon           | 12  | dest airport  |
//! | 3   | heading       | 13  | flight number |
//! | 4   | altitude      | 14  | reserved      |
//! | 5   | groundspeed   | 15  | reserved      |
//! | 6   | squawk        | 16  | callsign      |
//! | 7   | tail number   | 17  | reserved      |
//! | 8   | plane type    | 18  | airline (opt) |
//! | 9   | registration  |     |               |

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::{debug, trace};

use crate::error::PipelineError;
use crate::frame::{Frame, UNKNOWN_MEASUREMENT, UNKNOWN_SQUAWK, non_blank};

/// Records with fewer columns than this are malformed; the airline column is optional
pub const MIN_FIELDS: usize = 18;

const ENVELOPE_KEYS: &[&str] = &["full_count", "version", "stats"];

/// Callsign and type fragments of military and government traffic
pub const MILITARY_FILTERS: &[&str] = &[
    "NATO", "LAGR", "FORTE", "DUKE", "MULE", "NCR", "JAKE", "BART", "RCH", "MMF", "VIVI", "CASA",
    "K35R", "Q4", "REDEYE", "UAV",
];

/// Substring filter over the raw text of a record.
///
/// An empty filter keeps everything; otherwise a record is kept when its raw
/// text contains at least one of the needles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    needles: Vec<String>,
}

impl RecordFilter {
    pub fn new<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            needles: needles
                .into_iter()
                .map(Into::into)
                .filter(|n: &String| !n.is_empty())
                .collect(),
        }
    }

    pub fn military() -> Self {
        Self::new(MILITARY_FILTERS.iter().copied())
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    pub fn matches(&self, raw: &str) -> bool {
        self.needles.is_empty() || self.needles.iter().any(|n| raw.contains(n.as_str()))
    }
}

/// Turns feed response bodies into [`Frame`] streams.
///
/// Cloning shares the malformed-record counter, so one deserializer can be
/// handed to every fetch task of a poll cycle.
#[derive(Debug, Clone, Default)]
pub struct FrameDeserializer {
    filter: Arc<RecordFilter>,
    malformed: Arc<AtomicU64>,
}

impl FrameDeserializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(filter: RecordFilter) -> Self {
        Self {
            filter: Arc::new(filter),
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total number of malformed records skipped by every stream of this deserializer
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Parse one response body.
    ///
    /// Fails only when the body as a whole is not a JSON object. Individual
    /// bad records are skipped while the returned stream is drained.
    pub fn parse(&self, body: &str) -> Result<FrameStream, PipelineError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| PipelineError::MalformedRecord(format!("response is not valid JSON: {}", e)))?;

        let Value::Object(map) = value else {
            return Err(PipelineError::MalformedRecord(
                "response is not a JSON object".to_string(),
            ));
        };

        Ok(FrameStream {
            records: map.into_iter(),
            filter: Arc::clone(&self.filter),
            malformed: Arc::clone(&self.malformed),
            skipped: 0,
        })
    }
}

/// Lazy, single-pass sequence of the frames in one response
pub struct FrameStream {
    records: serde_json::map::IntoIter,
    filter: Arc<RecordFilter>,
    malformed: Arc<AtomicU64>,
    skipped: u64,
}

impl FrameStream {
    /// Malformed records skipped so far by this stream
    pub fn malformed(&self) -> u64 {
        self.skipped
    }
}

impl Iterator for FrameStream {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        for (key, value) in self.records.by_ref() {
            if ENVELOPE_KEYS.contains(&key.as_str()) {
                continue;
            }

            if !self.filter.is_empty() && !self.filter.matches(&value.to_string()) {
                trace!("Record {} filtered out", key);
                metrics::counter!("deserializer.filtered_records_total").increment(1);
                continue;
            }

            match parse_record(&value) {
                Ok(frame) => {
                    metrics::counter!("deserializer.frames_parsed_total").increment(1);
                    return Some(frame);
                }
                Err(e) => {
                    debug!("Skipping record {}: {}", key, e);
                    self.skipped += 1;
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("deserializer.malformed_records_total").increment(1);
                }
            }
        }
        None
    }
}

fn malformed(msg: impl Into<String>) -> PipelineError {
    PipelineError::MalformedRecord(msg.into())
}

fn column(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        Value::Null => Cow::Borrowed(""),
        other => Cow::Owned(other.to_string()),
    }
}

fn parse_f64(name: &str, raw: &str) -> Result<f64, PipelineError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(malformed(format!("{} is missing", name)));
    }
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| malformed(format!("{} is not a number: '{}'", name, raw)))
}

fn parse_i64(name: &str, raw: &str) -> Result<i64, PipelineError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(malformed(format!("{} is missing", name)));
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Ok(v);
    }
    // The feed occasionally sends integral values as floats
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Ok(v as i64),
        _ => Err(malformed(format!("{} is not an integer: '{}'", name, raw))),
    }
}

/// Integer column whose blank value means "unknown"
fn parse_i32_or(name: &str, raw: &str, default: i32) -> Result<i32, PipelineError> {
    if raw.trim().is_empty() {
        return Ok(default);
    }
    let v = parse_i64(name, raw)?;
    i32::try_from(v).map_err(|_| malformed(format!("{} out of range: {}", name, v)))
}

fn parse_record(value: &Value) -> Result<Frame, PipelineError> {
    let cols = value
        .as_array()
        .ok_or_else(|| malformed("record is not an array"))?;
    if cols.len() < MIN_FIELDS {
        return Err(malformed(format!(
            "expected at least {} fields, got {}",
            MIN_FIELDS,
            cols.len()
        )));
    }
    let col = |i: usize| cols.get(i).map(column).unwrap_or(Cow::Borrowed(""));

    let icao = non_blank(&col(0)).ok_or_else(|| malformed("icao address is missing"))?;

    Ok(Frame {
        icao,
        lat: parse_f64("lat", &col(1))?,
        lon: parse_f64("lon", &col(2))?,
        heading: parse_i32_or("heading", &col(3), UNKNOWN_MEASUREMENT)?,
        altitude: parse_i32_or("altitude", &col(4), UNKNOWN_MEASUREMENT)?,
        groundspeed: parse_i32_or("groundspeed", &col(5), UNKNOWN_MEASUREMENT)?,
        squawk: parse_i32_or("squawk", &col(6), UNKNOWN_SQUAWK)?,
        tail_number: non_blank(&col(7)),
        plane_type: non_blank(&col(8)),
        registration: non_blank(&col(9)),
        timestamp: parse_i64("timestamp", &col(10))?,
        src_airport: non_blank(&col(11)),
        dest_airport: non_blank(&col(12)),
        flight_number: non_blank(&col(13)),
        callsign: non_blank(&col(16)),
        airline: non_blank(&col(18)),
    })
}
