//! Persistence interface of the pipeline.
//!
//! The consolidator and keeper only talk to a [`Store`]; `PgStore` backs it
//! with Postgres and `MemoryStore` keeps everything in process.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::flights::{Flight, OpenFlight};
use crate::planes::Plane;
use crate::tracking::TrackingPoint;

/// Surrogate keys known for one ICAO address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub plane_id: i32,
    pub open_flight_id: Option<i32>,
}

/// ICAO address to plane id and open flight id
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    entries: HashMap<String, Identity>,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, icao: &str) -> Option<Identity> {
        self.entries.get(icao).copied()
    }

    pub fn insert(&mut self, icao: impl Into<String>, identity: Identity) {
        self.entries.insert(icao.into(), identity);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Identity)> for IdentityIndex {
    fn from_iter<I: IntoIterator<Item = (String, Identity)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Highest plane and flight ids currently persisted (0 for an empty table)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdWatermarks {
    pub plane_id: i32,
    pub flight_id: i32,
}

/// Rows produced by one consolidation batch, committed together in
/// dependency order
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub planes: Vec<Plane>,
    pub flights: Vec<Flight>,
    pub points: Vec<TrackingPoint>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.planes.is_empty() && self.flights.is_empty() && self.points.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub planes: i64,
    pub flights: i64,
    pub open_flights: i64,
    pub points: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Every known ICAO address with its plane id and open flight, if any
    async fn load_identity_index(&self) -> Result<IdentityIndex>;

    async fn id_watermarks(&self) -> Result<IdWatermarks>;

    /// Insert planes, then flights, then tracking points. Either every row
    /// of the batch is stored or none is.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    async fn open_flights_with_last_seen(&self) -> Result<Vec<OpenFlight>>;

    /// Set the end timestamp of an open flight. Returns false if the flight
    /// does not exist or is already closed.
    async fn close_flight(&self, flight_id: i32, end_ts: i64) -> Result<bool>;

    async fn counts(&self) -> Result<StoreCounts>;
}
