use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::flights::{Flight, OpenFlight};
use crate::planes::Plane;
use crate::store::{IdWatermarks, Identity, IdentityIndex, Store, StoreCounts, WriteBatch};
use crate::tracking::TrackingPoint;

/// Insert stage of a commit, used to inject failures in tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStage {
    Planes,
    Flights,
    Points,
}

#[derive(Default)]
struct Tables {
    planes: BTreeMap<i32, Plane>,
    flights: BTreeMap<i32, Flight>,
    points: Vec<TrackingPoint>,
    plane_by_icao: HashMap<String, i32>,
    open_by_plane: HashMap<i32, i32>,
    last_seen: HashMap<i32, i64>,
    fail_next: Option<CommitStage>,
}

/// In-process [`Store`] with the same constraints as the Postgres schema:
/// unique ids and ICAO addresses, valid references and at most one open
/// flight per plane. A commit that violates any of them changes nothing.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail when it reaches `stage`
    pub async fn fail_next_commit(&self, stage: CommitStage) {
        self.tables.lock().await.fail_next = Some(stage);
    }

    pub async fn planes(&self) -> Vec<Plane> {
        self.tables.lock().await.planes.values().cloned().collect()
    }

    pub async fn flights(&self) -> Vec<Flight> {
        self.tables.lock().await.flights.values().cloned().collect()
    }

    pub async fn points(&self) -> Vec<TrackingPoint> {
        self.tables.lock().await.points.clone()
    }
}

/// Check a batch against the current tables without modifying them
fn validate(tables: &Tables, batch: &WriteBatch, fault: Option<CommitStage>) -> Result<()> {
    if fault == Some(CommitStage::Planes) {
        bail!("injected failure while inserting planes");
    }
    let mut staged_planes = HashSet::new();
    let mut staged_icaos = HashSet::new();
    for plane in &batch.planes {
        if tables.planes.contains_key(&plane.id) || !staged_planes.insert(plane.id) {
            bail!("duplicate plane id {}", plane.id);
        }
        if tables.plane_by_icao.contains_key(&plane.icao) || !staged_icaos.insert(plane.icao.as_str()) {
            bail!("duplicate icao address {}", plane.icao);
        }
    }

    if fault == Some(CommitStage::Flights) {
        bail!("injected failure while inserting flights");
    }
    let mut staged_flights = HashSet::new();
    let mut staged_open = HashSet::new();
    for flight in &batch.flights {
        if tables.flights.contains_key(&flight.id) || !staged_flights.insert(flight.id) {
            bail!("duplicate flight id {}", flight.id);
        }
        if !tables.planes.contains_key(&flight.plane_id) && !staged_planes.contains(&flight.plane_id) {
            bail!("flight {} references unknown plane {}", flight.id, flight.plane_id);
        }
        if flight.is_open()
            && (tables.open_by_plane.contains_key(&flight.plane_id) || !staged_open.insert(flight.plane_id))
        {
            bail!("plane {} already has an open flight", flight.plane_id);
        }
    }

    if fault == Some(CommitStage::Points) {
        bail!("injected failure while inserting tracking points");
    }
    for point in &batch.points {
        if !tables.flights.contains_key(&point.flight_id) && !staged_flights.contains(&point.flight_id) {
            bail!("tracking point references unknown flight {}", point.flight_id);
        }
    }
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_identity_index(&self) -> Result<IdentityIndex> {
        let tables = self.tables.lock().await;
        Ok(tables
            .plane_by_icao
            .iter()
            .map(|(icao, &plane_id)| {
                (
                    icao.clone(),
                    Identity {
                        plane_id,
                        open_flight_id: tables.open_by_plane.get(&plane_id).copied(),
                    },
                )
            })
            .collect())
    }

    async fn id_watermarks(&self) -> Result<IdWatermarks> {
        let tables = self.tables.lock().await;
        Ok(IdWatermarks {
            plane_id: tables.planes.keys().next_back().copied().unwrap_or(0),
            flight_id: tables.flights.keys().next_back().copied().unwrap_or(0),
        })
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let fault = tables.fail_next.take();
        validate(&tables, &batch, fault)?;

        for plane in batch.planes {
            tables.plane_by_icao.insert(plane.icao.clone(), plane.id);
            tables.planes.insert(plane.id, plane);
        }
        for flight in batch.flights {
            if flight.is_open() {
                tables.open_by_plane.insert(flight.plane_id, flight.id);
            }
            tables.flights.insert(flight.id, flight);
        }
        for point in batch.points {
            let last = tables.last_seen.entry(point.flight_id).or_insert(point.timestamp);
            *last = (*last).max(point.timestamp);
            tables.points.push(point);
        }
        Ok(())
    }

    async fn open_flights_with_last_seen(&self) -> Result<Vec<OpenFlight>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .flights
            .values()
            .filter(|f| f.is_open())
            .map(|f| OpenFlight {
                flight_id: f.id,
                plane_id: f.plane_id,
                last_seen: tables.last_seen.get(&f.id).copied().unwrap_or(f.start_ts),
            })
            .collect())
    }

    async fn close_flight(&self, flight_id: i32, end_ts: i64) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(flight) = tables.flights.get_mut(&flight_id) else {
            return Ok(false);
        };
        if !flight.is_open() {
            return Ok(false);
        }
        flight.end_ts = Some(end_ts);
        let plane_id = flight.plane_id;
        tables.open_by_plane.remove(&plane_id);
        Ok(true)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let tables = self.tables.lock().await;
        Ok(StoreCounts {
            planes: tables.planes.len() as i64,
            flights: tables.flights.len() as i64,
            open_flights: tables.open_by_plane.len() as i64,
            points: tables.points.len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn batch_for(icao: &str, plane_id: i32, flight_id: i32, ts: i64) -> WriteBatch {
        let frame = Frame::new(icao, 50.0, 7.0, ts);
        WriteBatch {
            planes: vec![Plane::from_frame(plane_id, &frame)],
            flights: vec![Flight::from_frame(flight_id, plane_id, &frame)],
            points: vec![TrackingPoint::from_frame(flight_id, &frame)],
        }
    }

    #[tokio::test]
    async fn test_commit_and_identity_index() {
        let store = MemoryStore::new();
        store.commit(batch_for("3C6444", 1, 1, 100)).await.unwrap();

        let index = store.load_identity_index().await.unwrap();
        assert_eq!(
            index.get("3C6444"),
            Some(Identity {
                plane_id: 1,
                open_flight_id: Some(1)
            })
        );
        assert_eq!(
            store.id_watermarks().await.unwrap(),
            IdWatermarks {
                plane_id: 1,
                flight_id: 1
            }
        );
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_store_untouched() {
        let store = MemoryStore::new();
        store.fail_next_commit(CommitStage::Points).await;

        assert!(store.commit(batch_for("3C6444", 1, 1, 100)).await.is_err());
        assert_eq!(store.counts().await.unwrap(), StoreCounts::default());

        // The fault only applies once
        store.commit(batch_for("3C6444", 1, 1, 100)).await.unwrap();
        assert_eq!(store.counts().await.unwrap().points, 1);
    }

    #[tokio::test]
    async fn test_constraint_violations_roll_back() {
        let store = MemoryStore::new();
        store.commit(batch_for("3C6444", 1, 1, 100)).await.unwrap();

        // Same predicted ids again
        assert!(store.commit(batch_for("4CA853", 1, 1, 100)).await.is_err());

        // Second open flight for an existing plane
        let frame = Frame::new("3C6444", 50.0, 7.0, 200);
        let second_open = WriteBatch {
            planes: vec![],
            flights: vec![Flight::from_frame(2, 1, &frame)],
            points: vec![],
        };
        assert!(store.commit(second_open).await.is_err());

        // Point for a flight that does not exist
        let orphan = WriteBatch {
            points: vec![TrackingPoint::from_frame(99, &frame)],
            ..Default::default()
        };
        assert!(store.commit(orphan).await.is_err());

        let counts = store.counts().await.unwrap();
        assert_eq!((counts.planes, counts.flights, counts.points), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_close_flight_and_last_seen() {
        let store = MemoryStore::new();
        let mut batch = batch_for("3C6444", 1, 1, 100);
        let later = Frame::new("3C6444", 50.1, 7.1, 160);
        batch.points.push(TrackingPoint::from_frame(1, &later));
        store.commit(batch).await.unwrap();

        let open = store.open_flights_with_last_seen().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].last_seen, 160);

        assert!(store.close_flight(1, 160).await.unwrap());
        assert!(!store.close_flight(1, 170).await.unwrap());
        assert!(!store.close_flight(42, 170).await.unwrap());
        assert!(store.open_flights_with_last_seen().await.unwrap().is_empty());
        assert_eq!(store.flights().await[0].end_ts, Some(160));

        let index = store.load_identity_index().await.unwrap();
        assert_eq!(index.get("3C6444").and_then(|i| i.open_flight_id), None);
    }
}
