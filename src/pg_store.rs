use anyhow::{Context, Result};
use async_trait::async_trait;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::{debug, info};

use crate::flights::OpenFlight;
use crate::flights_repo::FlightsRepository;
use crate::planes_repo::PlanesRepository;
use crate::store::{IdWatermarks, Identity, IdentityIndex, Store, StoreCounts, WriteBatch};
use crate::tracking_repo::TrackingRepository;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/");

pub fn create_pool(database_url: &str, max_size: u32) -> Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .max_size(max_size)
        .build(manager)
        .context("Failed to create database connection pool")
}

/// Apply pending embedded migrations, returning the names of those applied
pub async fn run_migrations(pool: &PgPool) -> Result<Vec<String>> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
        Ok::<Vec<String>, anyhow::Error>(applied.iter().map(|m| m.to_string()).collect())
    })
    .await?
}

/// Postgres-backed [`Store`]
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    planes: PlanesRepository,
    flights: FlightsRepository,
    tracking: TrackingRepository,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            planes: PlanesRepository::new(pool.clone()),
            flights: FlightsRepository::new(pool.clone()),
            tracking: TrackingRepository::new(pool.clone()),
            pool,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn planes(&self) -> &PlanesRepository {
        &self.planes
    }

    pub fn flights(&self) -> &FlightsRepository {
        &self.flights
    }

    pub fn tracking(&self) -> &TrackingRepository {
        &self.tracking
    }
}

#[async_trait]
impl Store for PgStore {
    async fn load_identity_index(&self) -> Result<IdentityIndex> {
        let pool = self.pool.clone();

        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let rows = PlanesRepository::identity_rows(&mut conn)?;
            Ok::<_, anyhow::Error>(rows)
        })
        .await??;

        Ok(rows
            .into_iter()
            .map(|(icao, plane_id, open_flight_id)| {
                (
                    icao,
                    Identity {
                        plane_id,
                        open_flight_id,
                    },
                )
            })
            .collect())
    }

    async fn id_watermarks(&self) -> Result<IdWatermarks> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            Ok::<_, anyhow::Error>(IdWatermarks {
                plane_id: PlanesRepository::max_id(&mut conn)?,
                flight_id: FlightsRepository::max_id(&mut conn)?,
            })
        })
        .await?
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            conn.transaction::<_, anyhow::Error, _>(|conn| {
                let WriteBatch {
                    planes,
                    flights,
                    points,
                } = batch;

                let planes_inserted =
                    PlanesRepository::insert_planes(conn, planes).context("Failed to insert planes")?;
                let flights_inserted = FlightsRepository::insert_flights(conn, flights)
                    .context("Failed to insert flights")?;
                let points_inserted = TrackingRepository::insert_points(conn, points)
                    .context("Failed to insert tracking points")?;

                debug!(
                    "Committed {} planes, {} flights, {} points",
                    planes_inserted, flights_inserted, points_inserted
                );
                Ok(())
            })
        })
        .await?
    }

    async fn open_flights_with_last_seen(&self) -> Result<Vec<OpenFlight>> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let flights = FlightsRepository::open_flights_with_last_seen(&mut conn)?;
            Ok::<_, anyhow::Error>(flights)
        })
        .await?
    }

    async fn close_flight(&self, flight_id: i32, end_ts: i64) -> Result<bool> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let closed = FlightsRepository::close_flight(&mut conn, flight_id, end_ts)?;
            Ok::<_, anyhow::Error>(closed)
        })
        .await?
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            Ok::<_, anyhow::Error>(StoreCounts {
                planes: PlanesRepository::count(&mut conn)?,
                flights: FlightsRepository::count(&mut conn)?,
                open_flights: FlightsRepository::count_open(&mut conn)?,
                points: TrackingRepository::count(&mut conn)?,
            })
        })
        .await?
    }
}

/// Connect, migrate and wrap the pool in a store
pub async fn connect(database_url: &str, max_size: u32) -> Result<PgStore> {
    let pool = create_pool(database_url, max_size)?;
    let applied = run_migrations(&pool).await?;
    if !applied.is_empty() {
        info!("Applied {} migration(s)", applied.len());
    }
    Ok(PgStore::new(pool))
}
