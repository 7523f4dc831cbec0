use anyhow::Result;
use diesel::prelude::*;
use diesel::sql_types::{Int4, Int8};

use crate::flights::{Flight, FlightModel, OpenFlight};
use crate::pg_store::PgPool;

const BATCH_SIZE: usize = 1000;

#[derive(QueryableByName, Debug)]
struct OpenFlightRow {
    #[diesel(sql_type = Int4)]
    flight_id: i32,
    #[diesel(sql_type = Int4)]
    plane_id: i32,
    #[diesel(sql_type = Int8)]
    last_seen: i64,
}

#[derive(Clone)]
pub struct FlightsRepository {
    pool: PgPool,
}

impl FlightsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) fn insert_flights(conn: &mut PgConnection, new_flights: Vec<Flight>) -> QueryResult<usize> {
        use crate::schema::flights;

        let models: Vec<FlightModel> = new_flights.into_iter().map(FlightModel::from).collect();
        let mut inserted = 0;
        for batch in models.chunks(BATCH_SIZE) {
            inserted += diesel::insert_into(flights::table)
                .values(batch)
                .execute(conn)?;
        }
        Ok(inserted)
    }

    /// Open flights joined with the timestamp of their latest tracking point.
    /// Flights without any point report their start time.
    pub(crate) fn open_flights_with_last_seen(conn: &mut PgConnection) -> QueryResult<Vec<OpenFlight>> {
        let rows: Vec<OpenFlightRow> = diesel::sql_query(
            "SELECT f.id AS flight_id, f.plane_id, COALESCE(MAX(t.timestamp), f.start_ts) AS last_seen \
             FROM flights f \
             LEFT JOIN tracking t ON t.flight_id = f.id \
             WHERE f.end_ts IS NULL \
             GROUP BY f.id, f.plane_id, f.start_ts \
             ORDER BY f.id",
        )
        .load(conn)?;

        Ok(rows
            .into_iter()
            .map(|row| OpenFlight {
                flight_id: row.flight_id,
                plane_id: row.plane_id,
                last_seen: row.last_seen,
            })
            .collect())
    }

    pub(crate) fn close_flight(conn: &mut PgConnection, flight_id: i32, end: i64) -> QueryResult<bool> {
        use crate::schema::flights::dsl::*;

        let rows = diesel::update(flights.filter(id.eq(flight_id)).filter(end_ts.is_null()))
            .set(end_ts.eq(Some(end)))
            .execute(conn)?;
        Ok(rows > 0)
    }

    pub(crate) fn max_id(conn: &mut PgConnection) -> QueryResult<i32> {
        use crate::schema::flights::dsl::*;

        let max: Option<i32> = flights.select(diesel::dsl::max(id)).first(conn)?;
        Ok(max.unwrap_or(0))
    }

    pub(crate) fn count(conn: &mut PgConnection) -> QueryResult<i64> {
        use crate::schema::flights::dsl::*;

        flights.count().get_result(conn)
    }

    pub(crate) fn count_open(conn: &mut PgConnection) -> QueryResult<i64> {
        use crate::schema::flights::dsl::*;

        flights.filter(end_ts.is_null()).count().get_result(conn)
    }

    /// Get a flight by its ID
    pub async fn get_flight_by_id(&self, flight_id: i32) -> Result<Option<Flight>> {
        use crate::schema::flights::dsl::*;

        let pool = self.pool.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let flight_model: Option<FlightModel> = flights
                .filter(id.eq(flight_id))
                .select(FlightModel::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<FlightModel>, anyhow::Error>(flight_model)
        })
        .await??;

        Ok(result.map(Flight::from))
    }

    /// All flights of a plane, most recent first
    pub async fn get_flights_for_plane(&self, plane: i32) -> Result<Vec<Flight>> {
        use crate::schema::flights::dsl::*;

        let pool = self.pool.clone();

        let results = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let models: Vec<FlightModel> = flights
                .filter(plane_id.eq(plane))
                .order(start_ts.desc())
                .select(FlightModel::as_select())
                .load(&mut conn)?;

            Ok::<Vec<FlightModel>, anyhow::Error>(models)
        })
        .await??;

        Ok(results.into_iter().map(Flight::from).collect())
    }
}
