use anyhow::Result;
use diesel::prelude::*;

use crate::pg_store::PgPool;
use crate::tracking::{NewTrackingPointModel, TrackingPoint, TrackingPointModel};

/// 8 bind parameters per row
const BATCH_SIZE: usize = 5000;

#[derive(Clone)]
pub struct TrackingRepository {
    pool: PgPool,
}

impl TrackingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert points in the given order on an existing connection
    pub(crate) fn insert_points(conn: &mut PgConnection, points: Vec<TrackingPoint>) -> QueryResult<usize> {
        use crate::schema::tracking;

        let models: Vec<NewTrackingPointModel> =
            points.into_iter().map(NewTrackingPointModel::from).collect();
        let mut inserted = 0;
        for batch in models.chunks(BATCH_SIZE) {
            inserted += diesel::insert_into(tracking::table)
                .values(batch)
                .execute(conn)?;
        }
        Ok(inserted)
    }

    pub(crate) fn count(conn: &mut PgConnection) -> QueryResult<i64> {
        use crate::schema::tracking::dsl::*;

        tracking.count().get_result(conn)
    }

    /// Points of one flight in insertion order
    pub async fn get_points_for_flight(&self, flight: i32) -> Result<Vec<TrackingPoint>> {
        use crate::schema::tracking::dsl::*;

        let pool = self.pool.clone();

        let results = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let models: Vec<TrackingPointModel> = tracking
                .filter(flight_id.eq(flight))
                .order(id.asc())
                .select(TrackingPointModel::as_select())
                .load(&mut conn)?;

            Ok::<Vec<TrackingPointModel>, anyhow::Error>(models)
        })
        .await??;

        Ok(results.into_iter().map(TrackingPoint::from).collect())
    }
}
