use anyhow::Result;
use diesel::prelude::*;

use crate::pg_store::PgPool;
use crate::planes::{Plane, PlaneModel};

/// Rows per INSERT statement, well below Postgres' bind parameter limit
const BATCH_SIZE: usize = 1000;

#[derive(Clone)]
pub struct PlanesRepository {
    pool: PgPool,
}

impl PlanesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert planes on an existing connection, so callers can group the
    /// insert with other writes in one transaction
    pub(crate) fn insert_planes(conn: &mut PgConnection, new_planes: Vec<Plane>) -> QueryResult<usize> {
        use crate::schema::planes;

        let models: Vec<PlaneModel> = new_planes.into_iter().map(PlaneModel::from).collect();
        let mut inserted = 0;
        for batch in models.chunks(BATCH_SIZE) {
            inserted += diesel::insert_into(planes::table)
                .values(batch)
                .execute(conn)?;
        }
        Ok(inserted)
    }

    /// Every plane's ICAO address and id, with the id of its open flight if any
    pub(crate) fn identity_rows(conn: &mut PgConnection) -> QueryResult<Vec<(String, i32, Option<i32>)>> {
        use crate::schema::{flights, planes};

        planes::table
            .left_join(
                flights::table.on(flights::plane_id
                    .eq(planes::id)
                    .and(flights::end_ts.is_null())),
            )
            .select((planes::icao, planes::id, flights::id.nullable()))
            .load(conn)
    }

    pub(crate) fn max_id(conn: &mut PgConnection) -> QueryResult<i32> {
        use crate::schema::planes::dsl::*;

        let max: Option<i32> = planes.select(diesel::dsl::max(id)).first(conn)?;
        Ok(max.unwrap_or(0))
    }

    pub(crate) fn count(conn: &mut PgConnection) -> QueryResult<i64> {
        use crate::schema::planes::dsl::*;

        planes.count().get_result(conn)
    }

    /// Get a plane by its ICAO address
    pub async fn get_plane_by_icao(&self, icao_address: &str) -> Result<Option<Plane>> {
        use crate::schema::planes::dsl::*;

        let pool = self.pool.clone();
        let icao_address = icao_address.to_string();

        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let model: Option<PlaneModel> = planes
                .filter(icao.eq(icao_address))
                .select(PlaneModel::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<PlaneModel>, anyhow::Error>(model)
        })
        .await??;

        Ok(result.map(Plane::from))
    }
}
