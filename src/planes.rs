use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::frame::{Frame, or_unknown};

/// An aircraft, identified by its ICAO address.
/// Created once when the address is first seen and never updated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plane {
    pub id: i32,
    pub icao: String,
    pub tail_number: String,
    pub registration: String,
    pub plane_type: String,
    pub airline: String,
}

impl Plane {
    pub fn from_frame(id: i32, frame: &Frame) -> Self {
        Self {
            id,
            icao: frame.icao.clone(),
            tail_number: or_unknown(frame.tail_number.as_ref()),
            registration: or_unknown(frame.registration.as_ref()),
            plane_type: or_unknown(frame.plane_type.as_ref()),
            airline: or_unknown(frame.airline.as_ref()),
        }
    }
}

/// Diesel model for the planes table
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::planes)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PlaneModel {
    pub id: i32,
    pub icao: String,
    pub tailnr: String,
    pub registration: String,
    pub type_: String,
    pub airline: String,
}

impl From<Plane> for PlaneModel {
    fn from(plane: Plane) -> Self {
        Self {
            id: plane.id,
            icao: plane.icao,
            tailnr: plane.tail_number,
            registration: plane.registration,
            type_: plane.plane_type,
            airline: plane.airline,
        }
    }
}

impl From<PlaneModel> for Plane {
    fn from(model: PlaneModel) -> Self {
        Self {
            id: model.id,
            icao: model.icao,
            tail_number: model.tailnr,
            registration: model.registration,
            plane_type: model.type_,
            airline: model.airline,
        }
    }
}
