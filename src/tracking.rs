use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// One positional sample of a flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingPoint {
    pub flight_id: i32,
    pub lat: f64,
    pub lon: f64,
    pub altitude: i32,
    pub groundspeed: i32,
    pub heading: i32,
    pub squawk: i32,
    pub timestamp: i64,
}

impl TrackingPoint {
    pub fn from_frame(flight_id: i32, frame: &Frame) -> Self {
        Self {
            flight_id,
            lat: frame.lat,
            lon: frame.lon,
            altitude: frame.altitude,
            groundspeed: frame.groundspeed,
            heading: frame.heading,
            squawk: frame.squawk,
            timestamp: frame.timestamp,
        }
    }
}

/// Diesel model for reading the tracking table
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::tracking)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TrackingPointModel {
    pub id: i64,
    pub flight_id: i32,
    pub lat: f64,
    pub lon: f64,
    pub altitude: i32,
    pub groundspeed: i32,
    pub heading: i32,
    pub squawk: i32,
    pub timestamp: i64,
}

/// Insert model for tracking points; the id is generated by the database
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::tracking)]
pub struct NewTrackingPointModel {
    pub flight_id: i32,
    pub lat: f64,
    pub lon: f64,
    pub altitude: i32,
    pub groundspeed: i32,
    pub heading: i32,
    pub squawk: i32,
    pub timestamp: i64,
}

impl From<TrackingPoint> for NewTrackingPointModel {
    fn from(point: TrackingPoint) -> Self {
        Self {
            flight_id: point.flight_id,
            lat: point.lat,
            lon: point.lon,
            altitude: point.altitude,
            groundspeed: point.groundspeed,
            heading: point.heading,
            squawk: point.squawk,
            timestamp: point.timestamp,
        }
    }
}

impl From<TrackingPointModel> for TrackingPoint {
    fn from(model: TrackingPointModel) -> Self {
        Self {
            flight_id: model.flight_id,
            lat: model.lat,
            lon: model.lon,
            altitude: model.altitude,
            groundspeed: model.groundspeed,
            heading: model.heading,
            squawk: model.squawk,
            timestamp: model.timestamp,
        }
    }
}
