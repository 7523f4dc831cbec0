use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::frame::{Frame, or_unknown};

/// A flight of one plane. Open (live) while `end_ts` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flight {
    pub id: i32,
    pub plane_id: i32,
    pub src_airport: String,
    pub dest_airport: String,
    pub flight_number: String,
    pub callsign: String,
    /// Epoch seconds of the first observation
    pub start_ts: i64,
    /// Epoch seconds of the last observation once the flight is closed
    pub end_ts: Option<i64>,
}

impl Flight {
    /// Open flight started by `frame`
    pub fn from_frame(id: i32, plane_id: i32, frame: &Frame) -> Self {
        Self {
            id,
            plane_id,
            src_airport: or_unknown(frame.src_airport.as_ref()),
            dest_airport: or_unknown(frame.dest_airport.as_ref()),
            flight_number: or_unknown(frame.flight_number.as_ref()),
            callsign: or_unknown(frame.callsign.as_ref()),
            start_ts: frame.timestamp,
            end_ts: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_ts.is_none()
    }
}

/// An open flight with the timestamp of its most recent tracking point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlight {
    pub flight_id: i32,
    pub plane_id: i32,
    /// Latest tracking timestamp, or the start time for a flight without points
    pub last_seen: i64,
}

/// Diesel model for the flights table
#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::flights)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct FlightModel {
    pub id: i32,
    pub plane_id: i32,
    pub src: String,
    pub dest: String,
    pub flightnr: String,
    pub callsign: String,
    pub start_ts: i64,
    pub end_ts: Option<i64>,
}

impl From<Flight> for FlightModel {
    fn from(flight: Flight) -> Self {
        Self {
            id: flight.id,
            plane_id: flight.plane_id,
            src: flight.src_airport,
            dest: flight.dest_airport,
            flightnr: flight.flight_number,
            callsign: flight.callsign,
            start_ts: flight.start_ts,
            end_ts: flight.end_ts,
        }
    }
}

impl From<FlightModel> for Flight {
    fn from(model: FlightModel) -> Self {
        Self {
            id: model.id,
            plane_id: model.plane_id,
            src_airport: model.src,
            dest_airport: model.dest,
            flight_number: model.flightnr,
            callsign: model.callsign,
            start_ts: model.start_ts,
            end_ts: model.end_ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::UNKNOWN;

    #[test]
    fn test_from_frame_is_open_with_route_defaults() {
        let mut frame = Frame::new("3C6444", 50.9, 7.1, 1_700_000_100);
        frame.callsign = Some("DLH9AB".into());
        frame.src_airport = Some("CGN".into());

        let flight = Flight::from_frame(3, 9, &frame);
        assert!(flight.is_open());
        assert_eq!(flight.plane_id, 9);
        assert_eq!(flight.start_ts, 1_700_000_100);
        assert_eq!(flight.callsign, "DLH9AB");
        assert_eq!(flight.src_airport, "CGN");
        assert_eq!(flight.dest_airport, UNKNOWN);
        assert_eq!(flight.flight_number, UNKNOWN);
    }
}
