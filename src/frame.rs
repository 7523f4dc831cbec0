use serde::{Deserialize, Serialize};

/// Heading, altitude and ground speed the feed leaves blank
pub const UNKNOWN_MEASUREMENT: i32 = -1;
/// Squawk recorded when the feed leaves it blank
pub const UNKNOWN_SQUAWK: i32 = 40401;
/// Placeholder for descriptive plane and flight columns the feed leaves blank
pub const UNKNOWN: &str = "unknown";

/// A single raw observation of one aircraft.
///
/// Frames live only between fetch and consolidation (or upload); they are
/// never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// ICAO 24-bit transponder address, the natural key of a plane
    pub icao: String,
    pub lat: f64,
    pub lon: f64,
    /// Degrees
    pub heading: i32,
    /// Feet
    pub altitude: i32,
    /// Knots
    pub groundspeed: i32,
    pub squawk: i32,
    /// Epoch seconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callsign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flight_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plane_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub airline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_airport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_airport: Option<String>,
}

impl Frame {
    /// Frame with position and time only; every other measurement unknown
    pub fn new(icao: impl Into<String>, lat: f64, lon: f64, timestamp: i64) -> Self {
        Self {
            icao: icao.into(),
            lat,
            lon,
            heading: UNKNOWN_MEASUREMENT,
            altitude: UNKNOWN_MEASUREMENT,
            groundspeed: UNKNOWN_MEASUREMENT,
            squawk: UNKNOWN_SQUAWK,
            timestamp,
            callsign: None,
            flight_number: None,
            tail_number: None,
            plane_type: None,
            registration: None,
            airline: None,
            src_airport: None,
            dest_airport: None,
        }
    }
}

/// Descriptive value or the placeholder stored for it
pub(crate) fn or_unknown(value: Option<&String>) -> String {
    value.cloned().unwrap_or_else(|| UNKNOWN.to_string())
}

/// Treat blank feed values as absent
pub(crate) fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_without_absent_route_fields() {
        let mut frame = Frame::new("3C6444", 50.9, 7.1, 1_700_000_000);
        frame.callsign = Some("DLH9AB".into());

        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["icao"], "3C6444");
        assert_eq!(json["callsign"], "DLH9AB");
        assert_eq!(json["squawk"], UNKNOWN_SQUAWK);
        assert!(json.get("flightNumber").is_none());
        assert!(json.get("srcAirport").is_none());
    }

    #[test]
    fn test_non_blank() {
        assert_eq!(non_blank("  "), None);
        assert_eq!(non_blank(" FRA "), Some("FRA".to_string()));
    }
}
