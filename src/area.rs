use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Reasons an [`Area`] cannot be built
#[derive(Debug, Clone, PartialEq)]
pub enum AreaError {
    /// A coordinate is not finite or outside -90..90 / -180..180
    OutOfRange { field: &'static str, value: f64 },
    /// Grid corners are inverted or the grid has no tiles
    InvalidGrid(String),
    UnknownPreset(String),
}

impl fmt::Display for AreaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AreaError::OutOfRange { field, value } => {
                write!(f, "{} out of range: {}", field, value)
            }
            AreaError::InvalidGrid(msg) => write!(f, "Invalid grid: {}", msg),
            AreaError::UnknownPreset(name) => write!(f, "Unknown area preset '{}'", name),
        }
    }
}

impl std::error::Error for AreaError {}

fn check_lat(field: &'static str, value: f64) -> Result<f64, AreaError> {
    if value.is_finite() && (-90.0..=90.0).contains(&value) {
        Ok(value)
    } else {
        Err(AreaError::OutOfRange { field, value })
    }
}

fn check_lon(field: &'static str, value: f64) -> Result<f64, AreaError> {
    if value.is_finite() && (-180.0..=180.0).contains(&value) {
        Ok(value)
    } else {
        Err(AreaError::OutOfRange { field, value })
    }
}

/// Immutable bounding box used to partition feed requests.
///
/// The longitude pair is not required to be ordered: a box whose left edge
/// lies east of its right edge spans the antimeridian.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Area {
    name: String,
    lat_top_left: f64,
    lat_bottom_right: f64,
    lon_top_left: f64,
    lon_bottom_right: f64,
}

/// Every tile is one feed request per cycle
pub const MAX_GRID_TILES: usize = 10_000;

impl Area {
    pub fn new(
        lat_top_left: f64,
        lat_bottom_right: f64,
        lon_top_left: f64,
        lon_bottom_right: f64,
    ) -> Result<Self, AreaError> {
        let lat_top_left = check_lat("lat_top_left", lat_top_left)?;
        let lat_bottom_right = check_lat("lat_bottom_right", lat_bottom_right)?;
        let lon_top_left = check_lon("lon_top_left", lon_top_left)?;
        let lon_bottom_right = check_lon("lon_bottom_right", lon_bottom_right)?;

        Ok(Self {
            name: format!(
                "{},{},{},{}",
                lat_top_left, lon_top_left, lat_bottom_right, lon_bottom_right
            ),
            lat_top_left,
            lat_bottom_right,
            lon_top_left,
            lon_bottom_right,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lat_top_left(&self) -> f64 {
        self.lat_top_left
    }

    pub fn lat_bottom_right(&self) -> f64 {
        self.lat_bottom_right
    }

    pub fn lon_top_left(&self) -> f64 {
        self.lon_top_left
    }

    pub fn lon_bottom_right(&self) -> f64 {
        self.lon_bottom_right
    }

    /// Value of the feed's `bounds` query parameter:
    /// `latTopLeft,lonTopLeft,latBottomRight,lonBottomRight`
    pub fn bounds_param(&self) -> String {
        format!(
            "{},{},{},{}",
            self.lat_top_left, self.lon_top_left, self.lat_bottom_right, self.lon_bottom_right
        )
    }

    /// Split the box spanned by two (lat, lon) corners into `rows` x `cols`
    /// equally sized tiles, ordered row by row from the north-west corner.
    pub fn grid(
        top_left: (f64, f64),
        bottom_right: (f64, f64),
        rows: usize,
        cols: usize,
    ) -> Result<Vec<Area>, AreaError> {
        if rows == 0 || cols == 0 {
            return Err(AreaError::InvalidGrid(format!(
                "grid needs at least one row and column, got {}x{}",
                rows, cols
            )));
        }
        let tile_count = rows
            .checked_mul(cols)
            .filter(|&count| count <= MAX_GRID_TILES)
            .ok_or_else(|| {
                AreaError::InvalidGrid(format!(
                    "{}x{} exceeds the limit of {} tiles",
                    rows, cols, MAX_GRID_TILES
                ))
            })?;
        let (lat_top, lon_left) = top_left;
        let (lat_bottom, lon_right) = bottom_right;
        check_lat("lat_top_left", lat_top)?;
        check_lat("lat_bottom_right", lat_bottom)?;
        check_lon("lon_top_left", lon_left)?;
        check_lon("lon_bottom_right", lon_right)?;
        if lat_top <= lat_bottom || lon_left >= lon_right {
            return Err(AreaError::InvalidGrid(format!(
                "top-left ({}, {}) must be north-west of bottom-right ({}, {})",
                lat_top, lon_left, lat_bottom, lon_right
            )));
        }

        let lat_step = (lat_top - lat_bottom) / rows as f64;
        let lon_step = (lon_right - lon_left) / cols as f64;
        let mut tiles = Vec::with_capacity(tile_count);
        for row in 0..rows {
            // Edges are taken from the corners on the last row/col so float
            // drift never pushes a tile outside the valid range
            let north = lat_top - lat_step * row as f64;
            let south = if row + 1 == rows {
                lat_bottom
            } else {
                lat_top - lat_step * (row + 1) as f64
            };
            for col in 0..cols {
                let west = lon_left + lon_step * col as f64;
                let east = if col + 1 == cols {
                    lon_right
                } else {
                    lon_left + lon_step * (col + 1) as f64
                };
                tiles.push(Area::new(north, south, west, east)?.with_name(format!("grid-{}-{}", row, col)));
            }
        }
        Ok(tiles)
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.bounds_param())
    }
}

/// Named lists of areas covering regions of interest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AreaPreset {
    Germany,
    EasternFront,
    ItalyAlps,
    World,
}

// (name, lat top-left, lat bottom-right, lon top-left, lon bottom-right)
type PresetBox = (&'static str, f64, f64, f64, f64);

const GERMANY: &[PresetBox] = &[
    ("cgn", 51.055, 50.853, 6.544, 7.422),
    ("ne-ger", 54.876, 52.548, 8.05, 18.596),
    ("nw-ger", 54.903, 52.539, 3.568, 14.114),
    ("upper-central-east", 53.127, 50.662, 7.546, 18.092),
    ("upper-central-west", 52.998, 50.526, 2.201, 12.747),
    ("lower-central-east", 51.362, 48.799, 5.915, 16.461),
    ("lower-central-west", 51.533, 48.979, 1.399, 11.945),
    ("s-ger", 49.728, 47.077, 5.772, 16.318),
];

const EASTERN_FRONT: &[PresetBox] = &[
    ("ukraine", 52.567, 45.909, 17.843, 45.967),
    ("romania", 47.669, 44.114, 18.568, 32.63),
    ("poland", 58.152, 54.192, 19.093, 33.154),
    ("lithuania-latvia", 58.238, 54.955, 19.085, 33.147),
    ("belarus", 56.624, 51.183, 22.153, 36.215),
    ("crimea-blacksea", 46.652, 41.969, 27.323, 41.384),
    ("svk-hun-cze-aut", 51.146, 45.205, 11.581, 25.642),
];

const ITALY_ALPS: &[PresetBox] = &[
    ("northern-alps", 49.01, 46.32, 5.258, 15.803),
    ("alps", 47.773, 45.018, 4.588, 15.134),
    ("southern-alps", 46.965, 44.169, 4.923, 15.469),
    ("upper-italy", 44.98, 42.085, 6.027, 16.573),
    ("central-italy", 43.526, 40.56, 6.902, 17.448),
    ("tyrrhenian", 41.797, 38.75, 7.32, 17.866),
    ("s-italy", 41.67, 38.617, 10.566, 21.112),
    ("sicily", 39.289, 36.13, 10.139, 20.685),
];

const WORLD: &[PresetBox] = &[
    ("america", 84.512, -66.357, -162.169, -23.303),
    ("eurasia", 85.052, -63.86, -41.935, -170.256),
];

impl AreaPreset {
    pub const ALL: [AreaPreset; 4] = [
        AreaPreset::Germany,
        AreaPreset::EasternFront,
        AreaPreset::ItalyAlps,
        AreaPreset::World,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AreaPreset::Germany => "germany",
            AreaPreset::EasternFront => "eastern-front",
            AreaPreset::ItalyAlps => "italy-alps",
            AreaPreset::World => "world",
        }
    }

    fn boxes(self) -> &'static [PresetBox] {
        match self {
            AreaPreset::Germany => GERMANY,
            AreaPreset::EasternFront => EASTERN_FRONT,
            AreaPreset::ItalyAlps => ITALY_ALPS,
            AreaPreset::World => WORLD,
        }
    }

    pub fn areas(self) -> Result<Vec<Area>, AreaError> {
        self.boxes()
            .iter()
            .map(|&(name, lat_tl, lat_br, lon_tl, lon_br)| {
                Area::new(lat_tl, lat_br, lon_tl, lon_br).map(|a| a.with_name(name))
            })
            .collect()
    }
}

impl FromStr for AreaPreset {
    type Err = AreaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AreaPreset::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AreaError::UnknownPreset(s.to_string()))
    }
}

impl fmt::Display for AreaPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_is_rejected() {
        assert_eq!(
            Area::new(91.0, 50.0, 6.0, 7.0),
            Err(AreaError::OutOfRange {
                field: "lat_top_left",
                value: 91.0
            })
        );
        assert!(Area::new(51.0, -90.5, 6.0, 7.0).is_err());
        assert!(Area::new(51.0, 50.0, -180.1, 7.0).is_err());
        assert!(Area::new(51.0, 50.0, 6.0, 181.0).is_err());
        assert!(Area::new(f64::NAN, 50.0, 6.0, 7.0).is_err());
        assert!(Area::new(90.0, -90.0, -180.0, 180.0).is_ok());
    }

    #[test]
    fn test_bounds_param_order() {
        let area = Area::new(51.055, 50.853, 6.544, 7.422).unwrap();
        assert_eq!(area.bounds_param(), "51.055,6.544,50.853,7.422");
    }

    #[test]
    fn test_every_preset_area_is_in_range() {
        for preset in AreaPreset::ALL {
            let areas = preset.areas().unwrap();
            assert!(!areas.is_empty(), "{} has no areas", preset);
            for area in areas {
                let parts: Vec<f64> = area
                    .bounds_param()
                    .split(',')
                    .map(|v| v.parse().unwrap())
                    .collect();
                assert!((-90.0..=90.0).contains(&parts[0]));
                assert!((-180.0..=180.0).contains(&parts[1]));
                assert!((-90.0..=90.0).contains(&parts[2]));
                assert!((-180.0..=180.0).contains(&parts[3]));
            }
        }
    }

    #[test]
    fn test_preset_from_str() {
        assert_eq!("eastern-front".parse::<AreaPreset>().unwrap(), AreaPreset::EasternFront);
        assert_eq!("Germany".parse::<AreaPreset>().unwrap(), AreaPreset::Germany);
        assert!("atlantis".parse::<AreaPreset>().is_err());
    }

    #[test]
    fn test_grid_partitions_box() {
        let tiles = Area::grid((60.0, 0.0), (40.0, 30.0), 2, 3).unwrap();
        assert_eq!(tiles.len(), 6);
        assert_eq!(tiles[0].bounds_param(), "60,0,50,10");
        assert_eq!(tiles[5].bounds_param(), "50,20,40,30");
        assert_eq!(tiles[4].name(), "grid-1-1");
    }

    #[test]
    fn test_grid_rejects_bad_input() {
        assert!(Area::grid((60.0, 0.0), (40.0, 30.0), 0, 3).is_err());
        assert!(Area::grid((40.0, 0.0), (60.0, 30.0), 2, 2).is_err());
        assert!(Area::grid((95.0, 0.0), (60.0, 30.0), 2, 2).is_err());
    }

    #[test]
    fn test_grid_rejects_oversized_tile_count() {
        assert!(matches!(
            Area::grid((60.0, 0.0), (40.0, 30.0), usize::MAX, 2),
            Err(AreaError::InvalidGrid(_))
        ));
        assert!(matches!(
            Area::grid((60.0, 0.0), (40.0, 30.0), 101, 100),
            Err(AreaError::InvalidGrid(_))
        ));
        assert_eq!(
            Area::grid((60.0, 0.0), (40.0, 30.0), 100, 100).unwrap().len(),
            MAX_GRID_TILES
        );
    }
}
