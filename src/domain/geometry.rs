//! Geographic primitives on top of `geo`: point-in-polygon, great-circle
//! distance, bounding boxes and WKT polygons
//!
//! Coordinates are WGS84 degrees. `geo` works in x/y, so x is longitude and
//! y is latitude everywhere a `geo` type appears. Longitude is canonical in
//! [-180, 180]; values in (180, 360) are accepted and shifted down by 360.
//! Polygons that cross the antimeridian are not supported.
//!
//! Boundary policy: a point lying on a polygon edge or vertex is inside.

use crate::domain::error::MatchError;
use geo::{BoundingRect, Coord, HaversineDistance, Intersects, LineString, Rect};
use wkt::TryFromWkt;

/// Map a longitude into [-180, 180], None if it cannot be interpreted
#[inline]
pub fn normalize_longitude(lon: f64) -> Option<f64> {
    if !lon.is_finite() {
        return None;
    }
    if (-180.0..=180.0).contains(&lon) {
        Some(lon)
    } else if lon > 180.0 && lon < 360.0 {
        Some(lon - 360.0)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    #[inline]
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Validate and normalise a vertex
    fn checked(lat: f64, lon: f64) -> Result<Self, MatchError> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(MatchError::InvalidGeometry(format!("vertex latitude {lat} out of range")));
        }
        let lon = normalize_longitude(lon).ok_or_else(|| {
            MatchError::InvalidGeometry(format!("vertex longitude {lon} out of range"))
        })?;
        Ok(Self { lat, lon })
    }

    #[inline]
    fn coord(self) -> Coord<f64> {
        Coord { x: self.lon, y: self.lat }
    }
}

impl From<GeoPoint> for geo::Point<f64> {
    fn from(p: GeoPoint) -> Self {
        geo::Point::new(p.lon, p.lat)
    }
}

impl From<Coord<f64>> for GeoPoint {
    fn from(c: Coord<f64>) -> Self {
        GeoPoint::new(c.y, c.x)
    }
}

/// Great-circle distance in meters (haversine, mean Earth radius)
pub fn haversine_distance(p1: GeoPoint, p2: GeoPoint) -> f64 {
    geo::Point::from(p1).haversine_distance(&geo::Point::from(p2))
}

/// Grid cell holding a point, as (floor(lat), floor(lon))
#[inline]
pub fn grid_cell(p: GeoPoint) -> (i32, i32) {
    (p.lat.floor() as i32, p.lon.floor() as i32)
}

/// Simple polygon (outer ring only)
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    inner: geo::Polygon<f64>,
    bbox: Rect<f64>,
}

impl Polygon {
    /// Build a polygon from an open or closed ring.
    ///
    /// Consecutive duplicate vertices and a repeated closing vertex are dropped.
    /// Fails with `InvalidGeometry` if fewer than three distinct vertices remain.
    pub fn new(ring: Vec<GeoPoint>) -> Result<Self, MatchError> {
        let mut coords: Vec<Coord<f64>> = Vec::with_capacity(ring.len() + 1);
        for p in ring {
            let c = GeoPoint::checked(p.lat, p.lon)?.coord();
            if coords.last() != Some(&c) {
                coords.push(c);
            }
        }
        while coords.len() > 1 && coords.first() == coords.last() {
            coords.pop();
        }

        if coords.len() < 3 {
            return Err(MatchError::InvalidGeometry(format!(
                "polygon needs at least 3 distinct vertices, got {}",
                coords.len()
            )));
        }

        // geo closes the ring
        let inner = geo::Polygon::new(LineString::from(coords), Vec::new());
        let bbox = inner
            .bounding_rect()
            .ok_or_else(|| MatchError::InvalidGeometry("empty polygon".to_string()))?;
        Ok(Self { inner, bbox })
    }

    /// Build from `[lat, lon]` pairs
    pub fn from_lat_lon(pairs: &[[f64; 2]]) -> Result<Self, MatchError> {
        Self::new(pairs.iter().map(|&[lat, lon]| GeoPoint::new(lat, lon)).collect())
    }

    /// Distinct vertices in ring order, without the closing repeat
    pub fn vertices(&self) -> impl Iterator<Item = GeoPoint> + '_ {
        let ring = &self.inner.exterior().0;
        ring[..ring.len().saturating_sub(1)].iter().map(|c| GeoPoint::from(*c))
    }

    pub fn vertex_count(&self) -> usize {
        self.inner.exterior().0.len().saturating_sub(1)
    }

    pub fn bbox(&self) -> &Rect<f64> {
        &self.bbox
    }

    /// Point-in-polygon test; boundary points count as inside
    pub fn contains(&self, p: GeoPoint) -> bool {
        let c = p.coord();
        let (min, max) = (self.bbox.min(), self.bbox.max());
        if c.x < min.x || c.x > max.x || c.y < min.y || c.y > max.y {
            return false;
        }
        self.inner.intersects(&c)
    }

    /// 1°×1° grid cells touched by the bounding box
    pub fn grid_cells(&self) -> impl Iterator<Item = (i32, i32)> {
        let (min, max) = (self.bbox.min(), self.bbox.max());
        let (lat0, lat1) = (min.y.floor() as i32, max.y.floor() as i32);
        let (lon0, lon1) = (min.x.floor() as i32, max.x.floor() as i32);
        (lat0..=lat1).flat_map(move |lat| (lon0..=lon1).map(move |lon| (lat, lon)))
    }
}

/// Point-in-polygon for a validated polygon
#[inline]
pub fn point_in_polygon(point: GeoPoint, polygon: &Polygon) -> bool {
    polygon.contains(point)
}

/// Parse a WKT `POLYGON((x y, ...))` where x is longitude and y latitude.
///
/// Only a single outer ring is accepted; interior rings are rejected.
pub fn parse_wkt_polygon(text: &str) -> Result<Polygon, MatchError> {
    let invalid = |msg: &str| MatchError::InvalidGeometry(format!("{msg}: {text}"));

    let parsed = geo::Polygon::<f64>::try_from_wkt_str(text.trim())
        .map_err(|e| invalid(&format!("malformed WKT polygon ({e})")))?;
    if !parsed.interiors().is_empty() {
        return Err(invalid("interior rings are not supported"));
    }
    Polygon::new(parsed.exterior().coords().map(|c| GeoPoint::from(*c)).collect())
}
