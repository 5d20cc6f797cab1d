//! Geofence region definitions

use crate::domain::error::MatchError;
use crate::domain::geometry::{parse_wkt_polygon, GeoPoint, Polygon};
use crate::domain::types::{PolygonSpec, RegionId, RegionUpdate};
use std::time::Duration;

/// Which transitions produce events for a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotifyFlags {
    pub on_entry: bool,
    pub on_exit: bool,
    pub on_hangout: bool,
}

/// An active geofence
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub id: RegionId,
    pub polygon: Polygon,
    pub notify: NotifyFlags,
    pub minimum_dwell_time: Duration,
    /// None means the region never expires
    pub timeout: Option<Duration>,
    /// Event time (epoch ms) at which this definition was applied.
    /// None until the first observation gives the stream a clock.
    pub created_at: Option<u64>,
}

impl Region {
    /// Build a region from a definition record.
    ///
    /// Fails with `InvalidGeometry` on a malformed polygon or on a record
    /// that is a removal (removals never become regions).
    pub fn from_update(
        update: &RegionUpdate,
        created_at: Option<u64>,
    ) -> Result<Self, MatchError> {
        if update.remove_region {
            return Err(MatchError::InvalidGeometry(format!(
                "region {} is a removal record",
                update.id
            )));
        }
        if update.id.0.trim().is_empty() {
            return Err(MatchError::InvalidGeometry("missing region id".to_string()));
        }
        let polygon = match &update.polygon {
            PolygonSpec::Wkt(wkt) => parse_wkt_polygon(wkt)?,
            PolygonSpec::Vertices(pairs) => Polygon::from_lat_lon(pairs)?,
            PolygonSpec::None => {
                return Err(MatchError::InvalidGeometry(format!(
                    "region {} has no polygon",
                    update.id
                )))
            }
        };

        Ok(Self {
            id: update.id.clone(),
            polygon,
            notify: NotifyFlags {
                on_entry: update.notify_on_entry,
                on_exit: update.notify_on_exit,
                on_hangout: update.notify_on_hangout,
            },
            minimum_dwell_time: update.minimum_dwell_time,
            timeout: (!update.timeout.is_zero()).then_some(update.timeout),
            created_at,
        })
    }

    /// True once `timeout` has elapsed since creation, both in event time
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match (self.timeout, self.created_at) {
            (Some(timeout), Some(created_at)) => {
                now_ms.saturating_sub(created_at) >= timeout.as_millis() as u64
            }
            _ => false,
        }
    }

    #[inline]
    pub fn contains(&self, p: GeoPoint) -> bool {
        self.polygon.contains(p)
    }

    #[inline]
    pub fn minimum_dwell_ms(&self) -> u64 {
        self.minimum_dwell_time.as_millis() as u64
    }
}
