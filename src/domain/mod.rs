//! Domain models - core geofence types and geometry
//!
//! This module contains the canonical data types used throughout the system:
//! - `geometry` - point-in-polygon, distance, bounding boxes, WKT parsing
//! - `region` - active geofence definitions and their notification policy
//! - `types` - device observations, region updates, match events
//! - `error` - per-record error taxonomy

pub mod error;
pub mod geometry;
pub mod region;
pub mod types;

pub use error::MatchError;
pub use region::{NotifyFlags, Region};
pub use types::{DeviceId, DeviceObservation, MatchEvent, MatchEventType, RegionId, RegionUpdate};
