//! Shared types for the region-match engine

use crate::domain::error::MatchError;
use crate::domain::geometry::{normalize_longitude, GeoPoint};
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for device identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

/// Newtype wrapper for region identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RegionId(pub String);

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RegionId {
    fn from(s: &str) -> Self {
        RegionId(s.to_string())
    }
}

/// Timestamp that can be either ISO 8601 string or epoch milliseconds
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    EpochMs(u64),
}

impl TimestampValue {
    /// Read a timestamp from a JSON value (string or integer)
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => TimestampValue::IsoString(s.clone()),
            serde_json::Value::Number(n) => {
                // Negative epochs clamp to 0, fractional millis are truncated
                let ms = n
                    .as_u64()
                    .or_else(|| n.as_i64().map(|v| u64::try_from(v).unwrap_or(0)))
                    .or_else(|| n.as_f64().map(|v| v.max(0.0) as u64));
                ms.map(TimestampValue::EpochMs).unwrap_or_default()
            }
            _ => TimestampValue::None,
        }
    }

    /// Extract epoch milliseconds, None if missing or unparseable
    pub fn to_epoch_ms(&self) -> Option<u64> {
        match self {
            TimestampValue::EpochMs(ms) => Some(*ms),
            TimestampValue::IsoString(s) => parse_iso_time(s),
            TimestampValue::None => None,
        }
    }
}

/// Parse ISO 8601 timestamp to epoch milliseconds
pub fn parse_iso_time(time_str: &str) -> Option<u64> {
    // Parse "2026-01-05T16:41:30.048+00:00" format (RFC 3339)
    OffsetDateTime::parse(time_str, &Rfc3339)
        .ok()
        .and_then(|dt| u64::try_from(dt.unix_timestamp_nanos() / 1_000_000).ok())
}

/// Format epoch milliseconds as RFC 3339 UTC
pub fn format_iso_time(epoch_ms: u64) -> String {
    let nanos = i128::from(epoch_ms) * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| epoch_ms.to_string())
}

/// A device position report
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceObservation {
    pub device_id: DeviceId,
    pub latitude: f64,
    pub longitude: f64,
    /// Epoch milliseconds
    pub timestamp: u64,
}

impl DeviceObservation {
    pub fn new(device_id: impl Into<String>, latitude: f64, longitude: f64, timestamp: u64) -> Self {
        Self { device_id: DeviceId(device_id.into()), latitude, longitude, timestamp }
    }

    /// Validate the report and return its position in canonical longitude range
    pub fn position(&self) -> Result<GeoPoint, MatchError> {
        if self.device_id.0.trim().is_empty() {
            return Err(MatchError::InvalidObservation("missing device id".to_string()));
        }
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(MatchError::InvalidObservation(format!(
                "latitude {} out of range",
                self.latitude
            )));
        }
        let longitude = normalize_longitude(self.longitude).ok_or_else(|| {
            MatchError::InvalidObservation(format!("longitude {} out of range", self.longitude))
        })?;
        Ok(GeoPoint::new(self.latitude, longitude))
    }
}

/// Polygon as received on the region stream
#[derive(Debug, Clone, PartialEq)]
pub enum PolygonSpec {
    /// `POLYGON((lon lat, ...))`
    Wkt(String),
    /// `[lat, lon]` pairs
    Vertices(Vec<[f64; 2]>),
    /// Removal records carry no geometry
    None,
}

/// A region definition or removal as received on the region stream
#[derive(Debug, Clone, PartialEq)]
pub struct RegionUpdate {
    pub id: RegionId,
    pub polygon: PolygonSpec,
    pub remove_region: bool,
    pub notify_on_entry: bool,
    pub notify_on_exit: bool,
    pub notify_on_hangout: bool,
    pub minimum_dwell_time: Duration,
    /// Zero means the region never expires
    pub timeout: Duration,
}

impl RegionUpdate {
    /// Definition with all notifications enabled and no dwell or timeout
    pub fn define(id: &str, polygon: PolygonSpec) -> Self {
        Self {
            id: RegionId::from(id),
            polygon,
            remove_region: false,
            notify_on_entry: true,
            notify_on_exit: true,
            notify_on_hangout: true,
            minimum_dwell_time: Duration::ZERO,
            timeout: Duration::ZERO,
        }
    }

    /// Tombstone for the given region
    pub fn remove(id: &str) -> Self {
        Self { remove_region: true, polygon: PolygonSpec::None, ..Self::define(id, PolygonSpec::None) }
    }
}

/// Membership transition kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatchEventType {
    Enter,
    Exit,
    Hangout,
}

impl std::str::FromStr for MatchEventType {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY" | "ENTER" => Ok(MatchEventType::Enter),
            "EXIT" => Ok(MatchEventType::Exit),
            "HANGOUT" => Ok(MatchEventType::Hangout),
            other => Err(MatchError::Schema(format!("unknown event type {other}"))),
        }
    }
}

impl MatchEventType {
    /// Wire token
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchEventType::Enter => "ENTRY",
            MatchEventType::Exit => "EXIT",
            MatchEventType::Hangout => "HANGOUT",
        }
    }
}

impl std::fmt::Display for MatchEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted by the match engine
#[derive(Debug, Clone, PartialEq)]
pub struct MatchEvent {
    pub device_id: DeviceId,
    pub region_id: RegionId,
    pub event_type: MatchEventType,
    /// Epoch milliseconds of the observation that caused the event
    pub timestamp: u64,
    pub latitude: f64,
    pub longitude: f64,
}
