//! JSON field binding for observations, region updates and events
//!
//! The engine never sees attribute names. Observations are read and events
//! are written through an `AttributeNames` table resolved once from config.
//! Region update records use a fixed camelCase layout.

use crate::domain::error::MatchError;
use crate::domain::types::{
    format_iso_time, DeviceObservation, MatchEvent, PolygonSpec, RegionId, RegionUpdate,
    TimestampValue,
};
use crate::infra::config::AttributesConfig;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

/// Attribute names used on observation input and event output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeNames {
    pub id: String,
    pub latitude: String,
    pub longitude: String,
    pub timestamp: String,
    pub event_type: String,
    pub region_name: String,
}

impl AttributeNames {
    pub fn from_config(attributes: &AttributesConfig) -> Self {
        Self {
            id: attributes.id.clone(),
            latitude: attributes.latitude.clone(),
            longitude: attributes.longitude.clone(),
            timestamp: attributes.timestamp.clone(),
            event_type: attributes.event_type.clone(),
            region_name: attributes.region_name.clone(),
        }
    }
}

impl Default for AttributeNames {
    fn default() -> Self {
        Self::from_config(&AttributesConfig::default())
    }
}

/// Split a payload into records: an object is one record, an array is many
fn records(payload: &[u8]) -> Result<Vec<Value>, MatchError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| MatchError::Schema(format!("invalid JSON: {e}")))?;
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(_) => Ok(vec![value]),
        other => Err(MatchError::Schema(format!("expected object or array, got {}", kind_of(&other)))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required<'a>(obj: &'a Map<String, Value>, name: &str) -> Result<&'a Value, MatchError> {
    match obj.get(name) {
        Some(Value::Null) | None => Err(MatchError::Schema(format!("missing attribute {name}"))),
        Some(value) => Ok(value),
    }
}

/// Numbers and numeric strings are both accepted for coordinates
fn coordinate(obj: &Map<String, Value>, name: &str) -> Result<f64, MatchError> {
    let value = required(obj, name)?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        MatchError::Schema(format!("attribute {name} is not a number ({})", kind_of(value)))
    })
}

/// Bind one JSON object to an observation
pub fn observation_from_value(
    value: &Value,
    names: &AttributeNames,
) -> Result<DeviceObservation, MatchError> {
    let obj = value
        .as_object()
        .ok_or_else(|| MatchError::Schema(format!("expected object, got {}", kind_of(value))))?;

    let device_id = match required(obj, &names.id)? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(MatchError::Schema(format!(
                "attribute {} is not a string ({})",
                names.id,
                kind_of(other)
            )))
        }
    };
    let latitude = coordinate(obj, &names.latitude)?;
    let longitude = coordinate(obj, &names.longitude)?;
    let timestamp = TimestampValue::from_json(required(obj, &names.timestamp)?)
        .to_epoch_ms()
        .ok_or_else(|| {
            MatchError::Schema(format!("attribute {} is not a valid timestamp", names.timestamp))
        })?;

    Ok(DeviceObservation::new(device_id, latitude, longitude, timestamp))
}

/// Parse an observation payload. The outer error covers the whole payload,
/// the inner results are per record.
pub fn parse_observations(
    payload: &[u8],
    names: &AttributeNames,
) -> Result<Vec<Result<DeviceObservation, MatchError>>, MatchError> {
    Ok(records(payload)?.iter().map(|v| observation_from_value(v, names)).collect())
}

/// Region update record as published on the regions topic
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegionRecord {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, rename = "polygonAsWKT")]
    polygon_as_wkt: Option<String>,
    /// `[lat, lon]` pairs
    #[serde(default)]
    polygon: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    remove_region: bool,
    #[serde(default)]
    notify_on_entry: bool,
    #[serde(default)]
    notify_on_exit: bool,
    #[serde(default)]
    notify_on_hangout: bool,
    /// Seconds
    #[serde(default)]
    minimum_dwell_time: i64,
    /// Seconds, 0 = never expires
    #[serde(default)]
    timeout: i64,
}

fn seconds(name: &str, value: i64) -> Result<Duration, MatchError> {
    u64::try_from(value)
        .map(Duration::from_secs)
        .map_err(|_| MatchError::Schema(format!("{name} must not be negative, got {value}")))
}

/// Bind one JSON object to a region update
pub fn region_update_from_value(value: &Value) -> Result<RegionUpdate, MatchError> {
    let record: RegionRecord = RegionRecord::deserialize(value)
        .map_err(|e| MatchError::Schema(format!("invalid region record: {e}")))?;

    let id = match record.id {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(MatchError::Schema("missing attribute id".to_string())),
    };

    // WKT wins when both forms are present
    let polygon = match (record.polygon_as_wkt, record.polygon) {
        (Some(wkt), _) if !wkt.trim().is_empty() => PolygonSpec::Wkt(wkt),
        (_, Some(pairs)) => PolygonSpec::Vertices(pairs),
        _ => PolygonSpec::None,
    };

    Ok(RegionUpdate {
        id: RegionId(id),
        polygon,
        remove_region: record.remove_region,
        notify_on_entry: record.notify_on_entry,
        notify_on_exit: record.notify_on_exit,
        notify_on_hangout: record.notify_on_hangout,
        minimum_dwell_time: seconds("minimumDwellTime", record.minimum_dwell_time)?,
        timeout: seconds("timeout", record.timeout)?,
    })
}

/// Parse a region payload (object or array of objects)
pub fn parse_region_updates(
    payload: &[u8],
) -> Result<Vec<Result<RegionUpdate, MatchError>>, MatchError> {
    Ok(records(payload)?.iter().map(region_update_from_value).collect())
}

/// Render an event with the configured attribute names
pub fn render_event(event: &MatchEvent, names: &AttributeNames) -> Value {
    let mut obj = Map::with_capacity(6);
    obj.insert(names.id.clone(), Value::String(event.device_id.0.clone()));
    obj.insert(names.latitude.clone(), Value::from(event.latitude));
    obj.insert(names.longitude.clone(), Value::from(event.longitude));
    obj.insert(names.timestamp.clone(), Value::String(format_iso_time(event.timestamp)));
    obj.insert(names.event_type.clone(), Value::String(event.event_type.as_str().to_string()));
    obj.insert(names.region_name.clone(), Value::String(event.region_id.0.clone()));
    Value::Object(obj)
}
