//! Per-record error taxonomy
//!
//! None of these are fatal to the engine. Callers count and log them, then
//! move on to the next record.

use crate::domain::types::RegionId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchError {
    /// Malformed polygon on region upsert; the prior region state is kept
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Malformed device report; dropped
    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    /// Stale membership pointing at a region that no longer exists.
    /// Handled internally as an implicit exit.
    #[error("unknown region reference: {0}")]
    UnknownRegionReference(RegionId),

    /// JSON record missing or mistyping a bound attribute
    #[error("schema mismatch: {0}")]
    Schema(String),
}

impl MatchError {
    /// Short label used for log fields and metric names
    pub fn kind(&self) -> &'static str {
        match self {
            MatchError::InvalidGeometry(_) => "invalid_geometry",
            MatchError::InvalidObservation(_) => "invalid_observation",
            MatchError::UnknownRegionReference(_) => "unknown_region_reference",
            MatchError::Schema(_) => "schema",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MatchError::InvalidObservation("latitude 91 out of range".to_string());
        assert_eq!(err.to_string(), "invalid observation: latitude 91 out of range");
        assert_eq!(err.kind(), "invalid_observation");

        let err = MatchError::UnknownRegionReference(RegionId::from("zone-a"));
        assert_eq!(err.to_string(), "unknown region reference: zone-a");
    }
}
