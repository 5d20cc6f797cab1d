//! Membership diff for a single observation
//!
//! Order of events within one observation: EXIT, then ENTER, then HANGOUT,
//! each group sorted by region id.
//!
//! Leaving a region that was deleted or has timed out always emits EXIT,
//! regardless of its exit flag.

use super::{EventBatch, MatchEngine};
use crate::domain::error::MatchError;
use crate::domain::geometry::GeoPoint;
use crate::domain::region::Region;
use crate::domain::types::{DeviceObservation, MatchEvent, MatchEventType, RegionId};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::debug;

impl MatchEngine {
    /// Compute the events for `obs` and update the device's membership
    pub(crate) fn evaluate(&mut self, obs: &DeviceObservation) -> Result<EventBatch, MatchError> {
        // Validate first so a rejected observation never creates state
        let point = obs.position()?;
        let ts = obs.timestamp;

        // One snapshot for the whole evaluation
        let snapshot = self.store.snapshot();
        let matched = snapshot.matching(point, ts);
        let current: FxHashSet<RegionId> = matched.iter().map(|r| r.id.clone()).collect();
        let prior = self.devices.get(&obs.device_id).membership();

        let mut exited: Vec<&RegionId> = prior.difference(&current).collect();
        exited.sort();
        let mut entered: Vec<&Arc<Region>> =
            matched.iter().filter(|r| !prior.contains(&r.id)).collect();
        entered.sort_by(|a, b| a.id.cmp(&b.id));
        let mut still_in: Vec<&Arc<Region>> =
            matched.iter().filter(|r| prior.contains(&r.id)).collect();
        still_in.sort_by(|a, b| a.id.cmp(&b.id));

        let mut events = EventBatch::new();

        for region_id in exited {
            // An expired region counts as gone whether or not housekeeping
            // has purged it yet, so the outcome does not depend on the tick
            let notify = match snapshot.get(region_id) {
                Some(region) if !region.is_expired(ts) => region.notify.on_exit,
                _ => {
                    // Region deleted or timed out while the device was inside it
                    let stale = MatchError::UnknownRegionReference(region_id.clone());
                    debug!(
                        device_id = %obs.device_id,
                        reason = %stale,
                        "stale_membership_exited"
                    );
                    self.metrics.record_stale_region_exit();
                    true
                }
            };
            if notify {
                events.push(event_for(obs, point, region_id, MatchEventType::Exit));
            }
        }

        for region in &entered {
            if region.notify.on_entry {
                events.push(event_for(obs, point, &region.id, MatchEventType::Enter));
            }
        }

        self.devices.update(&obs.device_id, &current, ts);

        for region in still_in {
            if !region.notify.on_hangout {
                continue;
            }
            let membership = self
                .devices
                .peek(&obs.device_id)
                .and_then(|state| state.regions.get(&region.id))
                .copied();
            let Some(membership) = membership else { continue };
            if membership.hangout_emitted {
                continue;
            }
            // Late reports saturate to zero dwell
            if ts.saturating_sub(membership.entered_at) >= region.minimum_dwell_ms() {
                events.push(event_for(obs, point, &region.id, MatchEventType::Hangout));
                self.devices.mark_hangout(&obs.device_id, &region.id);
            }
        }

        Ok(events)
    }
}

fn event_for(
    obs: &DeviceObservation,
    point: GeoPoint,
    region_id: &RegionId,
    event_type: MatchEventType,
) -> MatchEvent {
    MatchEvent {
        device_id: obs.device_id.clone(),
        region_id: region_id.clone(),
        event_type,
        timestamp: obs.timestamp,
        latitude: point.lat,
        longitude: point.lon,
    }
}
