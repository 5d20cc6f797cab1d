//! Per-device region membership and dwell bookkeeping
//!
//! Tracks which regions each device is currently inside, when it entered
//! each of them, and whether the hangout for the current dwell period has
//! already fired. This is the single source of truth for membership; the
//! match engine diffs each observation against it.
//!
//! Key behaviors:
//! - State is created lazily on first access, with no memberships
//! - Regions that stay in the membership keep their original entry time
//! - Leaving a region drops its entry time and hangout latch
//! - Last-seen only moves forward, so late reports never rewind it
//! - Idle eviction only drops devices that are outside every region

use crate::domain::types::{DeviceId, RegionId};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// Membership of one device in one region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    /// Observation timestamp (epoch ms) at which the device entered
    pub entered_at: u64,
    /// Hangout already emitted for this continuous dwell period
    pub hangout_emitted: bool,
}

/// State for a single device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub device_id: DeviceId,
    pub regions: FxHashMap<RegionId, Membership>,
    /// Latest observation timestamp seen (epoch ms)
    pub last_seen: Option<u64>,
}

impl DeviceState {
    fn new(device_id: DeviceId) -> Self {
        Self { device_id, regions: FxHashMap::default(), last_seen: None }
    }

    pub fn is_inside(&self, region_id: &RegionId) -> bool {
        self.regions.contains_key(region_id)
    }

    pub fn entered_at(&self, region_id: &RegionId) -> Option<u64> {
        self.regions.get(region_id).map(|m| m.entered_at)
    }

    /// Ids of the regions the device is currently inside
    pub fn membership(&self) -> FxHashSet<RegionId> {
        self.regions.keys().cloned().collect()
    }
}

/// All device states, keyed by device id
#[derive(Debug, Default)]
pub struct DeviceStateTable {
    devices: FxHashMap<DeviceId, DeviceState>,
}

impl DeviceStateTable {
    pub fn new() -> Self {
        Self { devices: FxHashMap::default() }
    }

    /// State for a device, created empty on first access
    pub fn get(&mut self, device_id: &DeviceId) -> &DeviceState {
        self.devices
            .entry(device_id.clone())
            .or_insert_with(|| DeviceState::new(device_id.clone()))
    }

    /// State for a device without creating it
    pub fn peek(&self, device_id: &DeviceId) -> Option<&DeviceState> {
        self.devices.get(device_id)
    }

    /// Replace a device's membership set.
    ///
    /// New regions get `timestamp` as entry time; regions that stay keep
    /// their entry time and hangout latch; dropped regions are forgotten.
    pub fn update(
        &mut self,
        device_id: &DeviceId,
        new_membership: &FxHashSet<RegionId>,
        timestamp: u64,
    ) {
        let state = self
            .devices
            .entry(device_id.clone())
            .or_insert_with(|| DeviceState::new(device_id.clone()));

        state.regions.retain(|id, _| new_membership.contains(id));
        for id in new_membership {
            state
                .regions
                .entry(id.clone())
                .or_insert(Membership { entered_at: timestamp, hangout_emitted: false });
        }
        state.last_seen = Some(state.last_seen.map_or(timestamp, |seen| seen.max(timestamp)));
    }

    /// Latch the hangout for the device's current dwell in a region.
    /// Returns false if the device is not inside the region.
    pub fn mark_hangout(&mut self, device_id: &DeviceId, region_id: &RegionId) -> bool {
        match self.devices.get_mut(device_id).and_then(|s| s.regions.get_mut(region_id)) {
            Some(membership) => {
                membership.hangout_emitted = true;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Forget devices not seen for longer than `max_idle_ms`.
    ///
    /// A device still inside a region is kept however long it is quiet,
    /// so its next report diffs against the membership it really has.
    /// Returns the number of evicted devices.
    pub fn evict_idle(&mut self, now_ms: u64, max_idle_ms: u64) -> usize {
        let before = self.devices.len();
        self.devices.retain(|_, state| {
            !state.regions.is_empty()
                || state.last_seen.is_some_and(|seen| now_ms.saturating_sub(seen) <= max_idle_ms)
        });
        let evicted = before - self.devices.len();
        if evicted > 0 {
            debug!(evicted = %evicted, remaining = %self.devices.len(), "device_state_evicted");
        }
        evicted
    }
}
