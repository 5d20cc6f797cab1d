//! Region store - the live set of geofences
//!
//! Readers take an `Arc<RegionSnapshot>` and work on it without holding any
//! lock. Writers build the next snapshot under a short exclusive section and
//! swap it in, so a reader sees either the whole pre-update or the whole
//! post-update region set, never a partial merge.
//!
//! Each snapshot carries a 1°×1° grid index: a region is registered in every
//! cell its bounding box touches. Regions whose box spans more than
//! `MAX_GRID_CELLS` cells go to a side list that is scanned on every lookup.
//! Grid lookup returns exactly the regions a full scan would.
//!
//! Region timeouts run on event time. The store keeps a clock holding the
//! latest observation timestamp routed so far; new definitions are stamped
//! with it and housekeeping purges against it. Definitions that arrive
//! before any observation are stamped when the clock starts.

use crate::domain::error::MatchError;
use crate::domain::geometry::{grid_cell, GeoPoint};
use crate::domain::region::Region;
use crate::domain::types::{RegionId, RegionUpdate};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Regions spanning more grid cells than this skip the grid
const MAX_GRID_CELLS: usize = 4096;

/// Result of applying a region update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    Removed,
    /// Removal of an id that was not present (no-op)
    Absent,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Inserted => "inserted",
            UpsertOutcome::Replaced => "replaced",
            UpsertOutcome::Removed => "removed",
            UpsertOutcome::Absent => "absent",
        }
    }
}

/// Immutable view of the region set
#[derive(Debug, Clone, Default)]
pub struct RegionSnapshot {
    regions: FxHashMap<RegionId, Arc<Region>>,
    grid: FxHashMap<(i32, i32), Vec<Arc<Region>>>,
    wide: Vec<Arc<Region>>,
}

impl RegionSnapshot {
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn get(&self, id: &RegionId) -> Option<&Arc<Region>> {
        self.regions.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Region>> {
        self.regions.values()
    }

    /// Regions that contain `point` and have not expired at `now_ms`
    pub fn matching(&self, point: GeoPoint, now_ms: u64) -> Vec<Arc<Region>> {
        let cell = self.grid.get(&grid_cell(point)).map(Vec::as_slice).unwrap_or_default();
        cell.iter()
            .chain(self.wide.iter())
            .filter(|r| !r.is_expired(now_ms) && r.contains(point))
            .cloned()
            .collect()
    }

    /// Ids of regions whose timeout has elapsed at `now_ms`
    pub fn expired_ids(&self, now_ms: u64) -> Vec<RegionId> {
        self.regions.values().filter(|r| r.is_expired(now_ms)).map(|r| r.id.clone()).collect()
    }

    fn insert(&mut self, region: Arc<Region>) -> Option<Arc<Region>> {
        let previous = self.remove(&region.id);

        let cells: Vec<(i32, i32)> =
            region.polygon.grid_cells().take(MAX_GRID_CELLS + 1).collect();
        if cells.len() > MAX_GRID_CELLS {
            self.wide.push(region.clone());
        } else {
            for cell in cells {
                self.grid.entry(cell).or_default().push(region.clone());
            }
        }
        self.regions.insert(region.id.clone(), region);
        previous
    }

    fn remove(&mut self, id: &RegionId) -> Option<Arc<Region>> {
        let region = self.regions.remove(id)?;
        let before = self.wide.len();
        self.wide.retain(|r| &r.id != id);
        if self.wide.len() == before {
            for cell in region.polygon.grid_cells() {
                if let Some(bucket) = self.grid.get_mut(&cell) {
                    bucket.retain(|r| &r.id != id);
                    if bucket.is_empty() {
                        self.grid.remove(&cell);
                    }
                }
            }
        }
        Some(region)
    }
}

/// Mutable collection of named geofences with atomic snapshots
pub struct RegionStore {
    current: RwLock<Arc<RegionSnapshot>>,
    /// Latest observation timestamp seen (epoch ms)
    clock: AtomicU64,
    clock_started: AtomicBool,
}

impl RegionStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RegionSnapshot::default())),
            clock: AtomicU64::new(0),
            clock_started: AtomicBool::new(false),
        }
    }

    /// Current event time, None before the first observation
    pub fn clock(&self) -> Option<u64> {
        self.clock_started
            .load(Ordering::SeqCst)
            .then(|| self.clock.load(Ordering::SeqCst))
    }

    /// Move event time forward to `ts`; never moves it back.
    ///
    /// The first call stamps every definition still waiting for a clock.
    pub fn advance_clock(&self, ts: u64) {
        self.clock.fetch_max(ts, Ordering::SeqCst);
        if !self.clock_started.swap(true, Ordering::SeqCst) {
            self.stamp_pending(self.clock.load(Ordering::SeqCst));
        }
    }

    fn stamp_pending(&self, now_ms: u64) {
        let mut guard = self.current.write();
        let pending: Vec<Arc<Region>> =
            guard.iter().filter(|r| r.created_at.is_none()).cloned().collect();
        if pending.is_empty() {
            return;
        }
        let mut next = RegionSnapshot::clone(&guard);
        for region in &pending {
            let mut stamped = Region::clone(region);
            stamped.created_at = Some(now_ms);
            next.insert(Arc::new(stamped));
        }
        *guard = Arc::new(next);
        debug!(regions = %pending.len(), created_at = %now_ms, "region_clock_started");
    }

    /// Current consistent view of all regions
    pub fn snapshot(&self) -> Arc<RegionSnapshot> {
        self.current.read().clone()
    }

    /// Alias of `snapshot` for callers that want to iterate everything
    pub fn all(&self) -> Arc<RegionSnapshot> {
        self.snapshot()
    }

    pub fn get(&self, id: &RegionId) -> Option<Arc<Region>> {
        self.current.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert, replace or remove a region, stamped with the store clock.
    ///
    /// A malformed polygon fails with `InvalidGeometry` and leaves the store
    /// untouched. Removing an absent id is a no-op.
    pub fn apply(&self, update: &RegionUpdate) -> Result<UpsertOutcome, MatchError> {
        self.write_update(update, None)
    }

    /// Like `apply`, with an explicit creation time
    pub fn upsert(&self, update: &RegionUpdate, created_at: u64) -> Result<UpsertOutcome, MatchError> {
        self.write_update(update, Some(created_at))
    }

    fn write_update(
        &self,
        update: &RegionUpdate,
        created_at: Option<u64>,
    ) -> Result<UpsertOutcome, MatchError> {
        if update.remove_region {
            let mut guard = self.current.write();
            if guard.get(&update.id).is_none() {
                return Ok(UpsertOutcome::Absent);
            }
            let mut next = RegionSnapshot::clone(&guard);
            next.remove(&update.id);
            *guard = Arc::new(next);
            debug!(region_id = %update.id, "region_store_removed");
            return Ok(UpsertOutcome::Removed);
        }

        // Validate before taking the write lock
        let mut region = Region::from_update(update, created_at)?;

        let mut guard = self.current.write();
        // Read the clock under the lock so a concurrent clock start cannot miss it
        if region.created_at.is_none() {
            region.created_at = self.clock();
        }
        let mut next = RegionSnapshot::clone(&guard);
        let previous = next.insert(Arc::new(region));
        *guard = Arc::new(next);

        debug!(region_id = %update.id, replaced = %previous.is_some(), "region_store_upserted");
        Ok(if previous.is_some() { UpsertOutcome::Replaced } else { UpsertOutcome::Inserted })
    }

    /// Drop regions whose timeout has elapsed; returns the removed ids
    pub fn purge_expired(&self, now_ms: u64) -> Vec<RegionId> {
        let expired = self.snapshot().expired_ids(now_ms);
        if expired.is_empty() {
            return expired;
        }

        let mut guard = self.current.write();
        let mut next = RegionSnapshot::clone(&guard);
        // Re-check under the lock: a region may have been replaced meanwhile
        let expired: Vec<RegionId> = expired
            .into_iter()
            .filter(|id| next.get(id).is_some_and(|r| r.is_expired(now_ms)))
            .collect();
        for id in &expired {
            next.remove(id);
        }
        *guard = Arc::new(next);
        expired
    }
}

impl Default for RegionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::PolygonSpec;
    use std::time::Duration;

    fn square(id: &str, lat: f64, lon: f64, size: f64) -> RegionUpdate {
        RegionUpdate::define(
            id,
            PolygonSpec::Vertices(vec![
                [lat, lon],
                [lat, lon + size],
                [lat + size, lon + size],
                [lat + size, lon],
            ]),
        )
    }

    #[test]
    fn test_upsert_and_get() {
        let store = RegionStore::new();
        assert_eq!(store.upsert(&square("a", 0.0, 0.0, 1.0), 0).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&square("a", 5.0, 5.0, 1.0), 0).unwrap(), UpsertOutcome::Replaced);
        assert_eq!(store.len(), 1);

        let region = store.get(&RegionId::from("a")).unwrap();
        assert!(region.contains(GeoPoint::new(5.5, 5.5)));
        assert!(store.snapshot().matching(GeoPoint::new(0.5, 0.5), 0).is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = RegionStore::new();
        store.upsert(&square("a", 0.0, 0.0, 1.0), 0).unwrap();

        assert_eq!(store.upsert(&RegionUpdate::remove("a"), 0).unwrap(), UpsertOutcome::Removed);
        assert_eq!(store.upsert(&RegionUpdate::remove("a"), 0).unwrap(), UpsertOutcome::Absent);
        assert!(store.get(&RegionId::from("a")).is_none());
        assert!(store.is_empty());
        assert!(store.snapshot().matching(GeoPoint::new(0.5, 0.5), 0).is_empty());
    }

    #[test]
    fn test_invalid_geometry_keeps_prior_state() {
        let store = RegionStore::new();
        store.upsert(&square("a", 0.0, 0.0, 1.0), 0).unwrap();

        let bad = RegionUpdate::define("a", PolygonSpec::Vertices(vec![[0.0, 0.0], [1.0, 1.0]]));
        assert!(matches!(store.upsert(&bad, 0), Err(MatchError::InvalidGeometry(_))));

        let region = store.get(&RegionId::from("a")).unwrap();
        assert!(region.contains(GeoPoint::new(0.5, 0.5)));
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_updates() {
        let store = RegionStore::new();
        store.upsert(&square("a", 0.0, 0.0, 1.0), 0).unwrap();
        let before = store.snapshot();

        store.upsert(&square("b", 0.0, 0.0, 1.0), 0).unwrap();
        store.upsert(&RegionUpdate::remove("a"), 0).unwrap();

        assert_eq!(before.len(), 1);
        assert!(before.get(&RegionId::from("a")).is_some());
        let after = store.snapshot();
        assert_eq!(after.len(), 1);
        assert!(after.get(&RegionId::from("b")).is_some());
    }

    #[test]
    fn test_region_spanning_cells() {
        let store = RegionStore::new();
        store.upsert(&square("big", -2.5, -2.5, 5.0), 0).unwrap();
        let snap = store.snapshot();
        for (lat, lon) in [(-2.0, -2.0), (0.0, 0.0), (2.4, -2.4), (2.5, 2.5)] {
            assert_eq!(snap.matching(GeoPoint::new(lat, lon), 0).len(), 1, "({lat}, {lon})");
        }
        assert!(snap.matching(GeoPoint::new(3.0, 0.0), 0).is_empty());
    }

    #[test]
    fn test_wide_region_skips_grid() {
        let store = RegionStore::new();
        store.upsert(&square("continent", -40.0, -80.0, 80.0), 0).unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.wide.len(), 1);
        assert_eq!(snap.matching(GeoPoint::new(10.0, -10.0), 0).len(), 1);

        store.upsert(&RegionUpdate::remove("continent"), 0).unwrap();
        assert!(store.snapshot().wide.is_empty());
    }

    #[test]
    fn test_expired_regions_do_not_match_and_are_purged() {
        let store = RegionStore::new();
        let mut update = square("temp", 0.0, 0.0, 1.0);
        update.timeout = Duration::from_secs(60);
        store.upsert(&update, 0).unwrap();
        store.upsert(&square("perm", 0.0, 0.0, 1.0), 0).unwrap();

        let p = GeoPoint::new(0.5, 0.5);
        assert_eq!(store.snapshot().matching(p, 30_000).len(), 2);
        assert_eq!(store.snapshot().matching(p, 61_000).len(), 1);

        assert!(store.purge_expired(30_000).is_empty());
        assert_eq!(store.purge_expired(61_000), vec![RegionId::from("temp")]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_apply_stamps_with_event_clock() {
        let store = RegionStore::new();
        let mut early = square("early", 0.0, 0.0, 1.0);
        early.timeout = Duration::from_secs(60);
        store.apply(&early).unwrap();
        assert_eq!(store.clock(), None);
        assert_eq!(store.get(&RegionId::from("early")).unwrap().created_at, None);

        // First observation starts the clock and stamps what was waiting
        store.advance_clock(1_000_000);
        assert_eq!(store.clock(), Some(1_000_000));
        assert_eq!(store.get(&RegionId::from("early")).unwrap().created_at, Some(1_000_000));

        store.advance_clock(1_030_000);
        store.advance_clock(1_010_000);
        assert_eq!(store.clock(), Some(1_030_000));

        let mut late = square("late", 0.0, 0.0, 1.0);
        late.timeout = Duration::from_secs(60);
        store.apply(&late).unwrap();
        assert_eq!(store.get(&RegionId::from("late")).unwrap().created_at, Some(1_030_000));

        let p = GeoPoint::new(0.5, 0.5);
        assert_eq!(store.snapshot().matching(p, 1_070_000).len(), 1);
        assert_eq!(store.purge_expired(1_070_000), vec![RegionId::from("early")]);
    }
}
