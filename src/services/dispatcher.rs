//! Dispatcher - merges the two input streams and fans observations out
//!
//! Region updates are applied straight to the shared store. Observations are
//! routed to one of N partition workers by hashing the device id, so every
//! observation of a device is handled by the same worker in arrival order
//! while different devices proceed in parallel.
//!
//! Routing an observation advances the store's event-time clock, so region
//! timeouts and idle eviction follow record timestamps rather than the wall
//! clock. A housekeeping tick purges timed-out regions, evicts idle devices
//! and samples queue depth. On shutdown the dispatcher stops reading new input,
//! drains what is already buffered, closes the worker queues and waits for
//! the workers to finish their backlog.

use crate::domain::error::MatchError;
use crate::domain::types::{DeviceId, DeviceObservation, RegionUpdate};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::matcher::{MatchEngine, WorkerMsg};
use crate::services::region_store::{RegionStore, UpsertOutcome};
use crate::services::sink::EventSink;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub workers: usize,
    pub queue_depth: usize,
    pub housekeeping_interval: Duration,
    /// None keeps device state forever
    pub device_idle_timeout: Option<Duration>,
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.engine_workers(),
            queue_depth: config.engine_queue_depth(),
            housekeeping_interval: Duration::from_secs(config.housekeeping_interval_secs()),
            device_idle_timeout: config.device_idle_timeout(),
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 1000,
            housekeeping_interval: Duration::from_secs(10),
            device_idle_timeout: None,
        }
    }
}

/// Partition index for a device
#[inline]
pub fn partition_for(device_id: &DeviceId, partitions: usize) -> usize {
    let mut hasher = FxHasher::default();
    device_id.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

/// Owns the partition workers and the shared region store
pub struct Dispatcher {
    store: Arc<RegionStore>,
    metrics: Arc<Metrics>,
    settings: DispatcherSettings,
    workers: Vec<mpsc::Sender<WorkerMsg>>,
    handles: Vec<JoinHandle<MatchEngine>>,
}

impl Dispatcher {
    /// Spawn one match worker per partition
    pub fn spawn(
        settings: DispatcherSettings,
        store: Arc<RegionStore>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let partitions = settings.workers.max(1);
        let mut workers = Vec::with_capacity(partitions);
        let mut handles = Vec::with_capacity(partitions);

        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
            let engine = MatchEngine::new(partition, store.clone(), sink.clone(), metrics.clone());
            handles.push(tokio::spawn(engine.run(rx)));
            workers.push(tx);
        }

        info!(
            workers = %partitions,
            queue_depth = %settings.queue_depth,
            "dispatcher_started"
        );
        Self { store, metrics, settings, workers, handles }
    }

    pub fn partitions(&self) -> usize {
        self.workers.len()
    }

    pub fn store(&self) -> &Arc<RegionStore> {
        &self.store
    }

    /// Queue an observation on its device's worker, waiting for room.
    /// Returns false if the worker has stopped.
    pub async fn route(&self, obs: DeviceObservation) -> bool {
        // Rejected records must not move event time
        if obs.position().is_ok() {
            self.store.advance_clock(obs.timestamp);
        }
        let partition = partition_for(&obs.device_id, self.workers.len());
        match self.workers[partition].send(WorkerMsg::Observation(obs)).await {
            Ok(()) => true,
            Err(_) => {
                error!(partition = %partition, "match_worker_closed");
                false
            }
        }
    }

    /// Apply a region definition or removal to the shared store
    pub fn apply_region_update(&self, update: &RegionUpdate) -> Result<UpsertOutcome, MatchError> {
        match self.store.apply(update) {
            Ok(outcome) => {
                match outcome {
                    UpsertOutcome::Inserted | UpsertOutcome::Replaced => {
                        self.metrics.record_region_upserted();
                    }
                    UpsertOutcome::Removed => self.metrics.record_region_removed(),
                    UpsertOutcome::Absent => {}
                }
                self.metrics.set_active_regions(self.store.len());
                info!(
                    region_id = %update.id,
                    outcome = %outcome.as_str(),
                    regions = %self.store.len(),
                    "region_updated"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.metrics.record_region_rejected();
                warn!(region_id = %update.id, kind = %e.kind(), error = %e, "region_rejected");
                Err(e)
            }
        }
    }

    /// Purge timed-out regions, evict idle devices, sample queue depth.
    /// Expiry and eviction wait until the event clock has started.
    pub async fn housekeeping(&self) {
        if let Some(now_ms) = self.store.clock() {
            let expired = self.store.purge_expired(now_ms);
            if !expired.is_empty() {
                self.metrics.record_regions_expired(expired.len() as u64);
                self.metrics.set_active_regions(self.store.len());
                for id in &expired {
                    info!(region_id = %id, clock = %now_ms, "region_expired");
                }
            }

            if let Some(timeout) = self.settings.device_idle_timeout {
                let max_idle_ms = timeout.as_millis() as u64;
                for tx in &self.workers {
                    let _ = tx.send(WorkerMsg::EvictIdle { now_ms, max_idle_ms }).await;
                }
            }
        }

        let depth: usize = self.workers.iter().map(|tx| tx.max_capacity() - tx.capacity()).sum();
        self.metrics.set_observation_queue_depth(depth as u64);
        debug!(queue_depth = %depth, regions = %self.store.len(), "housekeeping_done");
    }

    /// Merge both input streams until shutdown or until both close, then drain.
    /// Returns the final state of every worker.
    pub async fn run(
        self,
        mut observations: mpsc::Receiver<DeviceObservation>,
        mut regions: mpsc::Receiver<RegionUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Vec<MatchEngine> {
        let mut tick = interval(self.settings.housekeeping_interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut observations_open = true;
        let mut regions_open = true;

        while observations_open || regions_open {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dispatcher_shutdown");
                        break;
                    }
                }
                update = regions.recv(), if regions_open => {
                    match update {
                        Some(u) => {
                            let _ = self.apply_region_update(&u);
                        }
                        None => regions_open = false,
                    }
                }
                obs = observations.recv(), if observations_open => {
                    match obs {
                        Some(o) => {
                            if !self.route(o).await {
                                break;
                            }
                        }
                        None => observations_open = false,
                    }
                }
                _ = tick.tick() => {
                    self.housekeeping().await;
                }
            }
        }

        // Stop accepting, then finish what is already buffered
        regions.close();
        observations.close();
        while let Some(u) = regions.recv().await {
            let _ = self.apply_region_update(&u);
        }
        let mut drained = 0usize;
        while let Some(o) = observations.recv().await {
            if !self.route(o).await {
                break;
            }
            drained += 1;
        }
        if drained > 0 {
            info!(drained = %drained, "dispatcher_drained");
        }

        self.shutdown().await
    }

    /// Close the worker queues and wait for every worker to finish its backlog
    pub async fn shutdown(self) -> Vec<MatchEngine> {
        let Dispatcher { workers, handles, .. } = self;
        drop(workers);

        let mut engines = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(engine) => engines.push(engine),
                Err(e) => error!(error = %e, "match_worker_panicked"),
            }
        }
        info!(workers = %engines.len(), "dispatcher_stopped");
        engines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{MatchEventType, PolygonSpec, RegionId};
    use crate::services::sink::CollectingSink;
    use rustc_hash::FxHashMap;

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

    /// 2026-01-05T00:00:00Z
    const T0: u64 = 1_767_571_200_000;
    const HOUR_MS: u64 = 3_600_000;

    fn settings(workers: usize) -> DispatcherSettings {
        DispatcherSettings { workers, queue_depth: 16, ..DispatcherSettings::default() }
    }

    fn create_dispatcher(
        workers: usize,
    ) -> (Dispatcher, Arc<CollectingSink>, Arc<Metrics>) {
        let sink = Arc::new(CollectingSink::new());
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::spawn(
            settings(workers),
            Arc::new(RegionStore::new()),
            sink.clone(),
            metrics.clone(),
        );
        (dispatcher, sink, metrics)
    }

    #[test]
    fn test_partition_is_stable_and_in_range() {
        for i in 0..100 {
            let id = DeviceId(format!("device-{i}"));
            let p = partition_for(&id, 4);
            assert!(p < 4);
            assert_eq!(p, partition_for(&id, 4));
        }
        assert_eq!(partition_for(&DeviceId::from("x"), 0), 0);
    }

    #[tokio::test]
    async fn test_per_device_order_preserved_across_partitions() {
        let (dispatcher, sink, _metrics) = create_dispatcher(4);
        dispatcher.apply_region_update(&square("r", 0.0, 0.0, 1.0)).unwrap();

        for ts in 0..20u64 {
            for d in 0..8 {
                let lat = if ts % 2 == 0 { 0.5 } else { 5.0 };
                let obs = DeviceObservation::new(format!("d{d}"), lat, 0.5, ts);
                assert!(dispatcher.route(obs).await);
            }
        }
        let engines = dispatcher.shutdown().await;
        assert_eq!(engines.len(), 4);
        assert_eq!(engines.iter().map(|e| e.device_count()).sum::<usize>(), 8);

        let mut per_device: FxHashMap<DeviceId, Vec<(u64, MatchEventType)>> = FxHashMap::default();
        for event in sink.take() {
            per_device.entry(event.device_id.clone()).or_default().push((event.timestamp, event.event_type));
        }
        assert_eq!(per_device.len(), 8);
        for events in per_device.values() {
            assert_eq!(events.len(), 20);
            for (i, (ts, kind)) in events.iter().enumerate() {
                assert_eq!(*ts, i as u64);
                let expected = if i % 2 == 0 { MatchEventType::Enter } else { MatchEventType::Exit };
                assert_eq!(*kind, expected);
            }
        }
    }

    #[tokio::test]
    async fn test_apply_region_update_metrics() {
        let (dispatcher, _sink, metrics) = create_dispatcher(1);

        assert_eq!(
            dispatcher.apply_region_update(&square("a", 0.0, 0.0, 1.0)).unwrap(),
            UpsertOutcome::Inserted
        );
        let bad = RegionUpdate::define("b", PolygonSpec::Wkt("POLYGON((0 0, 1 1))".to_string()));
        assert!(matches!(
            dispatcher.apply_region_update(&bad),
            Err(MatchError::InvalidGeometry(_))
        ));
        assert_eq!(
            dispatcher.apply_region_update(&RegionUpdate::remove("a")).unwrap(),
            UpsertOutcome::Removed
        );

        let summary = metrics.report();
        assert_eq!(summary.regions_upserted, 1);
        assert_eq!(summary.regions_removed, 1);
        assert_eq!(summary.regions_rejected, 1);
        assert_eq!(summary.active_regions, 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_housekeeping_purges_and_evicts() {
        let sink = Arc::new(CollectingSink::new());
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(RegionStore::new());
        let dispatcher = Dispatcher::spawn(
            DispatcherSettings {
                workers: 2,
                queue_depth: 16,
                housekeeping_interval: Duration::from_secs(10),
                device_idle_timeout: Some(Duration::from_secs(60)),
            },
            store.clone(),
            sink,
            metrics.clone(),
        );

        let mut temp = square("temp", 0.0, 0.0, 1.0);
        temp.timeout = Duration::from_secs(30);
        dispatcher.apply_region_update(&temp).unwrap();

        // No clock yet, nothing to purge
        dispatcher.housekeeping().await;
        assert_eq!(store.len(), 1);

        dispatcher.route(DeviceObservation::new("old", 5.0, 5.0, T0)).await;
        dispatcher.route(DeviceObservation::new("new", 5.0, 5.0, T0 + 90_000)).await;
        assert_eq!(store.clock(), Some(T0 + 90_000));

        dispatcher.housekeeping().await;
        assert!(store.is_empty());
        assert_eq!(metrics.report().regions_expired, 1);

        let engines = dispatcher.shutdown().await;
        assert_eq!(engines.iter().map(|e| e.device_count()).sum::<usize>(), 1);
        assert!(engines.iter().any(|e| e.device_state(&DeviceId::from("new")).is_some()));
    }

    #[tokio::test]
    async fn test_region_timeout_follows_record_time() {
        let (dispatcher, sink, _metrics) = create_dispatcher(2);
        dispatcher.route(DeviceObservation::new("scout", 5.0, 5.0, T0)).await;

        let mut temp = square("temp", 0.0, 0.0, 1.0);
        temp.timeout = Duration::from_secs(60);
        dispatcher.apply_region_update(&temp).unwrap();
        let created_at = dispatcher.store().get(&RegionId::from("temp")).unwrap().created_at;
        assert_eq!(created_at, Some(T0));

        dispatcher.route(DeviceObservation::new("early", 0.5, 0.5, T0 + 30_000)).await;
        dispatcher.route(DeviceObservation::new("late", 0.5, 0.5, T0 + 2 * HOUR_MS)).await;
        dispatcher.shutdown().await;

        let events: Vec<(String, MatchEventType)> =
            sink.take().into_iter().map(|e| (e.device_id.0, e.event_type)).collect();
        assert_eq!(events, vec![("early".to_string(), MatchEventType::Enter)]);
    }

    #[tokio::test]
    async fn test_run_expires_and_evicts_on_record_time() {
        let sink = Arc::new(CollectingSink::new());
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(RegionStore::new());
        let dispatcher = Dispatcher::spawn(
            DispatcherSettings {
                workers: 2,
                queue_depth: 16,
                housekeeping_interval: Duration::from_millis(5),
                device_idle_timeout: Some(Duration::from_secs(60)),
            },
            store.clone(),
            sink.clone(),
            metrics.clone(),
        );
        let (obs_tx, obs_rx) = mpsc::channel(64);
        let (region_tx, region_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut temp = square("temp", 0.0, 0.0, 1.0);
        temp.timeout = Duration::from_secs(60);
        temp.notify_on_exit = false;
        let mut perm = square("perm", 0.0, 0.0, 1.0);
        perm.notify_on_hangout = false;
        region_tx.send(temp).await.unwrap();
        region_tx.send(perm).await.unwrap();

        obs_tx.send(DeviceObservation::new("bus", 0.5, 0.5, T0)).await.unwrap();
        obs_tx.send(DeviceObservation::new("idle", 5.0, 5.0, T0)).await.unwrap();
        obs_tx.send(DeviceObservation::new("bus", 0.5, 0.5, T0 + 61_000)).await.unwrap();

        let handle = tokio::spawn(dispatcher.run(obs_rx, region_rx, shutdown_rx));
        // Let several housekeeping ticks pass on a quiet stream
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.len(), 1);
        assert!(store.get(&RegionId::from("perm")).is_some());

        // Quiet for two hours of record time but still inside "perm"
        obs_tx.send(DeviceObservation::new("bus", 0.5, 0.5, T0 + 2 * HOUR_MS)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        let engines = handle.await.unwrap();

        let events: Vec<(String, MatchEventType, String, u64)> = sink
            .take()
            .into_iter()
            .map(|e| (e.device_id.0, e.event_type, e.region_id.0, e.timestamp))
            .collect();
        assert_eq!(
            events,
            vec![
                ("bus".to_string(), MatchEventType::Enter, "perm".to_string(), T0),
                ("bus".to_string(), MatchEventType::Enter, "temp".to_string(), T0),
                ("bus".to_string(), MatchEventType::Exit, "temp".to_string(), T0 + 61_000),
            ]
        );

        assert_eq!(metrics.snapshot().regions_expired, 1);
        assert_eq!(engines.iter().map(|e| e.device_count()).sum::<usize>(), 1);
        let bus = engines.iter().find_map(|e| e.device_state(&DeviceId::from("bus"))).unwrap();
        assert!(bus.is_inside(&RegionId::from("perm")));
        assert_eq!(bus.last_seen, Some(T0 + 2 * HOUR_MS));
    }

    #[tokio::test]
    async fn test_run_drains_on_shutdown() {
        let (dispatcher, sink, metrics) = create_dispatcher(2);
        let (obs_tx, obs_rx) = mpsc::channel(64);
        let (region_tx, region_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        region_tx.send(square("r", 0.0, 0.0, 1.0)).await.unwrap();
        for d in 0..10 {
            obs_tx.send(DeviceObservation::new(format!("d{d}"), 0.5, 0.5, 0)).await.unwrap();
        }
        shutdown_tx.send(true).unwrap();

        let engines = dispatcher.run(obs_rx, region_rx, shutdown_rx).await;
        assert_eq!(engines.iter().map(|e| e.device_count()).sum::<usize>(), 10);
        // Region update drained before observations
        assert_eq!(sink.len(), 10);
        assert_eq!(metrics.observations_total(), 10);
    }

    #[tokio::test]
    async fn test_run_ends_when_inputs_close() {
        let (dispatcher, sink, _metrics) = create_dispatcher(3);
        let (obs_tx, obs_rx) = mpsc::channel(8);
        let (region_tx, region_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(dispatcher.run(obs_rx, region_rx, shutdown_rx));
        region_tx.send(square("r", 0.0, 0.0, 1.0)).await.unwrap();
        // Give the region time to land before the observation
        tokio::time::sleep(Duration::from_millis(20)).await;
        obs_tx.send(DeviceObservation::new("d", 0.5, 0.5, 0)).await.unwrap();
        drop(obs_tx);
        drop(region_tx);

        let engines = handle.await.unwrap();
        assert_eq!(engines.len(), 3);
        assert_eq!(sink.take().len(), 1);
    }
}
