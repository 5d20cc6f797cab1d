//! Region matching for one partition of devices
//!
//! A MatchEngine owns the device states of every device routed to its
//! partition and shares the region store with the other partitions. Each
//! observation is diffed against the device's prior membership and the
//! resulting ENTER/EXIT/HANGOUT events are handed to the event sink.

mod handlers;

use crate::domain::error::MatchError;
use crate::domain::types::{DeviceId, DeviceObservation, MatchEvent};
use crate::infra::metrics::Metrics;
use crate::services::device_state::{DeviceState, DeviceStateTable};
use crate::services::region_store::RegionStore;
use crate::services::sink::EventSink;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Events produced by a single observation
pub type EventBatch = SmallVec<[MatchEvent; 4]>;

/// Work item for a partition worker
#[derive(Debug)]
pub enum WorkerMsg {
    Observation(DeviceObservation),
    /// Forget devices outside every region and idle for longer than
    /// `max_idle_ms` at event time `now_ms`
    EvictIdle { now_ms: u64, max_idle_ms: u64 },
}

/// Match engine for one device partition
pub struct MatchEngine {
    /// Partition index, used for logging only
    pub(crate) partition: usize,
    /// Shared region set
    pub(crate) store: Arc<RegionStore>,
    /// Membership of every device in this partition
    pub(crate) devices: DeviceStateTable,
    /// Event destination
    pub(crate) sink: Arc<dyn EventSink>,
    /// Metrics collector
    pub(crate) metrics: Arc<Metrics>,
}

impl MatchEngine {
    pub fn new(
        partition: usize,
        store: Arc<RegionStore>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { partition, store, devices: DeviceStateTable::new(), sink, metrics }
    }

    /// Consume work items until every sender is dropped and the queue is empty
    pub async fn run(mut self, mut rx: mpsc::Receiver<WorkerMsg>) -> Self {
        info!(partition = %self.partition, "match_worker_started");

        while let Some(msg) = rx.recv().await {
            match msg {
                WorkerMsg::Observation(obs) => {
                    // Rejections are counted and logged inside
                    let _ = self.process_observation(&obs);
                }
                WorkerMsg::EvictIdle { now_ms, max_idle_ms } => {
                    self.evict_idle(now_ms, max_idle_ms);
                }
            }
        }

        info!(
            partition = %self.partition,
            devices = %self.devices.len(),
            "match_worker_stopped"
        );
        self
    }

    /// Evaluate one observation, emit its events and return them.
    ///
    /// An invalid observation leaves every device state untouched.
    pub fn process_observation(
        &mut self,
        obs: &DeviceObservation,
    ) -> Result<EventBatch, MatchError> {
        let process_start = Instant::now();
        let devices_before = self.devices.len();

        let events = match self.evaluate(obs) {
            Ok(events) => events,
            Err(e) => {
                self.metrics.record_observation_rejected();
                warn!(
                    partition = %self.partition,
                    device_id = %obs.device_id,
                    kind = %e.kind(),
                    error = %e,
                    "observation_rejected"
                );
                return Err(e);
            }
        };

        for event in &events {
            self.sink.emit(event);
            self.metrics.record_event(event.event_type);
            debug!(
                device_id = %event.device_id,
                region_id = %event.region_id,
                event_type = %event.event_type,
                ts = %event.timestamp,
                "match_event_emitted"
            );
        }

        self.metrics.adjust_tracked_devices(devices_before, self.devices.len());
        let latency_us = process_start.elapsed().as_micros() as u64;
        self.metrics.record_observation(latency_us);
        Ok(events)
    }

    /// Drop devices outside every region and idle for longer than `max_idle_ms`
    pub fn evict_idle(&mut self, now_ms: u64, max_idle_ms: u64) -> usize {
        let before = self.devices.len();
        let evicted = self.devices.evict_idle(now_ms, max_idle_ms);
        self.metrics.adjust_tracked_devices(before, self.devices.len());
        evicted
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// State of a device, if it has been observed by this partition
    pub fn device_state(&self, device_id: &DeviceId) -> Option<&DeviceState> {
        self.devices.peek(device_id)
    }
}
