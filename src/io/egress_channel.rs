//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to send events to the MQTT publisher.
//! Uses bounded mpsc channels to prevent unbounded memory growth.

use crate::domain::types::{epoch_ms, MatchEvent};
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_NUM_BUCKETS};
use crate::io::schema::{render_event, AttributeNames};
use crate::services::sink::EventSink;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Match event, already rendered with the configured attribute names
    Event(EventPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

/// Payload for a match event
#[derive(Debug, Serialize)]
pub struct EventPayload {
    pub json: String,
}

/// Payload for metrics snapshot
#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    /// Site identifier
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: u64,
    /// Total observations evaluated
    pub observations_total: u64,
    /// Observations per second since last snapshot
    pub observations_per_sec: f64,
    /// Average evaluation latency (microseconds)
    pub avg_latency_us: u64,
    /// Max evaluation latency (microseconds)
    pub max_latency_us: u64,
    /// Evaluation latency histogram buckets (Prometheus-style exponential)
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub observations_rejected: u64,
    pub records_malformed: u64,
    pub regions_rejected: u64,
    pub regions_expired: u64,
    pub enter_events: u64,
    pub exit_events: u64,
    pub hangout_events: u64,
    /// Regions currently in the store
    pub active_regions: u64,
    /// Devices with state across all partitions
    pub tracked_devices: u64,
    /// Observations waiting in worker queues (snapshot)
    pub observation_queue_depth: u64,
    pub ingress_dropped: u64,
    pub egress_dropped: u64,
}

impl MetricsPayload {
    /// Create a metrics payload from a summary with site info
    pub fn from_summary(summary: MetricsSummary, site: String) -> Self {
        Self {
            site,
            ts: epoch_ms(),
            observations_total: summary.observations_total,
            observations_per_sec: summary.observations_per_sec,
            avg_latency_us: summary.avg_latency_us,
            max_latency_us: summary.max_latency_us,
            lat_buckets: summary.lat_buckets,
            lat_p50_us: summary.lat_p50_us,
            lat_p95_us: summary.lat_p95_us,
            lat_p99_us: summary.lat_p99_us,
            observations_rejected: summary.observations_rejected,
            records_malformed: summary.records_malformed,
            regions_rejected: summary.regions_rejected,
            regions_expired: summary.regions_expired,
            enter_events: summary.enter_events,
            exit_events: summary.exit_events,
            hangout_events: summary.hangout_events,
            active_regions: summary.active_regions,
            tracked_devices: summary.tracked_devices,
            observation_queue_depth: summary.observation_queue_depth,
            ingress_dropped: summary.ingress_dropped,
            egress_dropped: summary.egress_dropped,
        }
    }
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
    names: Arc<AttributeNames>,
    metrics: Option<Arc<Metrics>>,
}

impl EgressSender {
    /// Create a new sender from an mpsc sender
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String, names: AttributeNames) -> Self {
        Self { tx, site_id, names: Arc::new(names), metrics: None }
    }

    /// Count dropped messages in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Send a match event for publishing
    pub fn send_event(&self, event: &MatchEvent) {
        let json = render_event(event, &self.names).to_string();
        self.try_send(EgressMessage::Event(EventPayload { json }));
    }

    /// Send a metrics snapshot
    pub fn send_metrics(&self, summary: MetricsSummary) {
        let payload = MetricsPayload::from_summary(summary, self.site_id.clone());
        self.try_send(EgressMessage::Metrics(payload));
    }

    // Use try_send to avoid blocking - drop if channel full
    fn try_send(&self, msg: EgressMessage) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_egress_dropped();
                }
                debug!("egress_message_dropped: channel full");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("egress_channel_closed");
            }
        }
    }
}

impl EventSink for EgressSender {
    fn emit(&self, event: &MatchEvent) {
        self.send_event(event);
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// Buffer size determines how many messages can be queued.
/// site_id is included in metrics payloads for downstream consumers.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
    names: AttributeNames,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id, names), rx)
}
