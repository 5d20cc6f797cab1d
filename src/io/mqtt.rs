//! MQTT client for receiving device observations and region updates
//!
//! Subscribes to two topics. Observation payloads are bound with the
//! configured attribute names and handed to the dispatcher with `try_send`
//! so the MQTT eventloop never blocks; drops are counted. Region updates are
//! rare and must not be lost, so they wait for channel room.

use crate::domain::error::MatchError;
use crate::domain::types::{DeviceObservation, RegionUpdate};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::schema::{parse_observations, parse_region_updates, AttributeNames};
use anyhow::Context;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT topic filter match with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Which input stream a topic belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Observations,
    Regions,
}

/// Routes inbound payloads to the dispatcher channels
pub struct Ingest {
    observations_topic: String,
    regions_topic: String,
    names: AttributeNames,
    observation_tx: mpsc::Sender<DeviceObservation>,
    region_tx: mpsc::Sender<RegionUpdate>,
    metrics: Arc<Metrics>,
    /// Rate-limit drop warnings to 1 per second
    last_drop_warn: Instant,
}

impl Ingest {
    pub fn new(
        config: &Config,
        observation_tx: mpsc::Sender<DeviceObservation>,
        region_tx: mpsc::Sender<RegionUpdate>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            observations_topic: config.observations_topic().to_string(),
            regions_topic: config.regions_topic().to_string(),
            names: AttributeNames::from_config(config.attributes()),
            observation_tx,
            region_tx,
            metrics,
            last_drop_warn: Instant::now() - Duration::from_secs(2),
        }
    }

    pub fn classify(&self, topic: &str) -> Option<InputKind> {
        // Regions first: a broad observations filter must not swallow them
        if topic_matches(&self.regions_topic, topic) {
            Some(InputKind::Regions)
        } else if topic_matches(&self.observations_topic, topic) {
            Some(InputKind::Observations)
        } else {
            None
        }
    }

    /// Handle one publish. Returns false once the dispatcher has gone away.
    pub async fn handle(&mut self, topic: &str, payload: &[u8]) -> bool {
        match self.classify(topic) {
            Some(InputKind::Observations) => self.handle_observations(topic, payload),
            Some(InputKind::Regions) => self.handle_regions(topic, payload).await,
            None => {
                debug!(topic = %topic, "mqtt_unrouted_topic");
                true
            }
        }
    }

    fn handle_observations(&mut self, topic: &str, payload: &[u8]) -> bool {
        let records = match parse_observations(payload, &self.names) {
            Ok(records) => records,
            Err(e) => {
                self.malformed(topic, &e);
                return true;
            }
        };

        for record in records {
            let obs = match record {
                Ok(obs) => obs,
                Err(e) => {
                    self.malformed(topic, &e);
                    continue;
                }
            };
            if let Err(e) = self.observation_tx.try_send(obs) {
                match e {
                    TrySendError::Full(_) => {
                        self.metrics.record_ingress_dropped();
                        if self.last_drop_warn.elapsed() > Duration::from_secs(1) {
                            warn!("observation_dropped: channel full");
                            self.last_drop_warn = Instant::now();
                        }
                    }
                    TrySendError::Closed(_) => {
                        warn!("observation_channel_closed");
                        return false;
                    }
                }
            }
        }
        true
    }

    async fn handle_regions(&mut self, topic: &str, payload: &[u8]) -> bool {
        let records = match parse_region_updates(payload) {
            Ok(records) => records,
            Err(e) => {
                self.malformed(topic, &e);
                return true;
            }
        };

        for record in records {
            match record {
                Ok(update) => {
                    if self.region_tx.send(update).await.is_err() {
                        warn!("region_channel_closed");
                        return false;
                    }
                }
                Err(e) => self.malformed(topic, &e),
            }
        }
        true
    }

    fn malformed(&self, topic: &str, e: &MatchError) {
        self.metrics.record_malformed();
        warn!(topic = %topic, error = %e, "record_malformed");
    }
}

/// Start the MQTT client and feed both input channels
///
/// Runs until shutdown or until the dispatcher channels close.
pub async fn start_mqtt_client(
    config: &Config,
    mut ingest: Ingest,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client_id = format!("{}-{}", config.mqtt_client_id(), std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(config.mqtt_keep_alive_secs()));

    // Set credentials if configured
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client
        .subscribe(config.observations_topic(), QoS::AtMostOnce)
        .await
        .context("subscribe to observations topic")?;
    client
        .subscribe(config.regions_topic(), QoS::AtLeastOnce)
        .await
        .context("subscribe to regions topic")?;

    info!(
        observations = %config.observations_topic(),
        regions = %config.regions_topic(),
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "mqtt_subscribed"
    );

    loop {
        tokio::select! {
            // Check for shutdown signal
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            // Process MQTT events
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if !ingest.handle(&publish.topic, &publish.payload).await {
                            return Ok(());
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_ingest(
        capacity: usize,
    ) -> (Ingest, mpsc::Receiver<DeviceObservation>, mpsc::Receiver<RegionUpdate>, Arc<Metrics>) {
        let (obs_tx, obs_rx) = mpsc::channel(capacity);
        let (region_tx, region_rx) = mpsc::channel(capacity);
        let metrics = Arc::new(Metrics::new());
        let ingest = Ingest::new(&Config::default(), obs_tx, region_tx, metrics.clone());
        (ingest, obs_rx, region_rx, metrics)
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("regionmatch/devices", "regionmatch/devices"));
        assert!(!topic_matches("regionmatch/devices", "regionmatch/devices/x"));
        assert!(topic_matches("fleet/+/position", "fleet/bus-7/position"));
        assert!(!topic_matches("fleet/+/position", "fleet/bus-7/speed"));
        assert!(topic_matches("fleet/#", "fleet/bus-7/position"));
        assert!(topic_matches("fleet/#", "fleet"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("fleet/+", "fleet"));
    }

    #[test]
    fn test_classify() {
        let (ingest, _o, _r, _m) = create_ingest(4);
        assert_eq!(ingest.classify("regionmatch/devices"), Some(InputKind::Observations));
        assert_eq!(ingest.classify("regionmatch/regions"), Some(InputKind::Regions));
        assert_eq!(ingest.classify("other"), None);
    }

    #[tokio::test]
    async fn test_handle_routes_records() {
        let (mut ingest, mut obs_rx, mut region_rx, metrics) = create_ingest(8);

        let obs = br#"[{"id":"d1","latitude":1.0,"longitude":2.0,"timeStamp":1000},{"id":"d2"}]"#;
        assert!(ingest.handle("regionmatch/devices", obs).await);
        let region = br#"{"id":"r","polygon":[[0,0],[0,1],[1,1]],"notifyOnEntry":true}"#;
        assert!(ingest.handle("regionmatch/regions", region).await);
        assert!(ingest.handle("regionmatch/regions", b"{{").await);

        assert_eq!(obs_rx.try_recv().unwrap().timestamp, 1000);
        assert!(obs_rx.try_recv().is_err());
        assert!(region_rx.try_recv().unwrap().notify_on_entry);
        assert_eq!(metrics.records_malformed(), 2);
    }

    #[tokio::test]
    async fn test_full_observation_channel_drops() {
        let (mut ingest, _obs_rx, _region_rx, metrics) = create_ingest(1);
        let obs = br#"{"id":"d1","latitude":1.0,"longitude":2.0,"timeStamp":1000}"#;

        assert!(ingest.handle("regionmatch/devices", obs).await);
        assert!(ingest.handle("regionmatch/devices", obs).await);
        assert_eq!(metrics.ingress_dropped(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_stops_ingest() {
        let (mut ingest, obs_rx, _region_rx, _metrics) = create_ingest(1);
        drop(obs_rx);
        let obs = br#"{"id":"d1","latitude":1.0,"longitude":2.0,"timeStamp":1000}"#;
        assert!(!ingest.handle("regionmatch/devices", obs).await);
    }
}
