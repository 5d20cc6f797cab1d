//! MQTT publisher for egress messages
//!
//! Publishes engine output for downstream consumers:
//! - events topic (default `regionmatch/events`) - match events, QoS 1
//! - metrics topic (default `regionmatch/metrics`) - snapshots, QoS 0
//!
//! The publisher runs until every `EgressSender` is dropped, so events
//! emitted while the workers drain on shutdown still go out.

use crate::infra::config::Config;
use crate::io::egress_channel::EgressMessage;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// One message ready for the wire
#[derive(Debug, PartialEq)]
struct Outgoing<'a> {
    topic: &'a str,
    qos: QoS,
    payload: Vec<u8>,
}

/// MQTT publisher actor
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<EgressMessage>,
    events_topic: String,
    metrics_topic: String,
    published: u64,
}

impl MqttPublisher {
    /// Create a publisher and spawn its connection eventloop
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let client_id = format!("{}-egress-{}", config.mqtt_client_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(config.mqtt_keep_alive_secs()));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);
        tokio::spawn(drive_eventloop(eventloop));

        Self {
            client,
            rx,
            events_topic: config.mqtt_egress_events_topic().to_string(),
            metrics_topic: config.mqtt_egress_metrics_topic().to_string(),
            published: 0,
        }
    }

    /// Publish until the channel closes. Returns the number of messages handed to the client.
    pub async fn run(mut self) -> u64 {
        info!(
            events = %self.events_topic,
            metrics = %self.metrics_topic,
            "mqtt_egress_started"
        );

        while let Some(msg) = self.rx.recv().await {
            self.publish_message(msg).await;
        }

        info!(published = %self.published, "mqtt_egress_stopped");
        self.published
    }

    async fn publish_message(&mut self, msg: EgressMessage) {
        let is_event = matches!(msg, EgressMessage::Event(_));
        let Some(out) = encode(&self.events_topic, &self.metrics_topic, msg) else {
            return;
        };
        match self.client.publish(out.topic, out.qos, false, out.payload).await {
            Ok(()) => self.published += 1,
            // Lost events matter, a lost snapshot is replaced by the next one
            Err(e) if is_event => error!(error = %e, "mqtt_egress_event_failed"),
            Err(e) => debug!(error = %e, "mqtt_egress_metrics_failed"),
        }
    }
}

/// Pick topic and QoS for a message and serialize it
fn encode<'a>(
    events_topic: &'a str,
    metrics_topic: &'a str,
    msg: EgressMessage,
) -> Option<Outgoing<'a>> {
    match msg {
        EgressMessage::Event(payload) => Some(Outgoing {
            topic: events_topic,
            qos: QoS::AtLeastOnce,
            payload: payload.json.into_bytes(),
        }),
        EgressMessage::Metrics(payload) => match serde_json::to_vec(&payload) {
            Ok(json) => Some(Outgoing { topic: metrics_topic, qos: QoS::AtMostOnce, payload: json }),
            Err(e) => {
                warn!(error = %e, "mqtt_egress_metrics_encode_failed");
                None
            }
        },
    }
}

async fn drive_eventloop(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt_egress_connected");
            }
            Ok(Event::Incoming(Packet::PubAck(_))) => {
                debug!("mqtt_egress_puback");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt_egress_error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::metrics::Metrics;
    use crate::io::egress_channel::{EventPayload, MetricsPayload};

    #[test]
    fn test_encode_event() {
        let msg = EgressMessage::Event(EventPayload { json: "{\"id\":\"d\"}".to_string() });
        let out = encode("ev", "met", msg).unwrap();
        assert_eq!(out.topic, "ev");
        assert_eq!(out.qos, QoS::AtLeastOnce);
        assert_eq!(out.payload, b"{\"id\":\"d\"}".to_vec());
    }

    #[test]
    fn test_encode_metrics() {
        let metrics = Metrics::new();
        metrics.set_active_regions(2);
        let payload = MetricsPayload::from_summary(metrics.snapshot(), "north".to_string());
        let out = encode("ev", "met", EgressMessage::Metrics(payload)).unwrap();
        assert_eq!(out.topic, "met");
        assert_eq!(out.qos, QoS::AtMostOnce);

        let value: serde_json::Value = serde_json::from_slice(&out.payload).unwrap();
        assert_eq!(value["site"], "north");
        assert_eq!(value["active_regions"], 2);
    }
}
