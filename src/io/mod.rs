//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `schema` - JSON record binding with configurable attribute names
//! - `mqtt` - MQTT client for receiving observations and region updates
//! - `mqtt_egress` - MQTT publisher for match events and metrics
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `egress` - Match event output to file (JSONL format)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod egress;
pub mod egress_channel;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;
pub mod schema;

// Re-export commonly used types
pub use egress::EventLog;
pub use egress_channel::{create_egress_channel, EgressMessage, EgressSender, MetricsPayload};
pub use mqtt::{start_mqtt_client, Ingest};
pub use mqtt_egress::MqttPublisher;
pub use prometheus::start_metrics_server;
pub use schema::{parse_observations, parse_region_updates, render_event, AttributeNames};
