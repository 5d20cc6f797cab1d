//! Region-match simulator - region and device traffic generator
//!
//! Publishes a row of square regions to the regions topic, then walks a
//! number of simulated devices west to east through them, publishing one
//! observation per device per step. Match events coming back on the events
//! topic are printed as they arrive.
//!
//! Usage:
//!   cargo run --bin region-sim -- --devices 20 --steps 120
//!   cargo run --bin region-sim -- --remove-after    # delete regions at the end

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::Parser;
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// CLI Args
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "region-sim")]
#[command(about = "Publish simulated regions and device positions for region-match")]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    /// Topic for device observations
    #[arg(long, default_value = "regionmatch/devices")]
    observations_topic: String,

    /// Topic for region definitions
    #[arg(long, default_value = "regionmatch/regions")]
    regions_topic: String,

    /// Topic match events are published on
    #[arg(long, default_value = "regionmatch/events")]
    events_topic: String,

    /// Number of simulated devices
    #[arg(long, default_value = "10")]
    devices: usize,

    /// Number of regions laid out along the route
    #[arg(long, default_value = "3")]
    regions: usize,

    /// Steps each device walks
    #[arg(long, default_value = "60")]
    steps: u32,

    /// Wall-clock delay between steps
    #[arg(long, default_value = "200")]
    interval_ms: u64,

    /// Simulated time between two observations of one device
    #[arg(long, default_value = "1000")]
    step_ms: i64,

    /// Dwell time before HANGOUT, in seconds
    #[arg(long, default_value = "5")]
    min_dwell_secs: u64,

    /// Remove every region after the walk
    #[arg(long)]
    remove_after: bool,

    /// South-west corner of the first region
    #[arg(long, default_value = "52.5")]
    origin_lat: f64,

    #[arg(long, default_value = "13.4")]
    origin_lon: f64,
}

// ============================================================================
// Layout
// ============================================================================

/// Region side length in degrees
const REGION_SIZE: f64 = 0.01;
/// Gap between regions in degrees
const REGION_GAP: f64 = 0.005;
/// Device spacing north-south in degrees
const LANE_SPACING: f64 = 0.0008;

fn region_id(index: usize) -> String {
    format!("sim-region-{}", index + 1)
}

/// Closed WKT polygon for the square at `index` (WKT is lon lat)
fn region_wkt(args: &Args, index: usize) -> String {
    let west = args.origin_lon + index as f64 * (REGION_SIZE + REGION_GAP);
    let east = west + REGION_SIZE;
    let south = args.origin_lat;
    let north = south + REGION_SIZE;
    format!(
        "POLYGON(({west} {south}, {east} {south}, {east} {north}, {west} {north}, {west} {south}))"
    )
}

fn region_definition(args: &Args, index: usize) -> serde_json::Value {
    json!({
        "id": region_id(index),
        "polygonAsWKT": region_wkt(args, index),
        "notifyOnEntry": true,
        "notifyOnExit": true,
        "notifyOnHangout": true,
        "minimumDwellTime": args.min_dwell_secs,
        "timeout": 0
    })
}

fn region_removal(index: usize) -> serde_json::Value {
    json!({ "id": region_id(index), "removeRegion": true })
}

/// Position of `device` after `step` steps: each device has its own lane
/// and speed so entries and exits spread out over the walk
fn device_position(args: &Args, device: usize, step: u32) -> (f64, f64) {
    let lanes = args.devices.max(1) as f64;
    let lat = args.origin_lat + REGION_SIZE * (device as f64 + 0.5) / lanes;
    let lat = lat.min(args.origin_lat + REGION_SIZE - LANE_SPACING);
    let route_len = args.regions.max(1) as f64 * (REGION_SIZE + REGION_GAP) + REGION_GAP;
    let speed = route_len / f64::from(args.steps.max(1)) * (1.0 + device as f64 % 3.0 * 0.25);
    let lon = args.origin_lon - REGION_GAP + speed * f64::from(step);
    (lat, lon)
}

fn observation(device: usize, lat: f64, lon: f64, at: DateTime<Utc>) -> serde_json::Value {
    json!({
        "id": format!("sim-device-{}", device + 1),
        "latitude": lat,
        "longitude": lon,
        "timeStamp": at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    })
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let client_id = format!("region-sim-{}", std::process::id());
    let mut mqtt_options = MqttOptions::new(client_id, &args.mqtt_host, args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_max_packet_size(1 << 20, 1 << 20);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);
    client.subscribe(&args.events_topic, QoS::AtLeastOnce).await?;

    // Print match events as they come back
    let received = Arc::new(AtomicU64::new(0));
    let received_events = received.clone();
    let mqtt_handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                    println!("{} connected", Utc::now().format("%H:%M:%S%.3f"));
                }
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                    received_events.fetch_add(1, Ordering::Relaxed);
                    let payload = String::from_utf8_lossy(&publish.payload);
                    println!("{} <- {}", Utc::now().format("%H:%M:%S%.3f"), payload);
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("MQTT error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    // Regions first, in one batch
    let regions: Vec<_> = (0..args.regions).map(|i| region_definition(&args, i)).collect();
    let batch = serde_json::Value::Array(regions).to_string();
    client.publish(&args.regions_topic, QoS::AtLeastOnce, false, batch).await?;
    println!("-> {} regions on {}", args.regions, args.regions_topic);

    // Let the engine apply them before devices start moving
    tokio::time::sleep(Duration::from_millis(500)).await;

    let start = Utc::now();
    for step in 0..=args.steps {
        let at = start + ChronoDuration::milliseconds(args.step_ms * i64::from(step));
        let batch: Vec<_> = (0..args.devices)
            .map(|device| {
                let (lat, lon) = device_position(&args, device, step);
                observation(device, lat, lon, at)
            })
            .collect();
        let payload = serde_json::Value::Array(batch).to_string();
        client.publish(&args.observations_topic, QoS::AtMostOnce, false, payload).await?;
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }
    println!("-> {} observations on {}", (args.steps + 1) as usize * args.devices, args.observations_topic);

    if args.remove_after {
        let removals: Vec<_> = (0..args.regions).map(region_removal).collect();
        let batch = serde_json::Value::Array(removals).to_string();
        client.publish(&args.regions_topic, QoS::AtLeastOnce, false, batch).await?;
        println!("-> removed {} regions", args.regions);
    }

    // Give trailing events time to arrive
    tokio::time::sleep(Duration::from_secs(2)).await;
    println!("received {} events", received.load(Ordering::Relaxed));

    mqtt_handle.abort();
    Ok(())
}
