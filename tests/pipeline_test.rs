//! End-to-end: JSON payloads through the dispatcher to rendered events

use region_match::domain::types::MatchEventType;
use region_match::infra::Metrics;
use region_match::io::{parse_observations, parse_region_updates, render_event, AttributeNames};
use region_match::services::{CollectingSink, Dispatcher, DispatcherSettings, RegionStore};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const T0: u64 = 1_767_631_290_048;

const REGIONS: &[u8] = br#"[
    {
        "id": "depot",
        "polygonAsWKT": "POLYGON((13.0 52.0, 13.1 52.0, 13.1 52.1, 13.0 52.1, 13.0 52.0))",
        "notifyOnEntry": true,
        "notifyOnExit": true,
        "notifyOnHangout": true,
        "minimumDwellTime": 5
    },
    {
        "id": "yard",
        "polygon": [[52.05, 13.05], [52.05, 13.2], [52.2, 13.2], [52.2, 13.05]],
        "notifyOnEntry": true
    },
    { "id": "broken", "polygonAsWKT": "POLYGON((1 1, 2 2))", "notifyOnEntry": true }
]"#;

fn observations() -> Vec<u8> {
    serde_json::json!([
        { "id": "bus-7", "latitude": 51.9, "longitude": 13.02, "timeStamp": "2026-01-05T16:41:30.048Z" },
        { "id": "bus-7", "latitude": 52.02, "longitude": 13.02, "timeStamp": T0 + 1_000 },
        { "id": "bus-7", "latitude": 52.02, "longitude": 13.02, "timeStamp": T0 + 7_000 },
        { "id": "bus-7", "latitude": 52.06, "longitude": 13.06, "timeStamp": T0 + 8_000 },
        { "id": "bus-7", "latitude": 52.5, "longitude": 13.5, "timeStamp": T0 + 9_000 },
        { "id": "tram-1", "latitude": 95.0, "longitude": 13.02, "timeStamp": T0 },
        { "id": "tram-1", "latitude": 52.01, "longitude": "13.01", "timeStamp": T0 + 500 }
    ])
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn test_payloads_to_events() {
    let names = AttributeNames::default();
    let sink = Arc::new(CollectingSink::new());
    let metrics = Arc::new(Metrics::new());
    let dispatcher = Dispatcher::spawn(
        DispatcherSettings { workers: 3, ..DispatcherSettings::default() },
        Arc::new(RegionStore::new()),
        sink.clone(),
        metrics.clone(),
    );

    let (obs_tx, obs_rx) = mpsc::channel(64);
    let (region_tx, region_rx) = mpsc::channel(64);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    for update in parse_region_updates(REGIONS).unwrap().into_iter().flatten() {
        region_tx.send(update).await.unwrap();
    }
    for obs in parse_observations(&observations(), &names).unwrap().into_iter().flatten() {
        obs_tx.send(obs).await.unwrap();
    }
    drop(region_tx);
    drop(obs_tx);

    let engines = dispatcher.run(obs_rx, region_rx, shutdown_rx).await;
    assert_eq!(engines.iter().map(|e| e.device_count()).sum::<usize>(), 2);

    let events = sink.take();
    let bus: Vec<_> = events
        .iter()
        .filter(|e| e.device_id.0 == "bus-7")
        .map(|e| (e.timestamp - T0, e.event_type, e.region_id.0.as_str()))
        .collect();
    assert_eq!(
        bus,
        vec![
            (1_000, MatchEventType::Enter, "depot"),
            (7_000, MatchEventType::Hangout, "depot"),
            (8_000, MatchEventType::Enter, "yard"),
            // yard has exit notifications off
            (9_000, MatchEventType::Exit, "depot"),
        ]
    );

    let tram: Vec<_> = events.iter().filter(|e| e.device_id.0 == "tram-1").collect();
    assert_eq!(tram.len(), 1);
    assert_eq!(tram[0].event_type, MatchEventType::Enter);

    let rendered = render_event(&events[0], &names);
    assert!(rendered["matchEventType"].is_string());
    assert!(rendered["timeStamp"].as_str().unwrap().ends_with('Z'));

    assert_eq!(metrics.regions_rejected(), 1);
    assert_eq!(metrics.active_regions(), 2);
    assert_eq!(metrics.observations_rejected(), 1);
    assert_eq!(metrics.observations_total(), 6);
}
