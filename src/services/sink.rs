//! Event sink - the output boundary of the match engine
//!
//! The engine hands every event to an `EventSink` and never waits on it.
//! Implementations must not block: the MQTT egress channel drops when full,
//! the JSONL log appends synchronously to a local file.

use crate::domain::types::MatchEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Destination for match events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &MatchEvent);
}

/// Sends every event to several sinks in order
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &MatchEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Writes events to the tracing log; used when no other egress is configured
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &MatchEvent) {
        info!(
            device_id = %event.device_id,
            region_id = %event.region_id,
            event_type = %event.event_type,
            ts = %event.timestamp,
            "match_event"
        );
    }
}

/// Keeps events in memory
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<MatchEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything collected so far
    pub fn take(&self) -> Vec<MatchEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &MatchEvent) {
        self.events.lock().push(event.clone());
    }
}
