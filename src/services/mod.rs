//! Services - region matching and state management
//!
//! This module contains the core matching services:
//! - `region_store` - Live geofence set with atomic snapshots and a grid index
//! - `device_state` - Per-device membership and dwell bookkeeping
//! - `matcher` - Match engine: membership diff and event generation
//! - `dispatcher` - Merges input streams, routes devices to partition workers
//! - `sink` - Event sink trait and in-process sinks

pub mod device_state;
pub mod dispatcher;
pub mod matcher;
pub mod region_store;
pub mod sink;

// Re-export commonly used types
pub use device_state::{DeviceState, DeviceStateTable};
pub use dispatcher::{Dispatcher, DispatcherSettings};
pub use matcher::{EventBatch, MatchEngine, WorkerMsg};
pub use region_store::{RegionSnapshot, RegionStore, UpsertOutcome};
pub use sink::{CollectingSink, EventSink, FanoutSink, LogSink};
