//! Event egress - appends match events to a local file
//!
//! Events are written in JSONL format (one JSON object per line)
//! to the file specified in config, using the configured attribute names.

use crate::domain::types::MatchEvent;
use crate::io::schema::{render_event, AttributeNames};
use crate::services::sink::EventSink;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// JSONL writer for match events, shared by all partition workers
pub struct EventLog {
    file_path: String,
    names: AttributeNames,
    /// Opened on first write; writes are serialized so lines never interleave
    file: Mutex<Option<File>>,
}

impl EventLog {
    pub fn new(file_path: &str, names: AttributeNames) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string(), names, file: Mutex::new(None) }
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Write an event to the egress file
    /// Returns true if successful, false otherwise
    pub fn write_event(&self, event: &MatchEvent) -> bool {
        let json = render_event(event, &self.names).to_string();

        match self.append_line(&json) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    device_id = %event.device_id,
                    region_id = %event.region_id,
                    error = %e,
                    "event_egress_failed"
                );
                // Reopen on the next write
                *self.file.lock() = None;
                false
            }
        }
    }

    /// Append a line to the egress file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            *guard = Some(Self::open(&self.file_path)?);
        }
        if let Some(file) = guard.as_mut() {
            writeln!(file, "{}", line)?;
        }
        debug!(file = %self.file_path, bytes = %line.len(), "egress_written");

        Ok(())
    }

    fn open(file_path: &str) -> std::io::Result<File> {
        let path = Path::new(file_path);

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Write multiple events
    pub fn write_events(&self, events: &[MatchEvent]) -> usize {
        events.iter().filter(|e| self.write_event(e)).count()
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: &MatchEvent) {
        self.write_event(event);
    }
}
