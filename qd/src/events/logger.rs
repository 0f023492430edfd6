//! Event Logger - persists events to a JSONL file
//!
//! Registered as a bus observer; each event becomes one `{"ts":..,"event":..}`
//! line in `<data-dir>/events.jsonl`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use eyre::Context;
use tracing::{debug, warn};

use super::bus::{EventBus, SubscriptionId};
use super::types::{Event, EventLogEntry};

/// File name used under the data directory
pub const EVENTS_FILE: &str = "events.jsonl";

/// Appends events to a JSONL file
pub struct EventLogger {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl EventLogger {
    /// Open (or create) the log file for appending
    pub fn open(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "EventLogger::open: called");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create event log directory")?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(format!("Failed to open event log {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Open `events.jsonl` inside a data directory
    pub fn in_data_dir(data_dir: impl AsRef<Path>) -> eyre::Result<Self> {
        Self::open(data_dir.as_ref().join(EVENTS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one event as a JSON line and flush
    pub fn write_event(&self, event: &Event) -> eyre::Result<()> {
        let entry = EventLogEntry::new(event.clone());
        let json = serde_json::to_string(&entry)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| eyre::eyre!("event log writer lock poisoned"))?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }

    /// Register this logger on a bus
    pub fn attach(self: Arc<Self>, bus: &EventBus) -> SubscriptionId {
        debug!(path = ?self.path, "EventLogger::attach: called");
        bus.register_callback(move |event| self.write_event(event))
    }
}

/// Read all entries back from a JSONL event log
///
/// A missing file yields an empty list; unparseable lines are skipped.
pub fn read_events(path: impl AsRef<Path>) -> eyre::Result<Vec<EventLogEntry>> {
    let path = path.as_ref();
    debug!(?path, "read_events: reading log file");

    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(line, error = %e, "read_events: failed to parse line");
            }
        }
    }

    debug!(count = entries.len(), "read_events: loaded entries");
    Ok(entries)
}

/// Observer that mirrors every event into the tracing log at debug level
pub fn tracing_observer() -> impl Fn(&Event) -> eyre::Result<()> + Send + Sync + 'static {
    |event: &Event| -> eyre::Result<()> {
        let data = serde_json::to_string(event)?;
        debug!(event_type = event.event_type(), %data, "event");
        Ok(())
    }
}
