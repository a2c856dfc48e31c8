//! Key lifecycle audit trail.
//!
//! Records every load, unload and rewrap outcome. The log is append-only.
//! Supports pluggable sinks for forwarding records to files or other
//! stores. Records never contain key material.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A sink that receives audit records.
pub trait AuditSink: Send {
    /// Append a record. Called for every lifecycle event.
    fn append(&mut self, record: &AuditRecord);
}

/// What happened to a dataset's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Loaded,
    /// Key verified without loading it.
    Verified,
    LoadFailed,
    Unloaded,
    UnloadFailed,
    Rewrapped,
    /// Dataset gave up its own key for its parent's.
    KeyInherited,
    RewrapFailed,
}

/// A permanent record of a key lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// The dataset acted on.
    pub dataset: String,
    pub event: AuditEvent,
    /// Material acquisitions made, including retries.
    pub attempts: u32,
    /// Error text for failed events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(dataset: &str, event: AuditEvent, attempts: u32) -> Self {
        Self {
            dataset: dataset.to_string(),
            event,
            attempts,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// An append-only log of lifecycle events.
/// Can forward records to additional sinks via `add_forward_sink`.
#[derive(Default)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records)
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to receive a copy of every record.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Append a new record to the log and forward to any attached sinks.
    pub fn append(&mut self, record: AuditRecord) {
        for sink in &mut self.forward_sinks {
            sink.append(&record);
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AuditRecord> {
        self.records.iter()
    }

    /// Most recent record, if any.
    pub fn last(&self) -> Option<&AuditRecord> {
        self.records.last()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit records as JSON lines (one per record) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: File,
}

impl FileAuditSink {
    /// Open or create a file for append-only audit logging.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: &AuditRecord) {
        let written = serde_json::to_string(record)
            .map_err(io::Error::from)
            .and_then(|line| writeln!(self.file, "{line}"))
            .and_then(|()| self.file.flush());
        if let Err(e) = written {
            tracing::warn!(dataset = %record.dataset, error = %e, "failed to write audit record");
        }
    }
}
