//! Append-only reading store.
//!
//! Provides a thread-safe, insertion-ordered table of decoded readings with:
//! - Auto-incrementing record ids
//! - Immutable rows (no updates or deletes)
//! - A most-recent-N query returned oldest first
//!
//! Storage mechanics beyond this read/write contract are a collaborator
//! concern; swapping in an embedded database stays behind the same two calls.

use crate::protocol::{Measurement, Reading};
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::trace;

/// Format used when rendering record timestamps, second resolution.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A persisted reading plus its identity and mode tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    pub id: u64,
    pub timestamp: DateTime<Local>,
    pub measurement: Measurement,
}

impl Record {
    /// Timestamp rendered at second resolution.
    pub fn timestamp_display(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Thread-safe append-only store of sensor readings.
pub struct Store {
    rows: RwLock<Vec<Record>>,
    next_id: AtomicU64,
}

impl Store {
    /// Create a new empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Append a reading, returning the id assigned to it.
    pub fn append(&self, reading: Reading) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = Record {
            id,
            timestamp: reading.timestamp,
            measurement: reading.measurement,
        };

        let mut rows = self.rows.write().unwrap();
        rows.push(record);

        trace!(id, mode = record.measurement.mode(), "Record appended");
        id
    }

    /// Fetch up to `limit` of the most recent records, oldest first.
    pub fn fetch_recent(&self, limit: usize) -> Vec<Record> {
        let rows = self.rows.read().unwrap();
        let start = rows.len().saturating_sub(limit);
        rows[start..].to_vec()
    }

    /// Number of records stored.
    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    /// Check whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
