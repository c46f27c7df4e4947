//! Bounded activity log.
//!
//! Every component appends human-readable entries here; the UI polls them
//! through `/api/log` with a `since` cursor. The ring keeps the newest 200
//! entries and nothing is persisted.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;
use time::OffsetDateTime;

const CAPACITY: usize = 200;

/// Entry categories, mirrored verbatim into the JSON projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Info,
    Ok,
    Error,
    Step,
}

#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub message: String,
    pub category: Category,
}

/// Newest-last ring of activity entries.
#[derive(Debug)]
pub struct ActivityLog {
    entries: Mutex<VecDeque<Entry>>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(CAPACITY)),
        }
    }

    pub fn log(&self, message: impl Into<String>, category: Category) {
        let entry = Entry {
            timestamp: OffsetDateTime::now_utc(),
            message: message.into(),
            category,
        };
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries strictly newer than `since`; everything when `since` is None.
    pub fn since(&self, since: Option<OffsetDateTime>) -> Vec<Entry> {
        let entries = self.entries.lock().unwrap();
        match since {
            None => entries.iter().cloned().collect(),
            Some(cursor) => entries
                .iter()
                .filter(|e| e.timestamp > cursor)
                .cloned()
                .collect(),
        }
    }
}
