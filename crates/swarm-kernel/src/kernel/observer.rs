//! Coordinator observer: a bounded flight recorder of kernel operations.
//!
//! Recording never fails and never blocks on I/O. When the buffer is full the oldest
//! event is evicted first. There is no filtering or subscription; consumers read
//! [CoordinatorObserver::recent] or flush the whole buffer to disk.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::event::CoordinatorEvent;
use crate::kernel::snapshot::write_json_atomic;
use crate::kernel::KernelError;

pub const EVENT_LOG_SCHEMA_VERSION: &str = "1.0";
pub const DEFAULT_MAX_EVENTS: usize = 500;

/// Document written by [CoordinatorObserver::flush_to_file].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventLogDocument {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub event_count: usize,
    pub events: Vec<CoordinatorEvent>,
}

pub struct CoordinatorObserver {
    max_events: usize,
    events: Mutex<VecDeque<CoordinatorEvent>>,
}

impl CoordinatorObserver {
    pub fn new(max_events: usize) -> Self {
        Self {
            max_events,
            events: Mutex::new(VecDeque::with_capacity(max_events.min(DEFAULT_MAX_EVENTS))),
        }
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    pub fn record(&self, event_type: impl Into<String>, detail: Value) {
        self.record_event(CoordinatorEvent::new(event_type, detail));
    }

    pub fn record_event(&self, event: CoordinatorEvent) {
        if self.max_events == 0 {
            return;
        }
        let mut events = self.buffer();
        while events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// The `n` most recent events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<CoordinatorEvent> {
        let events = self.buffer();
        let skip = events.len().saturating_sub(n);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    pub fn snapshot(&self) -> EventLogDocument {
        let events: Vec<CoordinatorEvent> = self.buffer().iter().cloned().collect();
        EventLogDocument {
            schema_version: EVENT_LOG_SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            event_count: events.len(),
            events,
        }
    }

    /// Writes the full buffer atomically to `path`.
    pub fn flush_to_file(&self, path: &Path) -> Result<(), KernelError> {
        write_json_atomic(path, &self.snapshot())
    }

    // A panic while holding the lock leaves the deque intact, so poisoning is ignored.
    fn buffer(&self) -> MutexGuard<'_, VecDeque<CoordinatorEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CoordinatorObserver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}
