//! Switch and health-check history
//!
//! Append-only sinks for [`SwitchEvent`] and [`HealthCheckRecord`]. The
//! controller never reads these back; the in-memory window exists for
//! dashboards and tests.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;
use crate::upstream::Upstream;

/// Why a switch was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    /// The failure threshold was crossed by consecutive probe failures
    HealthCheckFailed,
    /// An operator requested the switch
    Manual,
    /// The provider reported the current upstream as dead
    ProviderError,
}

/// One switch attempt, success or failure. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchEvent {
    /// Endpoint listen port
    pub endpoint: u16,
    /// Upstream in use before the attempt
    pub old_upstream: Option<Upstream>,
    /// Candidate upstream, when acquisition got that far
    pub new_upstream: Option<Upstream>,
    /// Trigger for the attempt
    pub reason: SwitchReason,
    /// Whether the new upstream was applied
    pub success: bool,
    /// Failure detail when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the attempt completed
    pub timestamp: DateTime<Utc>,
}

/// One health-check outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    /// Endpoint listen port
    pub endpoint: u16,
    /// `server:port` of the probed upstream
    pub upstream: String,
    /// Probe outcome
    pub ok: bool,
    /// Round-trip latency when the probe produced a response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Failure detail when `ok` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the check completed
    pub timestamp: DateTime<Utc>,
}

/// Append-only sink for monitoring history.
///
/// Implementations must tolerate concurrent calls from every endpoint
/// loop; failures are theirs to log, not to surface.
pub trait HistorySink: Send + Sync {
    /// Append a switch event
    fn record_switch(&self, event: &SwitchEvent);
    /// Append a health-check record
    fn record_health_check(&self, record: &HealthCheckRecord);
}

/// Bounded in-memory history window
pub struct MemoryHistory {
    capacity: usize,
    switches: Mutex<VecDeque<SwitchEvent>>,
    checks: Mutex<VecDeque<HealthCheckRecord>>,
}

impl MemoryHistory {
    /// Create a window retaining at most `capacity` records of each kind
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            switches: Mutex::new(VecDeque::new()),
            checks: Mutex::new(VecDeque::new()),
        }
    }

    /// Snapshot of retained switch events, oldest first
    #[must_use]
    pub fn switches(&self) -> Vec<SwitchEvent> {
        self.switches.lock().iter().cloned().collect()
    }

    /// Snapshot of retained health checks, oldest first
    #[must_use]
    pub fn health_checks(&self) -> Vec<HealthCheckRecord> {
        self.checks.lock().iter().cloned().collect()
    }

    /// Retained switch events for one endpoint, oldest first
    #[must_use]
    pub fn switches_for(&self, endpoint: u16) -> Vec<SwitchEvent> {
        self.switches
            .lock()
            .iter()
            .filter(|e| e.endpoint == endpoint)
            .cloned()
            .collect()
    }

    fn push_bounded<T>(queue: &Mutex<VecDeque<T>>, capacity: usize, item: T) {
        let mut queue = queue.lock();
        if queue.len() >= capacity {
            queue.pop_front();
        }
        queue.push_back(item);
    }
}

impl HistorySink for MemoryHistory {
    fn record_switch(&self, event: &SwitchEvent) {
        Self::push_bounded(&self.switches, self.capacity, event.clone());
    }

    fn record_health_check(&self, record: &HealthCheckRecord) {
        Self::push_bounded(&self.checks, self.capacity, record.clone());
    }
}

/// Serialized line format for the JSONL sink
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum HistoryLine<'a> {
    Switch(&'a SwitchEvent),
    HealthCheck(&'a HealthCheckRecord),
}

/// Append-only JSONL file sink
pub struct JsonlHistory {
    file: Mutex<File>,
}

impl JsonlHistory {
    /// Open (or create) the history file for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn append(&self, line: &HistoryLine<'_>) {
        match serde_json::to_string(line) {
            Ok(json) => {
                let mut file = self.file.lock();
                if let Err(e) = writeln!(file, "{json}") {
                    warn!("Failed to append history record: {e}");
                }
            }
            Err(e) => warn!("Failed to serialize history record: {e}"),
        }
    }
}

impl HistorySink for JsonlHistory {
    fn record_switch(&self, event: &SwitchEvent) {
        self.append(&HistoryLine::Switch(event));
    }

    fn record_health_check(&self, record: &HealthCheckRecord) {
        self.append(&HistoryLine::HealthCheck(record));
    }
}

/// Fan a record out to several sinks
pub struct FanoutHistory {
    sinks: Vec<std::sync::Arc<dyn HistorySink>>,
}

impl FanoutHistory {
    /// Create a fanout over the given sinks
    #[must_use]
    pub fn new(sinks: Vec<std::sync::Arc<dyn HistorySink>>) -> Self {
        Self { sinks }
    }
}

impl HistorySink for FanoutHistory {
    fn record_switch(&self, event: &SwitchEvent) {
        for sink in &self.sinks {
            sink.record_switch(event);
        }
    }

    fn record_health_check(&self, record: &HealthCheckRecord) {
        for sink in &self.sinks {
            sink.record_health_check(record);
        }
    }
}
