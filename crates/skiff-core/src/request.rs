//! Download request model: what to fetch, where to put it, and how.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::schedule::DownloadCondition;
use crate::source::ResolvedSource;

/// Relative ordering of tasks in the queue. `Urgent` may preempt a running
/// lower-priority task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// When the task becomes eligible for the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Immediate,
    /// Wall-clock instant, epoch milliseconds.
    AtTime { at_epoch_ms: u64 },
    AfterDelay { delay_ms: u64 },
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Immediate
    }
}

impl Schedule {
    pub fn is_immediate(&self) -> bool {
        matches!(self, Schedule::Immediate)
    }
}

/// Per-task bandwidth cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpeedLimit {
    Unlimited,
    /// Must be > 0.
    BytesPerSec { rate: u64 },
}

impl Default for SpeedLimit {
    fn default() -> Self {
        SpeedLimit::Unlimited
    }
}

/// A request to download one resource.
///
/// `connections == 0` means "use the engine's configured default".
/// `conditions` are transient: they are not persisted, and tasks awaiting
/// them revert to queued after a restart.
#[derive(Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    /// None, a directory, a full path, a bare file name, or an opaque URI.
    /// See [`crate::naming::Destination`] for the classification rules.
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub connections: u32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Opaque passthrough for embedders.
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub speed_limit: SpeedLimit,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(skip)]
    pub conditions: Vec<Arc<dyn DownloadCondition>>,
    /// File selection for multi-file sources.
    #[serde(default)]
    pub selected_file_ids: Vec<String>,
    /// Precomputed source metadata; skips the probe when present.
    #[serde(default)]
    pub resolved_source: Option<ResolvedSource>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            destination: None,
            connections: 0,
            headers: HashMap::new(),
            properties: HashMap::new(),
            speed_limit: SpeedLimit::Unlimited,
            priority: Priority::Normal,
            schedule: Schedule::Immediate,
            conditions: Vec::new(),
            selected_file_ids: Vec::new(),
            resolved_source: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_connections(mut self, connections: u32) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_speed_limit(mut self, limit: SpeedLimit) -> Self {
        self.speed_limit = limit;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_condition(mut self, condition: Arc<dyn DownloadCondition>) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_resolved_source(mut self, resolved: ResolvedSource) -> Self {
        self.resolved_source = Some(resolved);
        self
    }
}

impl fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("url", &self.url)
            .field("destination", &self.destination)
            .field("connections", &self.connections)
            .field("priority", &self.priority)
            .field("schedule", &self.schedule)
            .field("speed_limit", &self.speed_limit)
            .field("conditions", &self.conditions.len())
            .finish_non_exhaustive()
    }
}
