//! Durable task persistence.
//!
//! Stores one record per task: the original request, resolved output path,
//! lifecycle state, server identity for resume validation, and the last
//! persisted segment plan. Writes are atomic per record; no cross-record
//! transactions are needed.

mod memory;
mod sqlite;

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::request::DownloadRequest;
use crate::segment::Segment;
use crate::source::SourceResumeState;

/// Opaque stable task identifier (UUID string).
pub type TaskId = String;

/// Persisted lifecycle state, stored as TEXT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Queued,
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "QUEUED",
            TaskState::Pending => "PENDING",
            TaskState::Downloading => "DOWNLOADING",
            TaskState::Paused => "PAUSED",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "QUEUED" => TaskState::Queued,
            "PENDING" => TaskState::Pending,
            "DOWNLOADING" => TaskState::Downloading,
            "PAUSED" => TaskState::Paused,
            "COMPLETED" => TaskState::Completed,
            "CANCELED" => TaskState::Canceled,
            _ => TaskState::Failed,
        }
    }

    /// States worth re-activating or re-queuing at engine start.
    pub fn is_restorable(self) -> bool {
        matches!(
            self,
            TaskState::Queued | TaskState::Pending | TaskState::Downloading | TaskState::Paused
        )
    }
}

/// Everything the engine persists about one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub request: DownloadRequest,
    /// Stable once resolved; dedup happens at first resolution only.
    pub output_path: Option<String>,
    pub state: TaskState,
    /// -1 while unknown.
    pub total_bytes: i64,
    pub downloaded_bytes: u64,
    pub error_message: Option<String>,
    pub accept_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Last persisted segment plan.
    pub segments: Option<Vec<Segment>>,
    pub source_type: Option<String>,
    pub source_resume_state: Option<SourceResumeState>,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, request: DownloadRequest, created_at: i64) -> Self {
        Self {
            task_id,
            request,
            output_path: None,
            state: TaskState::Queued,
            total_bytes: -1,
            downloaded_bytes: 0,
            error_message: None,
            accept_ranges: false,
            etag: None,
            last_modified: None,
            segments: None,
            source_type: None,
            source_resume_state: None,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_epoch_ms();
    }
}

/// Durable key-value store over `task_id`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Upsert. A concurrent reader sees the previous or the next value,
    /// never a torn one.
    async fn save(&self, record: &TaskRecord) -> Result<()>;
    async fn load(&self, task_id: &str) -> Result<Option<TaskRecord>>;
    /// All records, ordered by `created_at`.
    async fn load_all(&self) -> Result<Vec<TaskRecord>>;
    async fn remove(&self, task_id: &str) -> Result<()>;
}

pub(crate) fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_text_roundtrip() {
        for state in [
            TaskState::Queued,
            TaskState::Pending,
            TaskState::Downloading,
            TaskState::Paused,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Canceled,
        ] {
            assert_eq!(TaskState::parse(state.as_str()), state);
        }
        assert_eq!(TaskState::parse("garbage"), TaskState::Failed);
    }

    #[test]
    fn restorable_states() {
        assert!(TaskState::Queued.is_restorable());
        assert!(TaskState::Pending.is_restorable());
        assert!(TaskState::Downloading.is_restorable());
        assert!(TaskState::Paused.is_restorable());
        assert!(!TaskState::Completed.is_restorable());
        assert!(!TaskState::Failed.is_restorable());
        assert!(!TaskState::Canceled.is_restorable());
    }

    #[test]
    fn record_json_roundtrip() {
        let mut record = TaskRecord::new(
            "t-1".into(),
            DownloadRequest::new("https://example.com/f.bin"),
            1000,
        );
        record.output_path = Some("/data/f.bin".into());
        record.state = TaskState::Paused;
        record.total_bytes = 4000;
        record.downloaded_bytes = 2000;
        record.accept_ranges = true;
        record.etag = Some("W/\"abc\"".into());
        record.segments = Some(crate::segment::calculate(4000, 4));
        record.source_type = Some("http".into());
        record.source_resume_state = Some(SourceResumeState {
            source_type: "http".into(),
            data: r#"{"etag":"W/\"abc\"","lastModified":null,"totalBytes":4000}"#.into(),
        });

        let json = serde_json::to_string(&record).unwrap();
        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, record.task_id);
        assert_eq!(back.state, TaskState::Paused);
        assert_eq!(back.total_bytes, 4000);
        assert_eq!(back.downloaded_bytes, 2000);
        assert_eq!(back.etag, record.etag);
        assert_eq!(back.segments, record.segments);
        assert_eq!(
            back.source_resume_state.as_ref().unwrap().data,
            record.source_resume_state.as_ref().unwrap().data
        );
    }
}
