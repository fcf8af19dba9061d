//! Observable task state, published on a per-task watch stream.

use serde::{Deserialize, Serialize};

use crate::error::DownloadError;
use crate::request::Schedule;

/// Progress snapshot for a running or paused download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    /// -1 when the total is unknown.
    pub total_bytes: i64,
    pub bytes_per_second: u64,
}

impl DownloadProgress {
    pub fn new(downloaded_bytes: u64, total_bytes: i64, bytes_per_second: u64) -> Self {
        Self { downloaded_bytes, total_bytes, bytes_per_second }
    }
}

/// The state a task presents to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadState {
    Idle,
    Scheduled { schedule: Schedule },
    Queued,
    Pending,
    Downloading { progress: DownloadProgress },
    Paused { progress: DownloadProgress },
    Completed { path: String },
    Failed { error: DownloadError },
    Canceled,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed { .. } | DownloadState::Failed { .. } | DownloadState::Canceled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, DownloadState::Pending | DownloadState::Downloading { .. })
    }
}
