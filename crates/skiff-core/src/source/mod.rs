//! Download source plug-ins.
//!
//! A source knows how to resolve a URL into downloadable metadata and how
//! to drive the transfer itself (fresh or resumed) against the context the
//! coordinator hands it. The engine ships the segmented HTTP source;
//! embedders register additional sources (FTP, torrent, HLS) through the
//! same trait.

pub mod http;
mod resolver;

pub use http::HttpDownloadSource;
pub use resolver::SourceResolver;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::request::DownloadRequest;
use crate::segment::Segment;
use crate::store::TaskId;
use crate::writer::FileWriter;

/// How `files` of a multi-file source may be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SelectionMode {
    Multiple,
    Single,
}

/// One entry of a multi-file source (torrent file, playlist variant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    /// -1 when unknown.
    pub size: i64,
}

/// Result of resolving a URL: everything needed to plan the download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub url: String,
    pub source_type: String,
    /// -1 when the total size is unknown.
    pub total_bytes: i64,
    pub supports_resume: bool,
    pub suggested_file_name: Option<String>,
    /// At least 1.
    pub max_segments: u32,
    /// Source-specific string metadata. The HTTP source stores `etag`,
    /// `lastModified`, and `acceptRanges`.
    pub metadata: HashMap<String, String>,
    pub files: Vec<RemoteFile>,
    pub selection_mode: SelectionMode,
}

impl ResolvedSource {
    pub fn new(url: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source_type: source_type.into(),
            total_bytes: -1,
            supports_resume: false,
            suggested_file_name: None,
            max_segments: 1,
            metadata: HashMap::new(),
            files: Vec::new(),
            selection_mode: SelectionMode::Single,
        }
    }
}

/// Opaque, source-chosen resume blob the store persists alongside the
/// segment plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceResumeState {
    pub source_type: String,
    /// JSON string in a format private to the source.
    pub data: String,
}

/// Progress callback: `(downloaded_bytes, total_bytes)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Bandwidth gate: resolves once the given byte count may move.
pub type ThrottleFn = Arc<dyn Fn(u64) -> BoxFuture<'static, ()> + Send + Sync>;

/// Everything a source gets from the coordinator for one run.
pub struct SourceContext {
    pub task_id: TaskId,
    pub url: String,
    pub request: DownloadRequest,
    pub headers: HashMap<String, String>,
    pub writer: Arc<dyn FileWriter>,
    /// Live segment plan, observable by UIs and snapshotted on pause.
    pub segments: Arc<watch::Sender<Vec<Segment>>>,
    pub on_progress: ProgressFn,
    /// Must be awaited before every write, with the chunk length.
    pub throttle: ThrottleFn,
    /// Already-resolved metadata; skips the probe when present.
    pub pre_resolved: Option<ResolvedSource>,
    /// Positive values override `request.connections` live.
    pub max_connections: watch::Receiver<u32>,
    /// Incremented by the coordinator before a connection-count change so
    /// the source can tell a re-segmentation apart from an external cancel.
    pub pending_resegment: Arc<AtomicU32>,
    pub cancel: CancellationToken,
}

impl SourceContext {
    pub fn publish_segments(&self, plan: Vec<Segment>) {
        self.segments.send_replace(plan);
    }

    pub fn current_segments(&self) -> Vec<Segment> {
        self.segments.borrow().clone()
    }
}

impl std::fmt::Debug for dyn DownloadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadSource")
            .field("source_type", &self.source_type())
            .finish()
    }
}

/// A protocol implementation the engine can route downloads through.
#[async_trait]
pub trait DownloadSource: Send + Sync {
    /// Stable tag persisted in task records (e.g. `"http"`).
    fn source_type(&self) -> &'static str;

    fn can_handle(&self, url: &str) -> bool;

    async fn resolve(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<ResolvedSource, DownloadError>;

    async fn download(&self, ctx: &SourceContext) -> Result<(), DownloadError>;

    async fn resume(
        &self,
        ctx: &SourceContext,
        state: SourceResumeState,
    ) -> Result<(), DownloadError>;

    /// Resume blob to persist for a resolved download, if the source
    /// supports resuming at all.
    fn build_resume_state(&self, resolved: &ResolvedSource) -> Option<SourceResumeState>;
}
