//! Per-task lifecycle driver.
//!
//! The coordinator owns every active run: it resolves the source, settles
//! the output path, opens the writer, wires the source context (throttle,
//! progress, segment publisher, cancellation), and drives the source
//! through the retry loop. Pause/cancel propagate through structured
//! cancellation; user-visible state lands in the store before those
//! operations return.

mod progress;
mod retry;

pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::engine::tasks::{TaskSet, TaskShared};
use crate::error::DownloadError;
use crate::limiter::{DelegatingLimiter, SpeedLimiter};
use crate::naming::{dedup_path, Destination, FileNameResolver};
use crate::request::{DownloadRequest, SpeedLimit};
use crate::segment::downloaded_total;
use crate::source::{
    DownloadSource, ResolvedSource, SourceContext, SourceResolver, SourceResumeState, ThrottleFn,
};
use crate::state::{DownloadProgress, DownloadState};
use crate::store::{TaskId, TaskRecord, TaskState, TaskStore};
use crate::writer::{FileWriter, FileWriterFactory};

/// Notifications the scheduler consumes to free slots and promote queued
/// tasks.
#[derive(Debug)]
pub enum CoordinatorEvent {
    RunEnded { task_id: TaskId },
}

struct ActiveDownload {
    cancel: CancellationToken,
    limiter: Arc<DelegatingLimiter>,
    max_conn_tx: watch::Sender<u32>,
    pending_resegment: Arc<AtomicU32>,
    writer: StdMutex<Option<Arc<dyn FileWriter>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

enum RunMode {
    Fresh,
    Resume(Box<TaskRecord>),
}

pub struct DownloadCoordinator {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    resolver: Arc<SourceResolver>,
    writers: Arc<dyn FileWriterFactory>,
    names: Arc<dyn FileNameResolver>,
    tasks: Arc<TaskSet>,
    global_limiter: Arc<DelegatingLimiter>,
    active: Mutex<HashMap<TaskId, Arc<ActiveDownload>>>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl DownloadCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        resolver: Arc<SourceResolver>,
        writers: Arc<dyn FileWriterFactory>,
        names: Arc<dyn FileNameResolver>,
        tasks: Arc<TaskSet>,
        global_limiter: Arc<DelegatingLimiter>,
        events: mpsc::UnboundedSender<CoordinatorEvent>,
    ) -> Self {
        Self {
            config,
            store,
            resolver,
            writers,
            names,
            tasks,
            global_limiter,
            active: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub async fn is_active(&self, task_id: &str) -> bool {
        self.active.lock().await.contains_key(task_id)
    }

    /// Starts a fresh run. No-op when the task is already active.
    pub async fn start(self: &Arc<Self>, task_id: &str) -> Result<(), DownloadError> {
        let shared = self
            .tasks
            .get(task_id)
            .ok_or_else(|| DownloadError::unknown(format!("unknown task {}", task_id)))?;
        self.launch(shared, RunMode::Fresh).await;
        Ok(())
    }

    /// Resumes from the persisted record. Returns false when there is no
    /// resumable state (caller falls back to a fresh start); true when the
    /// task is now (or already was) active.
    pub async fn resume(self: &Arc<Self>, task_id: &str) -> Result<bool, DownloadError> {
        if self.is_active(task_id).await {
            return Ok(true);
        }
        let record = self
            .store
            .load(task_id)
            .await
            .map_err(|e| DownloadError::unknown(e.to_string()))?
            .ok_or_else(|| DownloadError::unknown(format!("no record for task {}", task_id)))?;
        if record.segments.is_none() || record.output_path.is_none() {
            return Ok(false);
        }
        let shared = self
            .tasks
            .get(task_id)
            .ok_or_else(|| DownloadError::unknown(format!("unknown task {}", task_id)))?;
        self.launch(shared, RunMode::Resume(Box::new(record))).await;
        Ok(true)
    }

    async fn launch(self: &Arc<Self>, shared: Arc<TaskShared>, mode: RunMode) {
        let task_id = shared.task_id.clone();
        let mut active = self.active.lock().await;
        if active.contains_key(&task_id) {
            return;
        }
        let entry = Arc::new(ActiveDownload {
            cancel: CancellationToken::new(),
            limiter: Arc::new(DelegatingLimiter::new(shared.request().speed_limit)),
            max_conn_tx: watch::Sender::new(0),
            pending_resegment: Arc::new(AtomicU32::new(0)),
            writer: StdMutex::new(None),
            join: Mutex::new(None),
        });
        active.insert(task_id.clone(), Arc::clone(&entry));
        drop(active);

        let this = Arc::clone(self);
        let run_entry = Arc::clone(&entry);
        let handle = tokio::spawn(async move {
            this.run_task(shared, run_entry, mode).await;
        });
        *entry.join.lock().await = Some(handle);
    }

    async fn run_task(self: Arc<Self>, shared: Arc<TaskShared>, entry: Arc<ActiveDownload>, mode: RunMode) {
        let task_id = shared.task_id.clone();
        let result = match mode {
            RunMode::Fresh => self.run_fresh(&shared, &entry).await,
            RunMode::Resume(record) => self.run_resume(&shared, &entry, *record).await,
        };

        match result {
            Ok(()) => {}
            Err(DownloadError::Canceled) => {
                // pause() publishes Paused before cancelling; leave it be.
                // Everything else cancelled lands in Canceled ("cancel
                // wins" when racing a failing retry).
                if !matches!(shared.state(), DownloadState::Paused { .. }) {
                    shared.set_state(DownloadState::Canceled);
                }
                tracing::info!(task_id = %task_id, "download run cancelled");
            }
            Err(error) => {
                tracing::warn!(task_id = %task_id, error = %error, "download failed");
                shared.set_state(DownloadState::Failed { error: error.clone() });
                // Keep the segment plan so a later fresh start can reuse
                // whatever the coordinator decides to keep.
                if let Ok(Some(mut record)) = self.store.load(&task_id).await {
                    record.state = TaskState::Failed;
                    record.error_message = Some(error.to_string());
                    let segments = shared.segments();
                    if !segments.is_empty() {
                        record.downloaded_bytes = downloaded_total(&segments);
                        record.segments = Some(segments);
                    }
                    record.touch();
                    if let Err(e) = self.store.save(&record).await {
                        tracing::warn!(task_id = %task_id, error = %e, "failed-state persist failed");
                    }
                }
            }
        }

        // Teardown: flush and close the writer even when cancelled; an
        // in-flight write_at completes before close, the file is never
        // truncated.
        let writer = entry.writer.lock().unwrap().take();
        if let Some(writer) = writer {
            let _ = writer.flush().await;
            writer.close().await;
        }
        self.active.lock().await.remove(&task_id);
        let _ = self.events.send(CoordinatorEvent::RunEnded { task_id });
    }

    async fn run_fresh(
        &self,
        shared: &Arc<TaskShared>,
        entry: &Arc<ActiveDownload>,
    ) -> Result<(), DownloadError> {
        let task_id = &shared.task_id;
        let request = shared.request();
        shared.set_state(DownloadState::Pending);

        let mut record = match self.store.load(task_id).await {
            Ok(Some(record)) => record,
            _ => TaskRecord::new(task_id.clone(), request.clone(), shared.created_at),
        };
        record.state = TaskState::Pending;
        record.output_path = tentative_output_path(&self.config, &request);
        record.touch();
        self.save_logged(&record).await;

        let source = self.source_for(&request)?;
        let resolved = match request.resolved_source.clone() {
            Some(resolved) => resolved,
            None => source.resolve(&request.url, &request.headers).await?,
        };

        let output = self.settle_output_path(&request, &resolved, true);
        tracing::info!(task_id = %task_id, output = %output, total = resolved.total_bytes, "starting download");

        record.output_path = Some(output.clone());
        record.state = TaskState::Downloading;
        record.total_bytes = resolved.total_bytes;
        record.accept_ranges = resolved.supports_resume;
        record.etag = resolved.metadata.get("etag").cloned();
        record.last_modified = resolved.metadata.get("lastModified").cloned();
        record.source_type = Some(source.source_type().to_string());
        record.touch();
        self.save_logged(&record).await;

        shared.set_state(DownloadState::Downloading {
            progress: DownloadProgress::new(0, resolved.total_bytes, 0),
        });

        let writer = self.open_writer(&output)?;
        *entry.writer.lock().unwrap() = Some(Arc::clone(&writer));

        let ctx = Arc::new(self.build_context(shared, entry, &request, writer, Some(resolved.clone())));
        let result = self.drive(shared, entry, &source, &ctx, |source, ctx| {
            let source = Arc::clone(source);
            let ctx = Arc::clone(ctx);
            async move { source.download(&ctx).await }
        })
        .await;
        result?;

        let resume_state = source.build_resume_state(&resolved);
        self.finish_success(shared, entry, &output, resume_state).await
    }

    async fn run_resume(
        &self,
        shared: &Arc<TaskShared>,
        entry: &Arc<ActiveDownload>,
        record: TaskRecord,
    ) -> Result<(), DownloadError> {
        let task_id = &shared.task_id;
        let request = record.request.clone();
        let segments = record.segments.clone().unwrap_or_default();
        let output = record
            .output_path
            .clone()
            .ok_or_else(|| DownloadError::unknown("record has no output path"))?;

        shared.set_state(DownloadState::Pending);
        shared.set_segments(segments.clone());

        let source = match record.source_type.as_deref() {
            Some(tag) => self
                .resolver
                .resolve_by_type(tag)
                .ok_or_else(|| DownloadError::unsupported(format!("no source of type {:?}", tag)))?,
            None => self.resolver.resolve_for_url(&request.url)?,
        };

        let resume_state = match record.source_resume_state.clone() {
            Some(state) => state,
            // Reconstruct HTTP identity from the record when the source
            // never stored its own blob.
            None => SourceResumeState {
                source_type: source.source_type().to_string(),
                data: serde_json::json!({
                    "etag": record.etag,
                    "lastModified": record.last_modified,
                    "totalBytes": record.total_bytes,
                })
                .to_string(),
            },
        };

        let mut updated = record;
        updated.state = TaskState::Downloading;
        updated.touch();
        self.save_logged(&updated).await;

        tracing::info!(
            task_id = %task_id,
            downloaded = downloaded_total(&segments),
            total = updated.total_bytes,
            "resuming download"
        );
        shared.set_state(DownloadState::Downloading {
            progress: DownloadProgress::new(downloaded_total(&segments), updated.total_bytes, 0),
        });

        let writer = self.open_writer(&output)?;
        *entry.writer.lock().unwrap() = Some(Arc::clone(&writer));

        let ctx = Arc::new(self.build_context(shared, entry, &request, writer, None));
        let result = self.drive(shared, entry, &source, &ctx, move |source, ctx| {
            let source = Arc::clone(source);
            let ctx = Arc::clone(ctx);
            let state = resume_state.clone();
            async move { source.resume(&ctx, state).await }
        })
        .await;
        result?;

        // The stored identity is still valid; keep the existing blob.
        self.finish_success(shared, entry, &output, None).await
    }

    /// Runs one attempt factory through the retry loop with the progress
    /// save loop alive alongside.
    async fn drive<F, Fut>(
        &self,
        shared: &Arc<TaskShared>,
        entry: &Arc<ActiveDownload>,
        source: &Arc<dyn DownloadSource>,
        ctx: &Arc<SourceContext>,
        mut attempt: F,
    ) -> Result<(), DownloadError>
    where
        F: FnMut(&Arc<dyn DownloadSource>, &Arc<SourceContext>) -> Fut,
        Fut: std::future::Future<Output = Result<(), DownloadError>>,
    {
        let save_stop = CancellationToken::new();
        let save_task = tokio::spawn(progress::run_save_loop(
            Arc::clone(&self.store),
            Arc::clone(shared),
            Duration::from_millis(self.config.save_interval_ms),
            save_stop.clone(),
        ));

        let policy = RetryPolicy::from_config(&self.config);
        let result = policy
            .run(&entry.cancel, || attempt(source, ctx))
            .await;

        save_stop.cancel();
        let _ = save_task.await;
        result
    }

    async fn finish_success(
        &self,
        shared: &Arc<TaskShared>,
        entry: &Arc<ActiveDownload>,
        output: &str,
        resume_state: Option<SourceResumeState>,
    ) -> Result<(), DownloadError> {
        let writer = entry.writer.lock().unwrap().clone();
        if let Some(writer) = writer {
            writer
                .flush()
                .await
                .map_err(|e| DownloadError::disk(e.to_string()))?;
        }

        let segments = shared.segments();
        if let Ok(Some(mut record)) = self.store.load(&shared.task_id).await {
            record.state = TaskState::Completed;
            record.downloaded_bytes = downloaded_total(&segments);
            if !segments.is_empty() {
                record.segments = Some(segments);
            }
            if resume_state.is_some() {
                record.source_resume_state = resume_state;
            }
            record.error_message = None;
            record.touch();
            self.save_logged(&record).await;
        }

        tracing::info!(task_id = %shared.task_id, output = %output, "download completed");
        shared.set_state(DownloadState::Completed { path: output.to_string() });
        Ok(())
    }

    /// Pauses an active run: Paused is observable and persisted (with the
    /// segment snapshot) before this returns. Returns false when the task
    /// was not active.
    pub async fn pause(&self, task_id: &str) -> Result<bool, DownloadError> {
        let entry = self.active.lock().await.remove(task_id);
        let Some(entry) = entry else {
            return Ok(false);
        };
        let shared = self
            .tasks
            .get(task_id)
            .ok_or_else(|| DownloadError::unknown(format!("unknown task {}", task_id)))?;
        if shared.state().is_terminal() {
            return Ok(false);
        }

        // The segments flow is the source of truth for progress.
        let segments = shared.segments();
        let downloaded = downloaded_total(&segments);
        let record = self.store.load(task_id).await.ok().flatten();
        let total = record.as_ref().map(|r| r.total_bytes).unwrap_or(-1);

        // State first, then cancel, so the run's cancellation handler
        // cannot overwrite Paused with Canceled.
        shared.set_state(DownloadState::Paused {
            progress: DownloadProgress::new(downloaded, total, 0),
        });
        entry.cancel.cancel();
        let join = entry.join.lock().await.take();
        if let Some(join) = join {
            let _ = join.await;
        }
        // The run may have completed before the cancel landed; completion
        // wins and the record already says COMPLETED.
        if matches!(shared.state(), DownloadState::Completed { .. }) {
            return Ok(false);
        }

        if let Some(mut record) = record {
            record.state = TaskState::Paused;
            record.downloaded_bytes = downloaded;
            if !segments.is_empty() {
                record.segments = Some(segments);
            }
            record.touch();
            self.store
                .save(&record)
                .await
                .map_err(|e| DownloadError::unknown(e.to_string()))?;
        }

        // Best-effort flush; the run teardown normally flushed already.
        let writer = entry.writer.lock().unwrap().clone();
        if let Some(writer) = writer {
            let _ = writer.flush().await;
        }
        tracing::info!(task_id = %task_id, downloaded, "download paused");
        Ok(true)
    }

    /// Cancels an active run and waits for its teardown. Returns false when
    /// the task was not active. Persisting CANCELED is the engine's job.
    pub async fn cancel_active(&self, task_id: &str) -> Result<bool, DownloadError> {
        let entry = self.active.lock().await.remove(task_id);
        let Some(entry) = entry else {
            return Ok(false);
        };
        entry.cancel.cancel();
        let join = entry.join.lock().await.take();
        if let Some(join) = join {
            let _ = join.await;
        }
        if let Some(shared) = self.tasks.get(task_id) {
            // Completion that raced the cancel stands.
            if matches!(shared.state(), DownloadState::Completed { .. }) {
                return Ok(false);
            }
            shared.set_state(DownloadState::Canceled);
        }
        Ok(true)
    }

    /// Cancels every active run (engine shutdown). Observable state and
    /// records are left as they are so the tasks restore on next start.
    pub async fn cancel_all(&self) {
        let entries: Vec<(TaskId, Arc<ActiveDownload>)> =
            self.active.lock().await.drain().collect();
        for (task_id, entry) in entries {
            entry.cancel.cancel();
            let join = entry.join.lock().await.take();
            if let Some(join) = join {
                let _ = join.await;
            }
            tracing::debug!(task_id = %task_id, "run cancelled for shutdown");
        }
    }

    /// Applies a new speed limit to the active run, if any.
    pub async fn set_speed_limit(&self, task_id: &str, limit: SpeedLimit) -> bool {
        let entry = self.active.lock().await.get(task_id).cloned();
        match entry {
            Some(entry) => {
                entry.limiter.set_limit(limit);
                true
            }
            None => false,
        }
    }

    /// Signals a new target connection count to the active run. The source
    /// sees `pending_resegment` before the watch value, so it can tell the
    /// following batch cancellation apart from an external cancel.
    pub async fn set_connections(&self, task_id: &str, connections: u32) -> bool {
        let entry = self.active.lock().await.get(task_id).cloned();
        match entry {
            Some(entry) => {
                entry.pending_resegment.fetch_add(1, Ordering::SeqCst);
                entry.max_conn_tx.send_replace(connections);
                true
            }
            None => false,
        }
    }

    fn source_for(&self, request: &DownloadRequest) -> Result<Arc<dyn DownloadSource>, DownloadError> {
        match &request.resolved_source {
            Some(resolved) => self
                .resolver
                .resolve_by_type(&resolved.source_type)
                .ok_or_else(|| {
                    DownloadError::unsupported(format!(
                        "no source of type {:?}",
                        resolved.source_type
                    ))
                }),
            None => self.resolver.resolve_for_url(&request.url),
        }
    }

    fn open_writer(&self, output: &str) -> Result<Arc<dyn FileWriter>, DownloadError> {
        self.writers.open(output).map_err(|e| {
            if e.kind() == std::io::ErrorKind::Unsupported {
                DownloadError::unsupported(e.to_string())
            } else {
                DownloadError::disk(e.to_string())
            }
        })
    }

    fn build_context(
        &self,
        shared: &Arc<TaskShared>,
        entry: &Arc<ActiveDownload>,
        request: &DownloadRequest,
        writer: Arc<dyn FileWriter>,
        pre_resolved: Option<ResolvedSource>,
    ) -> SourceContext {
        let task_limiter = Arc::clone(&entry.limiter);
        let global_limiter = Arc::clone(&self.global_limiter);
        let throttle: ThrottleFn = Arc::new(move |bytes| {
            let task = Arc::clone(&task_limiter);
            let global = Arc::clone(&global_limiter);
            Box::pin(async move {
                task.acquire(bytes).await;
                global.acquire(bytes).await;
            })
        });

        let tracker = Arc::new(progress::ProgressTracker::new(
            shared.state_sender(),
            Duration::from_millis(self.config.progress_interval_ms),
        ));
        let on_progress = Arc::new(move |downloaded: u64, total: u64| {
            tracker.update(downloaded, total);
        });

        SourceContext {
            task_id: shared.task_id.clone(),
            url: request.url.clone(),
            request: request.clone(),
            headers: request.headers.clone(),
            writer,
            segments: shared.segments_sender(),
            on_progress,
            throttle,
            pre_resolved,
            max_connections: entry.max_conn_tx.subscribe(),
            pending_resegment: Arc::clone(&entry.pending_resegment),
            cancel: entry.cancel.child_token(),
        }
    }

    /// Output path before resolution: the destination directory (or the
    /// literal path) so the record is never without a hint.
    fn settle_output_path(
        &self,
        request: &DownloadRequest,
        resolved: &ResolvedSource,
        fresh: bool,
    ) -> String {
        let path = match Destination::classify(request.destination.as_deref()) {
            Destination::Uri(uri) => return uri,
            Destination::FullPath(path) => return path.to_string_lossy().into_owned(),
            Destination::Directory(dir) => dir.join(self.names.resolve(request, resolved)),
            Destination::Default | Destination::BareName(_) => self
                .config
                .default_directory
                .join(self.names.resolve(request, resolved)),
        };
        let path = if fresh { dedup_path(&path) } else { path };
        path.to_string_lossy().into_owned()
    }

    async fn save_logged(&self, record: &TaskRecord) {
        if let Err(e) = self.store.save(record).await {
            tracing::warn!(task_id = %record.task_id, error = %e, "task record save failed");
        }
    }
}

fn tentative_output_path(config: &EngineConfig, request: &DownloadRequest) -> Option<String> {
    let path: PathBuf = match Destination::classify(request.destination.as_deref()) {
        Destination::Uri(uri) => return Some(uri),
        Destination::FullPath(path) => path,
        Destination::Directory(dir) => dir,
        Destination::BareName(name) => config.default_directory.join(name),
        Destination::Default => config.default_directory.clone(),
    };
    Some(path.to_string_lossy().into_owned())
}
