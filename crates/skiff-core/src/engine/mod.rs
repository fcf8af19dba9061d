//! Engine facade: construction, restore-on-start, submission, and the
//! operation surface frontends call.

pub mod tasks;

pub use tasks::{TaskHandle, TaskSet, TaskShared};

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::coordinator::DownloadCoordinator;
use crate::error::DownloadError;
use crate::limiter::DelegatingLimiter;
use crate::naming::{DefaultFileNameResolver, Destination, FileNameResolver};
use crate::request::{DownloadRequest, Priority, Schedule, SpeedLimit};
use crate::schedule::ScheduleManager;
use crate::scheduler::Scheduler;
use crate::source::{DownloadSource, HttpDownloadSource, SourceResolver};
use crate::state::{DownloadProgress, DownloadState};
use crate::store::{now_epoch_ms, MemoryTaskStore, TaskRecord, TaskState, TaskStore};
use crate::transport::{HttpClient, HttpTransport};
use crate::writer::{FileWriterFactory, FsWriterFactory};

pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn TaskStore>>,
    transport: Option<Arc<dyn HttpTransport>>,
    writer_factory: Option<Arc<dyn FileWriterFactory>>,
    name_resolver: Option<Arc<dyn FileNameResolver>>,
    sources: Vec<Arc<dyn DownloadSource>>,
    global_limit: SpeedLimit,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            writer_factory: None,
            name_resolver: None,
            sources: Vec::new(),
            global_limit: SpeedLimit::Unlimited,
        }
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn writer_factory(mut self, factory: Arc<dyn FileWriterFactory>) -> Self {
        self.writer_factory = Some(factory);
        self
    }

    pub fn name_resolver(mut self, resolver: Arc<dyn FileNameResolver>) -> Self {
        self.name_resolver = Some(resolver);
        self
    }

    /// Registers a source ahead of the built-in HTTP catch-all.
    /// Registration order decides routing ties.
    pub fn source(mut self, source: Arc<dyn DownloadSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn global_speed_limit(mut self, limit: SpeedLimit) -> Self {
        self.global_limit = limit;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        let store: Arc<dyn TaskStore> = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryTaskStore::new()));
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpClient::new(&config)?),
        };
        let writer_factory: Arc<dyn FileWriterFactory> = self
            .writer_factory
            .unwrap_or_else(|| Arc::new(FsWriterFactory));
        let name_resolver: Arc<dyn FileNameResolver> = self
            .name_resolver
            .unwrap_or_else(|| Arc::new(DefaultFileNameResolver));

        let mut resolver = SourceResolver::new();
        for source in self.sources {
            resolver.register(source);
        }
        resolver.register(Arc::new(HttpDownloadSource::new(
            Arc::clone(&transport),
            config.clone(),
        )));
        let resolver = Arc::new(resolver);

        let tasks = Arc::new(TaskSet::new());
        let global_limiter = Arc::new(DelegatingLimiter::new(self.global_limit));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let coordinator = Arc::new(DownloadCoordinator::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&resolver),
            writer_factory,
            name_resolver,
            Arc::clone(&tasks),
            Arc::clone(&global_limiter),
            events_tx,
        ));
        let scheduler = Scheduler::new(config.clone(), Arc::clone(&tasks), Arc::clone(&coordinator));
        let event_loop = scheduler.spawn_event_loop(events_rx);
        let schedules = ScheduleManager::new(Arc::clone(&tasks), Arc::clone(&scheduler));

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config,
                store,
                tasks,
                coordinator,
                scheduler,
                schedules,
                global_limiter,
                event_loop: Mutex::new(Some(event_loop)),
            }),
        })
    }
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    tasks: Arc<TaskSet>,
    coordinator: Arc<DownloadCoordinator>,
    scheduler: Arc<Scheduler>,
    schedules: Arc<ScheduleManager>,
    global_limiter: Arc<DelegatingLimiter>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// The download engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Restores persisted tasks: queued records re-enter the queue,
    /// active-looking records resume, paused records come back as
    /// observable paused tasks awaiting an explicit `resume`.
    pub async fn start(&self) -> Result<()> {
        let records = self.inner.store.load_all().await?;
        for record in records {
            if !record.state.is_restorable() {
                continue;
            }
            if self.inner.tasks.get(&record.task_id).is_some() {
                continue;
            }
            let initial = match record.state {
                TaskState::Paused => DownloadState::Paused {
                    progress: DownloadProgress::new(
                        record.downloaded_bytes,
                        record.total_bytes,
                        0,
                    ),
                },
                _ => DownloadState::Queued,
            };
            let has_progress = record.segments.is_some();
            self.inner.tasks.register(
                record.task_id.clone(),
                record.request.clone(),
                record.created_at,
                initial,
                record.segments.clone().unwrap_or_default(),
            );
            match record.state {
                TaskState::Queued => {
                    self.inner
                        .scheduler
                        .enqueue(&record.task_id, has_progress)
                        .await;
                }
                TaskState::Pending | TaskState::Downloading => {
                    self.inner.scheduler.enqueue(&record.task_id, true).await;
                }
                TaskState::Paused => {}
                _ => {}
            }
        }
        Ok(())
    }

    /// Creates a task for the request and routes it through the schedule
    /// manager. Returns an observable handle.
    pub async fn download(&self, request: DownloadRequest) -> Result<TaskHandle, DownloadError> {
        if request.url.trim().is_empty() {
            return Err(DownloadError::unsupported("request URL is empty"));
        }
        let task_id = Uuid::new_v4().to_string();
        let created_at = now_epoch_ms();

        let record = TaskRecord::new(task_id.clone(), request.clone(), created_at);
        self.inner
            .store
            .save(&record)
            .await
            .map_err(|e| DownloadError::unknown(e.to_string()))?;

        let shared = self.inner.tasks.register(
            task_id.clone(),
            request,
            created_at,
            DownloadState::Idle,
            Vec::new(),
        );
        self.inner.schedules.schedule(&task_id, false).await;
        Ok(shared.handle())
    }

    /// Live list of task handles, re-published on membership changes.
    pub fn tasks(&self) -> watch::Receiver<Vec<TaskHandle>> {
        self.inner.tasks.handles()
    }

    pub fn task(&self, task_id: &str) -> Option<TaskHandle> {
        self.inner.tasks.get(task_id).map(|s| s.handle())
    }

    /// Pauses an active download. Returns false when the task was not
    /// actively downloading.
    pub async fn pause(&self, task_id: &str) -> Result<bool, DownloadError> {
        self.inner.coordinator.pause(task_id).await
    }

    /// Resumes a paused (or restored) task, optionally redirecting the
    /// output. Admission goes through the scheduler, so limits hold.
    pub async fn resume(
        &self,
        task_id: &str,
        new_destination: Option<String>,
    ) -> Result<bool, DownloadError> {
        if self.inner.coordinator.is_active(task_id).await {
            return Ok(true);
        }
        let record = self
            .inner
            .store
            .load(task_id)
            .await
            .map_err(|e| DownloadError::unknown(e.to_string()))?;
        let Some(mut record) = record else {
            return Ok(false);
        };

        if let Some(dest) = new_destination {
            let previous_name = record
                .output_path
                .as_deref()
                .and_then(|p| Path::new(p).file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "download.bin".to_string());
            let new_path = match Destination::classify(Some(&dest)) {
                Destination::Uri(uri) => uri,
                Destination::FullPath(path) => path.to_string_lossy().into_owned(),
                Destination::Directory(dir) => {
                    dir.join(previous_name).to_string_lossy().into_owned()
                }
                Destination::BareName(name) => self
                    .inner
                    .config
                    .default_directory
                    .join(name)
                    .to_string_lossy()
                    .into_owned(),
                Destination::Default => self
                    .inner
                    .config
                    .default_directory
                    .join(previous_name)
                    .to_string_lossy()
                    .into_owned(),
            };
            record.output_path = Some(new_path);
            record.touch();
            self.inner
                .store
                .save(&record)
                .await
                .map_err(|e| DownloadError::unknown(e.to_string()))?;
        }

        if self.inner.tasks.get(task_id).is_none() {
            self.inner.tasks.register(
                record.task_id.clone(),
                record.request.clone(),
                record.created_at,
                DownloadState::Paused {
                    progress: DownloadProgress::new(
                        record.downloaded_bytes,
                        record.total_bytes,
                        0,
                    ),
                },
                record.segments.clone().unwrap_or_default(),
            );
        }
        self.inner.scheduler.enqueue(task_id, true).await;
        Ok(true)
    }

    /// Cancels wherever the task is (scheduled, queued, or active), makes
    /// Canceled observable, and persists it before returning.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, DownloadError> {
        self.inner.schedules.cancel(task_id).await;
        // Stop the run first so a promoted task never overlaps its teardown.
        let was_active = self.inner.coordinator.cancel_active(task_id).await?;
        self.inner.scheduler.dequeue(task_id).await;

        let shared = self.inner.tasks.get(task_id);
        if let Some(shared) = &shared {
            // A terminal state reached before (or instead of) this cancel
            // stands, including a completion that raced it.
            if !was_active && shared.state().is_terminal() {
                return Ok(false);
            }
            shared.set_state(DownloadState::Canceled);
        } else if !was_active {
            return Ok(false);
        }

        if let Ok(Some(mut record)) = self.inner.store.load(task_id).await {
            record.state = TaskState::Canceled;
            record.segments = None;
            record.touch();
            self.inner
                .store
                .save(&record)
                .await
                .map_err(|e| DownloadError::unknown(e.to_string()))?;
        }
        Ok(true)
    }

    /// Cancels any run and deletes the record and resume state. The output
    /// file is left on disk.
    pub async fn remove(&self, task_id: &str) -> Result<bool, DownloadError> {
        self.inner.schedules.cancel(task_id).await;
        let _ = self.inner.coordinator.cancel_active(task_id).await?;
        self.inner.scheduler.dequeue(task_id).await;
        self.inner
            .store
            .remove(task_id)
            .await
            .map_err(|e| DownloadError::unknown(e.to_string()))?;
        Ok(self.inner.tasks.remove(task_id).is_some())
    }

    pub async fn set_priority(&self, task_id: &str, priority: Priority) {
        if let Some(shared) = self.inner.tasks.get(task_id) {
            shared.update_request(|r| r.priority = priority);
        }
        self.persist_request_change(task_id, |r| r.request.priority = priority)
            .await;
        self.inner.scheduler.set_priority(task_id, priority).await;
    }

    pub async fn set_speed_limit(&self, task_id: &str, limit: SpeedLimit) {
        if let Some(shared) = self.inner.tasks.get(task_id) {
            shared.update_request(|r| r.speed_limit = limit);
        }
        self.persist_request_change(task_id, |r| r.request.speed_limit = limit)
            .await;
        self.inner.coordinator.set_speed_limit(task_id, limit).await;
    }

    pub async fn set_connections(&self, task_id: &str, connections: u32) {
        if let Some(shared) = self.inner.tasks.get(task_id) {
            shared.update_request(|r| r.connections = connections);
        }
        self.persist_request_change(task_id, |r| r.request.connections = connections)
            .await;
        self.inner
            .coordinator
            .set_connections(task_id, connections)
            .await;
    }

    /// Replaces the schedule and defers the task anew; a running task is
    /// paused first and continues from its progress when the new schedule
    /// fires.
    pub async fn reschedule(&self, task_id: &str, schedule: Schedule) {
        if let Some(shared) = self.inner.tasks.get(task_id) {
            shared.update_request(|r| r.schedule = schedule);
        }
        self.persist_request_change(task_id, |r| r.request.schedule = schedule)
            .await;
        let _ = self.inner.coordinator.pause(task_id).await;
        self.inner.scheduler.dequeue(task_id).await;
        self.inner.schedules.reschedule(task_id).await;
    }

    /// Live update of the engine-wide speed limit.
    pub fn set_global_speed_limit(&self, limit: SpeedLimit) {
        self.inner.global_limiter.set_limit(limit);
    }

    /// Cancels waiters, the queue loop, and all active runs. Records stay
    /// as they are so tasks restore on the next start.
    pub async fn close(&self) {
        self.inner.schedules.shutdown().await;
        if let Some(event_loop) = self.inner.event_loop.lock().await.take() {
            event_loop.abort();
        }
        self.inner.coordinator.cancel_all().await;
    }

    async fn persist_request_change(&self, task_id: &str, mutate: impl FnOnce(&mut TaskRecord)) {
        match self.inner.store.load(task_id).await {
            Ok(Some(mut record)) => {
                mutate(&mut record);
                record.touch();
                if let Err(e) = self.inner.store.save(&record).await {
                    tracing::warn!(task_id = %task_id, error = %e, "request change persist failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "request change persist failed");
            }
        }
    }
}
